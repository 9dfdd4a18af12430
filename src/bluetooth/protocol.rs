// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Pump command definitions and parameter encoding.

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, Timelike};

use crate::error::SessionError;

/// Command codes, shared by requests and their replies.
pub mod codes {
    pub const BOLUS_STOP: u16 = 0x0101;
    pub const BOLUS_START: u16 = 0x0102;
    pub const BOLUS_PROGRESS: u16 = 0x0202;
    pub const BOLUS_FINISHED: u16 = 0x0203;
    pub const STATUS_TEMP_BASAL: u16 = 0x0205;
    pub const STATUS_EXTENDED_BOLUS: u16 = 0x0207;
    pub const STATUS_BASIC: u16 = 0x020A;
    pub const TEMP_BASAL_START: u16 = 0x0401;
    pub const CARBS_ENTRY: u16 = 0x0402;
    pub const TEMP_BASAL_STOP: u16 = 0x0403;
    pub const EXTENDED_BOLUS_STOP: u16 = 0x0406;
    pub const EXTENDED_BOLUS_START: u16 = 0x0407;
    pub const COMM_START: u16 = 0x3001;
    pub const COMM_STOP: u16 = 0x3002;
    pub const HISTORY_DONE: u16 = 0x31F1;
    pub const SET_TIME: u16 = 0x3301;
    pub const SET_BASAL_PROFILE: u16 = 0x3302;
    pub const SET_USER_OPTIONS: u16 = 0x330B;
    pub const ACTIVATE_BASAL_PROFILE: u16 = 0x330C;
    pub const APS_TEMP_BASAL_START: u16 = 0xE002;
    pub const HISTORY_EVENTS: u16 = 0xE003;
    pub const CHECK_VALUE: u16 = 0xF0F1;
}

/// History record categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    Alarm,
    BasalHour,
    Bolus,
    Carbohydrate,
    DailyInsulin,
    Error,
    Glucose,
    Refill,
    Suspend,
}

impl RecordType {
    pub const ALL: [RecordType; 9] = [
        RecordType::Alarm,
        RecordType::BasalHour,
        RecordType::Bolus,
        RecordType::Carbohydrate,
        RecordType::DailyInsulin,
        RecordType::Error,
        RecordType::Glucose,
        RecordType::Refill,
        RecordType::Suspend,
    ];

    /// Parse the external record type identifier.
    pub fn from_code(code: u8) -> Result<Self, SessionError> {
        match code {
            0x01 => Ok(Self::Bolus),
            0x02 => Ok(Self::DailyInsulin),
            0x04 => Ok(Self::Error),
            0x05 => Ok(Self::Alarm),
            0x06 => Ok(Self::Glucose),
            0x08 => Ok(Self::Carbohydrate),
            0x09 => Ok(Self::Refill),
            0x0B => Ok(Self::Suspend),
            0x0C => Ok(Self::BasalHour),
            other => Err(SessionError::UnknownRecordType(other)),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Bolus => 0x01,
            Self::DailyInsulin => 0x02,
            Self::Error => 0x04,
            Self::Alarm => 0x05,
            Self::Glucose => 0x06,
            Self::Carbohydrate => 0x08,
            Self::Refill => 0x09,
            Self::Suspend => 0x0B,
            Self::BasalHour => 0x0C,
        }
    }

    /// Command code of the history request for this category. Records of
    /// the category come back under the same code.
    pub fn history_command(&self) -> u16 {
        match self {
            Self::Bolus => 0x3101,
            Self::DailyInsulin => 0x3102,
            Self::Glucose => 0x3104,
            Self::Alarm => 0x3105,
            Self::Error => 0x3106,
            Self::Carbohydrate => 0x3107,
            Self::Refill => 0x3108,
            Self::Suspend => 0x3109,
            Self::BasalHour => 0x310A,
        }
    }

    pub fn from_history_command(code: u16) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|rt| rt.history_command() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alarm => "alarm",
            Self::BasalHour => "basal-hour",
            Self::Bolus => "bolus",
            Self::Carbohydrate => "carbohydrate",
            Self::DailyInsulin => "daily-insulin",
            Self::Error => "error",
            Self::Glucose => "glucose",
            Self::Refill => "refill",
            Self::Suspend => "suspend",
        }
    }
}

/// A history record received from the pump.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    /// `None` for records of the incremental event download.
    pub category: Option<RecordType>,
    pub at: Option<NaiveDateTime>,
    pub value: u16,
    pub payload: Vec<u8>,
}

/// Duration selector of the APS temporary basal command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApsDuration {
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
}

impl ApsDuration {
    pub fn from_minutes(minutes: u32) -> Result<Self, SessionError> {
        match minutes {
            15 => Ok(Self::FifteenMinutes),
            30 => Ok(Self::ThirtyMinutes),
            60 => Ok(Self::OneHour),
            _ => Err(SessionError::invalid(format!(
                "unsupported temporary basal duration: {} min",
                minutes
            ))),
        }
    }

    fn param(&self) -> u8 {
        match self {
            Self::FifteenMinutes => 160,
            Self::ThirtyMinutes => 150,
            Self::OneHour => 1,
        }
    }
}

/// Hourly basal rates in U/h.
#[derive(Debug, Clone, PartialEq)]
pub struct BasalProfile {
    pub rates: [f64; 24],
}

impl BasalProfile {
    pub fn flat(rate: f64) -> Self {
        Self { rates: [rate; 24] }
    }
}

/// Pump user settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserOptions {
    pub time_display_24h: bool,
    pub button_scroll: bool,
    /// 1 = sound, 2 = vibrate, 3 = both.
    pub beep_and_alarm: u8,
    pub lcd_on_secs: u8,
    pub backlight_on_secs: u8,
    pub language: u8,
    pub units_mmol: bool,
    pub shutdown_hours: u8,
    pub low_reservoir_units: u8,
}

impl Default for UserOptions {
    fn default() -> Self {
        Self {
            time_display_24h: true,
            button_scroll: false,
            beep_and_alarm: 1,
            lcd_on_secs: 15,
            backlight_on_secs: 15,
            language: 1,
            units_mmol: false,
            shutdown_hours: 0,
            low_reservoir_units: 20,
        }
    }
}

/// Commands sent to the pump.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Handshake request; the reply carries model and protocol.
    CheckValue,
    BolusStart { amount: f64 },
    BolusStop,
    CarbsEntry { at: DateTime<Local>, grams: u16 },
    CommStart,
    CommStop,
    HistoryRequest(RecordType),
    HistoryEvents { since: Option<DateTime<Local>> },
    TempBasalStart { percent: u8, hours: u8 },
    ApsTempBasalStart { percent: u16, duration: ApsDuration },
    TempBasalStop,
    ExtendedBolusStart { units: f64, half_hours: u8 },
    ExtendedBolusStop,
    SetTime(DateTime<Local>),
    SetBasalProfile { index: u8, profile: BasalProfile },
    ActivateBasalProfile { index: u8 },
    SetUserOptions(UserOptions),
    StatusBasic,
    StatusTempBasal,
    StatusExtendedBolus,
}

impl Command {
    pub fn code(&self) -> u16 {
        match self {
            Self::CheckValue => codes::CHECK_VALUE,
            Self::BolusStart { .. } => codes::BOLUS_START,
            Self::BolusStop => codes::BOLUS_STOP,
            Self::CarbsEntry { .. } => codes::CARBS_ENTRY,
            Self::CommStart => codes::COMM_START,
            Self::CommStop => codes::COMM_STOP,
            Self::HistoryRequest(rt) => rt.history_command(),
            Self::HistoryEvents { .. } => codes::HISTORY_EVENTS,
            Self::TempBasalStart { .. } => codes::TEMP_BASAL_START,
            Self::ApsTempBasalStart { .. } => codes::APS_TEMP_BASAL_START,
            Self::TempBasalStop => codes::TEMP_BASAL_STOP,
            Self::ExtendedBolusStart { .. } => codes::EXTENDED_BOLUS_START,
            Self::ExtendedBolusStop => codes::EXTENDED_BOLUS_STOP,
            Self::SetTime(_) => codes::SET_TIME,
            Self::SetBasalProfile { .. } => codes::SET_BASAL_PROFILE,
            Self::ActivateBasalProfile { .. } => codes::ACTIVATE_BASAL_PROFILE,
            Self::SetUserOptions(_) => codes::SET_USER_OPTIONS,
            Self::StatusBasic => codes::STATUS_BASIC,
            Self::StatusTempBasal => codes::STATUS_TEMP_BASAL,
            Self::StatusExtendedBolus => codes::STATUS_EXTENDED_BOLUS,
        }
    }

    /// Encode the command parameters. Multi-byte values are big-endian;
    /// insulin amounts travel as hundredths of a unit.
    pub fn params(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::BolusStart { amount } => push_units(&mut out, *amount),
            Self::CarbsEntry { at, grams } => {
                push_date_minutes(&mut out, at);
                out.extend_from_slice(&grams.to_be_bytes());
            }
            Self::HistoryEvents { since } => match since {
                Some(at) => {
                    push_date_minutes(&mut out, at);
                    out.push(at.second() as u8);
                }
                None => out.extend_from_slice(&[0, 1, 1, 0, 0, 0]),
            },
            Self::TempBasalStart { percent, hours } => {
                out.push(*percent);
                out.push(*hours);
            }
            Self::ApsTempBasalStart { percent, duration } => {
                out.extend_from_slice(&percent.to_be_bytes());
                out.push(duration.param());
            }
            Self::ExtendedBolusStart { units, half_hours } => {
                push_units(&mut out, *units);
                out.push(*half_hours);
            }
            Self::SetTime(at) => {
                out.push(at.second() as u8);
                out.push(at.minute() as u8);
                out.push(at.hour() as u8);
                out.push(at.day() as u8);
                out.push(at.month() as u8);
                out.push(year_byte(at));
            }
            Self::SetBasalProfile { index, profile } => {
                out.push(*index);
                for rate in profile.rates {
                    push_units(&mut out, rate);
                }
            }
            Self::ActivateBasalProfile { index } => out.push(*index),
            Self::SetUserOptions(opts) => {
                out.push(u8::from(opts.time_display_24h));
                out.push(u8::from(opts.button_scroll));
                out.push(opts.beep_and_alarm);
                out.push(opts.lcd_on_secs);
                out.push(opts.backlight_on_secs);
                out.push(opts.language);
                out.push(u8::from(opts.units_mmol));
                out.push(opts.shutdown_hours);
                out.push(opts.low_reservoir_units);
            }
            Self::CheckValue
            | Self::BolusStop
            | Self::CommStart
            | Self::CommStop
            | Self::HistoryRequest(_)
            | Self::TempBasalStop
            | Self::ExtendedBolusStop
            | Self::StatusBasic
            | Self::StatusTempBasal
            | Self::StatusExtendedBolus => {}
        }
        out
    }
}

fn push_units(out: &mut Vec<u8>, units: f64) {
    let hundredths = (units * 100.0).round().clamp(0.0, u16::MAX as f64) as u16;
    out.extend_from_slice(&hundredths.to_be_bytes());
}

fn year_byte(at: &DateTime<Local>) -> u8 {
    (at.year() - 2000).clamp(0, u8::MAX as i32) as u8
}

fn push_date_minutes(out: &mut Vec<u8>, at: &DateTime<Local>) {
    out.push(year_byte(at));
    out.push(at.month() as u8);
    out.push(at.day() as u8);
    out.push(at.hour() as u8);
    out.push(at.minute() as u8);
}

/// Decode the `yy mm dd hh mi` prefix used by history records.
pub fn parse_date_minutes(bytes: &[u8]) -> Option<NaiveDateTime> {
    if bytes.len() < 5 {
        return None;
    }
    NaiveDate::from_ymd_opt(2000 + bytes[0] as i32, bytes[1] as u32, bytes[2] as u32)?
        .and_hms_opt(bytes[3] as u32, bytes[4] as u32, 0)
}
