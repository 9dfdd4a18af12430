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

//! Message codec between typed commands and pump frames.
//!
//! Decoding a reply writes the reply-derived fields of [`PumpState`]; the
//! returned [`Decoded`] value tells the serial worker what else to do with
//! it (signal the engine, publish an event).

use tracing::{debug, warn};

use super::protocol::{codes, parse_date_minutes, Command, HistoryRecord, RecordType};
use super::reassembler::{build_frame, crc16, FRAME_END, FRAME_MARKER, FRAME_OVERHEAD, FRAME_START};
use crate::error::CodecError;
use crate::state::{ExtendedBolusStatus, PumpState, TempBasalStatus};

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Handshake reply; the session is usable.
    Handshake { model: u8, protocol: u8 },
    /// The pump acknowledged the bolus stop.
    BolusStopAck,
    BolusProgress { delivered: f64 },
    /// Bolus delivery completed.
    BolusFinished,
    HistoryRecord(HistoryRecord),
    HistoryDone,
    /// A status reply was stored.
    Status(u16),
    /// Plain result of a settings or control command.
    Ack { code: u16, ok: bool },
    Unknown { code: u16 },
}

/// Encodes commands and decodes replies.
pub trait MessageCodec: Send + Sync {
    fn encode(&self, command: &Command) -> Vec<u8>;

    /// Decode a complete frame, updating `pump` as a side effect.
    fn decode(&self, frame: &[u8], pump: &PumpState) -> Result<Decoded, CodecError>;
}

/// Split a frame into command code and params, validating delimiters and
/// CRC.
pub fn parse_frame(frame: &[u8]) -> Result<(u16, &[u8]), CodecError> {
    if frame.len() < FRAME_OVERHEAD + 3 {
        return Err(CodecError::TooShort(frame.len()));
    }
    let end = frame.len();
    if frame[..2] != FRAME_START || frame[end - 2..] != FRAME_END || frame[3] != FRAME_MARKER {
        return Err(CodecError::BadDelimiters);
    }
    if frame[2] as usize + FRAME_OVERHEAD != end {
        return Err(CodecError::TooShort(frame.len()));
    }

    let body = &frame[3..end - 4];
    let expected = u16::from_be_bytes([frame[end - 4], frame[end - 3]]);
    let actual = crc16(body);
    if expected != actual {
        return Err(CodecError::Crc { expected, actual });
    }

    let code = u16::from_be_bytes([body[1], body[2]]);
    Ok((code, &body[3..]))
}

/// Codec for the pump's framed serial protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

fn units(hi: u8, lo: u8) -> f64 {
    u16::from_be_bytes([hi, lo]) as f64 / 100.0
}

fn require(code: u16, params: &[u8], len: usize) -> Result<(), CodecError> {
    if params.len() < len {
        Err(CodecError::Truncated(code))
    } else {
        Ok(())
    }
}

fn history_record(category: Option<RecordType>, params: &[u8]) -> HistoryRecord {
    let value = if params.len() >= 7 {
        u16::from_be_bytes([params[5], params[6]])
    } else {
        0
    };
    HistoryRecord {
        category,
        at: parse_date_minutes(params),
        value,
        payload: params.to_vec(),
    }
}

impl MessageCodec for FrameCodec {
    fn encode(&self, command: &Command) -> Vec<u8> {
        build_frame(command.code(), &command.params())
    }

    fn decode(&self, frame: &[u8], pump: &PumpState) -> Result<Decoded, CodecError> {
        let (code, params) = parse_frame(frame)?;
        debug!("Decoding reply {:#06x} ({} param bytes)", code, params.len());

        let decoded = match code {
            codes::CHECK_VALUE => {
                require(code, params, 2)?;
                let (model, protocol) = (params[0], params[1]);
                pump.update_status(|s| {
                    s.model = Some(model);
                    s.protocol = Some(protocol);
                });
                Decoded::Handshake { model, protocol }
            }
            codes::BOLUS_STOP => {
                pump.finish_bolus_delivery();
                Decoded::BolusStopAck
            }
            codes::BOLUS_START => {
                let ok = params.first().copied().unwrap_or(0) == 0;
                pump.record_ack(code, ok);
                if !ok {
                    warn!("Pump rejected bolus start");
                    pump.set_bolus_start_failed();
                }
                Decoded::Ack { code, ok }
            }
            codes::BOLUS_PROGRESS => {
                require(code, params, 2)?;
                let delivered = units(params[0], params[1]);
                pump.set_bolus_delivered(delivered);
                Decoded::BolusProgress { delivered }
            }
            codes::BOLUS_FINISHED => {
                pump.finish_bolus_delivery();
                Decoded::BolusFinished
            }
            codes::STATUS_BASIC => {
                require(code, params, 8)?;
                pump.update_status(|s| {
                    s.suspended = params[0] != 0;
                    s.daily_total_units = units(params[1], params[2]);
                    s.max_daily_total_units = units(params[3], params[4]);
                    s.reservoir_units = units(params[5], params[6]);
                    s.battery_percent = params[7];
                });
                Decoded::Status(code)
            }
            codes::STATUS_TEMP_BASAL => {
                require(code, params, 3)?;
                let temp = (params[0] != 0).then(|| TempBasalStatus {
                    percent: params[1] as u16,
                    duration_hours: params[2],
                });
                pump.update_status(|s| s.temp_basal = temp);
                Decoded::Status(code)
            }
            codes::STATUS_EXTENDED_BOLUS => {
                require(code, params, 4)?;
                let extended = (params[0] != 0).then(|| ExtendedBolusStatus {
                    duration_half_hours: params[1],
                    amount: units(params[2], params[3]),
                });
                pump.update_status(|s| s.extended_bolus = extended);
                Decoded::Status(code)
            }
            codes::HISTORY_DONE => {
                pump.set_history_done_received(true);
                Decoded::HistoryDone
            }
            codes::HISTORY_EVENTS => {
                if params.is_empty() {
                    // Bare echo of the request
                    Decoded::Ack { code, ok: true }
                } else {
                    Decoded::HistoryRecord(history_record(None, params))
                }
            }
            codes::TEMP_BASAL_START
            | codes::CARBS_ENTRY
            | codes::TEMP_BASAL_STOP
            | codes::EXTENDED_BOLUS_STOP
            | codes::EXTENDED_BOLUS_START
            | codes::COMM_START
            | codes::COMM_STOP
            | codes::SET_TIME
            | codes::SET_BASAL_PROFILE
            | codes::SET_USER_OPTIONS
            | codes::ACTIVATE_BASAL_PROFILE
            | codes::APS_TEMP_BASAL_START => {
                let ok = params.first().copied().unwrap_or(0) == 0;
                pump.record_ack(code, ok);
                Decoded::Ack { code, ok }
            }
            other => match RecordType::from_history_command(other) {
                Some(category) if !params.is_empty() => {
                    Decoded::HistoryRecord(history_record(Some(category), params))
                }
                Some(_) => Decoded::Ack { code, ok: true },
                None => {
                    debug!("Unhandled reply {:#06x}", other);
                    Decoded::Unknown { code: other }
                }
            },
        };

        Ok(decoded)
    }
}
