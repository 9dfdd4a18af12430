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

//! Pump driver operations on top of the protocol engine.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::bluetooth::{codes, ApsDuration, BasalProfile, Command, RecordType, UserOptions};
use crate::engine::{
    BolusStopOutcome, ProtocolEngine, PumpEnactResult, Treatment, HISTORY_DOWNLOAD,
};
use crate::error::{Result, SessionError};
use crate::events::PumpEvent;

/// Operations a pump driver offers to the layers above it.
#[async_trait]
pub trait PumpDriver: Send + Sync {
    async fn connect(&self) -> Result<()>;

    fn disconnect(&self, reason: &str);

    fn stop_connecting(&self);

    fn is_connected(&self) -> bool;

    fn is_connecting(&self) -> bool;

    fn is_handshake_in_progress(&self) -> bool;

    fn finish_handshaking(&self);

    /// Query the pump status. Returns whether a fresh status arrived.
    async fn refresh_status(&self) -> bool;

    /// Program and activate a basal profile, synchronised to a whole minute.
    async fn update_basal_schedule(&self, profile: &BasalProfile) -> bool;

    async fn load_history(&self, record: RecordType) -> PumpEnactResult;

    /// Download events logged since the previous download.
    async fn load_events(&self) -> PumpEnactResult;

    /// Deliver a bolus and wait until it ends.
    async fn bolus(
        &self,
        amount: f64,
        carbs: u16,
        carb_time: DateTime<Local>,
        treatment: Treatment,
    ) -> bool;

    async fn bolus_stop(&self) -> BolusStopOutcome;

    async fn set_temporary_basal(&self, percent: u8, hours: u8) -> bool;

    async fn set_high_temporary_basal(&self, percent: u16, minutes: u32) -> bool;

    /// Short APS temporary basal. Only 15 and 30 minutes are accepted.
    async fn set_short_temporary_basal(&self, percent: u16, minutes: u32) -> bool;

    async fn stop_temporary_basal(&self) -> bool;

    async fn set_extended_bolus(&self, units: f64, half_hours: u8) -> bool;

    async fn stop_extended_bolus(&self) -> bool;

    async fn apply_user_options(&self, options: UserOptions) -> PumpEnactResult;
}

/// [`PumpDriver`] speaking the serial protocol through a [`ProtocolEngine`].
pub struct SerialPumpDriver {
    engine: ProtocolEngine,
    last_history_fetched: Mutex<Option<DateTime<Local>>>,
}

impl SerialPumpDriver {
    pub fn new(engine: ProtocolEngine) -> Self {
        Self {
            engine,
            last_history_fetched: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    pub fn last_history_fetched(&self) -> Option<DateTime<Local>> {
        *self.last_history_fetched.lock()
    }

    /// Send `command` and queue the status query that reflects it.
    fn send_with_status(&self, command: Command, status: Command) -> bool {
        if !self.engine.is_connected() {
            warn!("Pump not connected, dropping {:?}", command);
            return false;
        }
        self.engine.send(&command);
        self.engine.send(&status);
        true
    }

    fn check_daily_limit(&self) {
        let pump = self.engine.pump();
        let status = pump.status();
        if !status.approaching_daily_limit() {
            return;
        }

        let now = self.engine.now();
        let spacing = chrono::Duration::minutes(
            self.engine.config().session.daily_limit_warning_interval_min,
        );
        let due = pump
            .last_approaching_daily_limit()
            .map_or(true, |last| now - last > spacing);
        if due {
            warn!(
                "Approaching daily limit: {} of {} U",
                status.daily_total_units, status.max_daily_total_units
            );
            pump.set_last_approaching_daily_limit(now);
            self.engine.notifier().publish(PumpEvent::DailyLimitApproaching {
                total: status.daily_total_units,
                max: status.max_daily_total_units,
            });
        }
    }

    async fn aps_temporary_basal(&self, percent: u16, duration: ApsDuration) -> bool {
        self.send_with_status(
            Command::ApsTempBasalStart { percent, duration },
            Command::StatusTempBasal,
        )
    }
}

#[async_trait]
impl PumpDriver for SerialPumpDriver {
    async fn connect(&self) -> Result<()> {
        self.engine.connect().await
    }

    fn disconnect(&self, reason: &str) {
        self.engine.disconnect(reason);
    }

    fn stop_connecting(&self) {
        self.engine.stop_connecting();
    }

    fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    fn is_connecting(&self) -> bool {
        self.engine.is_connecting()
    }

    fn is_handshake_in_progress(&self) -> bool {
        self.engine.is_handshake_in_progress()
    }

    fn finish_handshaking(&self) {
        self.engine.finish_handshaking();
    }

    async fn refresh_status(&self) -> bool {
        if !self.engine.is_connected() {
            return false;
        }
        let pump = self.engine.pump();
        let timing = &self.engine.config().timing;
        let before = pump.status().updated_at;

        self.engine.send(&Command::StatusBasic);
        self.engine.send(&Command::StatusTempBasal);
        self.engine.send(&Command::StatusExtendedBolus);

        let deadline = Instant::now() + self.engine.config().session.status_timeout();
        let refreshed = loop {
            if pump.status().updated_at != before {
                break true;
            }
            if !self.engine.link_connected() || Instant::now() >= deadline {
                break false;
            }
            sleep(timing.status_poll()).await;
        };

        if refreshed {
            self.check_daily_limit();
        } else {
            warn!("No status reply from pump");
        }
        refreshed
    }

    async fn update_basal_schedule(&self, profile: &BasalProfile) -> bool {
        if !self.engine.is_connected() {
            return false;
        }
        self.engine.wait_for_whole_minute().await;

        info!("Programming basal profile");
        self.engine.send(&Command::SetTime(self.engine.now()));
        self.engine.send(&Command::SetBasalProfile {
            index: 0,
            profile: profile.clone(),
        });
        self.engine.send(&Command::ActivateBasalProfile { index: 0 });
        self.refresh_status().await;
        true
    }

    async fn load_history(&self, record: RecordType) -> PumpEnactResult {
        self.engine.load_history(record).await
    }

    async fn load_events(&self) -> PumpEnactResult {
        if !self.engine.is_connected() {
            return PumpEnactResult::failure(SessionError::NotConnected.to_string());
        }
        let timing = &self.engine.config().timing;
        let since = self.last_history_fetched();
        debug!("Loading events since {:?}", since);

        self.engine.pump().set_history_done_received(false);
        self.engine.send(&Command::CommStart);
        sleep(timing.history_settle()).await;
        self.engine.send(&Command::HistoryEvents { since });

        let completed = self.engine.wait_for_history_done().await;

        sleep(timing.history_trailing()).await;
        self.engine.send(&Command::CommStop);

        if completed {
            *self.last_history_fetched.lock() = Some(self.engine.now());
            PumpEnactResult::success("OK")
        } else {
            PumpEnactResult::failure(SessionError::LinkLost(HISTORY_DOWNLOAD).to_string())
        }
    }

    async fn bolus(
        &self,
        amount: f64,
        carbs: u16,
        carb_time: DateTime<Local>,
        treatment: Treatment,
    ) -> bool {
        if !self.engine.is_connected() {
            return false;
        }
        let treatment_id = treatment.id.clone();
        if let Err(e) = self.engine.begin_bolus(treatment) {
            warn!("Bolus refused: {}", e);
            return false;
        }

        let pump = self.engine.pump();
        pump.begin_bolus_delivery();
        pump.clear_ack(codes::BOLUS_START);

        if carbs > 0 {
            self.engine.send(&Command::CarbsEntry {
                at: carb_time,
                grams: carbs,
            });
        }
        info!("Starting bolus of {} U", amount);
        self.engine.send(&Command::BolusStart { amount });

        let poll = self.engine.config().timing.bolus_poll();
        loop {
            let flags = pump.bolus();
            if flags.stopped || flags.start_failed || !self.engine.link_connected() {
                break;
            }
            sleep(poll).await;
        }

        let flags = pump.bolus();
        self.engine.clear_bolus(&treatment_id);
        if flags.start_failed {
            warn!("Pump rejected bolus of {} U", amount);
        } else {
            info!("Bolus ended: {} of {} U delivered", flags.delivered, amount);
        }
        flags.stopped && !flags.start_failed
    }

    async fn bolus_stop(&self) -> BolusStopOutcome {
        self.engine.bolus_stop().await
    }

    async fn set_temporary_basal(&self, percent: u8, hours: u8) -> bool {
        self.send_with_status(
            Command::TempBasalStart { percent, hours },
            Command::StatusTempBasal,
        )
    }

    async fn set_high_temporary_basal(&self, percent: u16, minutes: u32) -> bool {
        match ApsDuration::from_minutes(minutes) {
            Ok(duration) => self.aps_temporary_basal(percent, duration).await,
            Err(e) => {
                warn!("Temporary basal refused: {}", e);
                false
            }
        }
    }

    async fn set_short_temporary_basal(&self, percent: u16, minutes: u32) -> bool {
        match ApsDuration::from_minutes(minutes) {
            Ok(duration @ (ApsDuration::FifteenMinutes | ApsDuration::ThirtyMinutes)) => {
                self.aps_temporary_basal(percent, duration).await
            }
            Ok(ApsDuration::OneHour) | Err(_) => {
                warn!("Short temporary basal must be 15 or 30 min, got {}", minutes);
                false
            }
        }
    }

    async fn stop_temporary_basal(&self) -> bool {
        self.send_with_status(Command::TempBasalStop, Command::StatusTempBasal)
    }

    async fn set_extended_bolus(&self, units: f64, half_hours: u8) -> bool {
        self.send_with_status(
            Command::ExtendedBolusStart { units, half_hours },
            Command::StatusExtendedBolus,
        )
    }

    async fn stop_extended_bolus(&self) -> bool {
        self.send_with_status(Command::ExtendedBolusStop, Command::StatusExtendedBolus)
    }

    async fn apply_user_options(&self, options: UserOptions) -> PumpEnactResult {
        if !self.engine.is_connected() {
            return PumpEnactResult::failure(SessionError::NotConnected.to_string());
        }
        let pump = self.engine.pump();
        pump.clear_ack(codes::SET_USER_OPTIONS);
        self.engine.send(&Command::SetUserOptions(options));
        sleep(self.engine.config().timing.settings_ack()).await;

        match pump.ack(codes::SET_USER_OPTIONS) {
            Some(true) => PumpEnactResult::success("OK").enacted(true),
            Some(false) => PumpEnactResult::failure("pump rejected user options"),
            None => PumpEnactResult::failure("no reply to user options"),
        }
    }
}
