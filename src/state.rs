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

//! Pump session state.
//!
//! [`PumpState`] is the last-known pump status. The decode path writes the
//! reply-derived fields; the engine and driver only write request flags
//! (`bolus_stop_forced`, resetting `history_done_received`, and so on).

use chrono::{DateTime, Local};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Fraction of the daily maximum at which the pump is considered close to
/// its daily limit.
pub const DAILY_LIMIT_WARNING: f64 = 0.95;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    ConnectedHandshaking,
    ConnectedReady,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::ConnectedHandshaking => "Handshaking",
            ConnectionState::ConnectedReady => "Connected",
        }
    }

    /// Either of the two connected states.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::ConnectedHandshaking | ConnectionState::ConnectedReady
        )
    }
}

/// Bolus delivery flags.
#[derive(Debug, Clone, Default)]
pub struct BolusFlags {
    /// A stop was requested. Kept across a session teardown while the stop
    /// is still being retried.
    pub stop_forced: bool,
    pub stopped: bool,
    pub bolusing: bool,
    pub start_failed: bool,
    /// Units delivered so far by the running bolus.
    pub delivered: f64,
}

/// A running temporary basal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempBasalStatus {
    pub percent: u16,
    pub duration_hours: u8,
}

/// A running extended bolus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtendedBolusStatus {
    pub amount: f64,
    pub duration_half_hours: u8,
}

/// Reply-derived pump status.
#[derive(Debug, Clone, Default)]
pub struct PumpStatus {
    pub model: Option<u8>,
    pub protocol: Option<u8>,
    pub suspended: bool,
    pub daily_total_units: f64,
    pub max_daily_total_units: f64,
    pub reservoir_units: f64,
    pub battery_percent: u8,
    pub temp_basal: Option<TempBasalStatus>,
    pub extended_bolus: Option<ExtendedBolusStatus>,
    pub updated_at: Option<DateTime<Local>>,
}

impl PumpStatus {
    /// Whether today's total is within the warning band of the daily maximum.
    pub fn approaching_daily_limit(&self) -> bool {
        self.max_daily_total_units > 0.0
            && self.daily_total_units > self.max_daily_total_units * DAILY_LIMIT_WARNING
    }
}

/// Shared pump state for one session.
#[derive(Debug, Default)]
pub struct PumpState {
    bolus: RwLock<BolusFlags>,
    history_done_received: RwLock<bool>,
    last_approaching_daily_limit: RwLock<Option<DateTime<Local>>>,
    status: RwLock<PumpStatus>,
    /// Acknowledgement result per command code.
    acks: RwLock<HashMap<u16, bool>>,
}

impl PumpState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Restore every field to its default. Called when the session ends.
    pub fn reset(&self) {
        *self.bolus.write() = BolusFlags::default();
        *self.history_done_received.write() = false;
        *self.last_approaching_daily_limit.write() = None;
        *self.status.write() = PumpStatus::default();
        self.acks.write().clear();
    }

    pub fn set_bolus_stop_forced(&self, forced: bool) {
        self.bolus.write().stop_forced = forced;
    }

    pub fn is_bolus_stop_forced(&self) -> bool {
        self.bolus.read().stop_forced
    }

    pub fn set_bolus_stopped(&self, stopped: bool) {
        self.bolus.write().stopped = stopped;
    }

    pub fn is_bolus_stopped(&self) -> bool {
        self.bolus.read().stopped
    }

    /// Prepare the flags for a new bolus delivery.
    pub fn begin_bolus_delivery(&self) {
        *self.bolus.write() = BolusFlags {
            bolusing: true,
            ..BolusFlags::default()
        };
    }

    /// Delivery finished, either completed or stopped.
    pub fn finish_bolus_delivery(&self) {
        let mut bolus = self.bolus.write();
        bolus.bolusing = false;
        bolus.stopped = true;
    }

    pub fn set_bolus_start_failed(&self) {
        let mut bolus = self.bolus.write();
        bolus.start_failed = true;
        bolus.bolusing = false;
    }

    pub fn set_bolus_delivered(&self, units: f64) {
        self.bolus.write().delivered = units;
    }

    pub fn bolus(&self) -> BolusFlags {
        self.bolus.read().clone()
    }

    pub fn set_history_done_received(&self, done: bool) {
        *self.history_done_received.write() = done;
    }

    pub fn is_history_done_received(&self) -> bool {
        *self.history_done_received.read()
    }

    pub fn set_last_approaching_daily_limit(&self, at: DateTime<Local>) {
        *self.last_approaching_daily_limit.write() = Some(at);
    }

    pub fn last_approaching_daily_limit(&self) -> Option<DateTime<Local>> {
        *self.last_approaching_daily_limit.read()
    }

    /// Apply a change to the status record and stamp it.
    pub fn update_status(&self, f: impl FnOnce(&mut PumpStatus)) {
        let mut status = self.status.write();
        f(&mut status);
        status.updated_at = Some(Local::now());
    }

    pub fn status(&self) -> PumpStatus {
        self.status.read().clone()
    }

    pub fn record_ack(&self, code: u16, ok: bool) {
        self.acks.write().insert(code, ok);
    }

    /// Acknowledgement for `code`, if a reply has been seen.
    pub fn ack(&self, code: u16) -> Option<bool> {
        self.acks.read().get(&code).copied()
    }

    pub fn clear_ack(&self, code: u16) {
        self.acks.write().remove(&code);
    }
}
