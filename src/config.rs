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

//! Configuration module.
//!
//! Handles loading and saving session settings.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "pumplink";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pump link settings.
    pub pump: PumpConfig,

    /// Protocol timing.
    pub timing: TimingConfig,

    /// Session policy.
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Bluetooth name of the paired pump.
    pub device_name: String,

    /// RFCOMM channel of the pump's serial port service.
    pub rfcomm_channel: u8,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            rfcomm_channel: 1,
        }
    }
}

/// Intervals the pump needs between protocol steps, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay between bolus stop retransmissions.
    pub bolus_stop_retry_ms: u64,
    /// Settle time after opening a history session.
    pub history_settle_ms: u64,
    /// Poll interval while waiting for the history-done marker.
    pub history_poll_ms: u64,
    /// Settle time before closing a history session.
    pub history_trailing_ms: u64,
    /// Poll interval of the whole-minute gate.
    pub time_sync_poll_ms: u64,
    /// Poll interval while a bolus is being delivered.
    pub bolus_poll_ms: u64,
    /// Wait before reading the acknowledgement of a settings write.
    pub settings_ack_ms: u64,
    /// Poll interval while waiting for a status reply.
    pub status_poll_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            bolus_stop_retry_ms: 200,
            history_settle_ms: 400,
            history_poll_ms: 100,
            history_trailing_ms: 200,
            time_sync_poll_ms: 100,
            bolus_poll_ms: 100,
            settings_ack_ms: 200,
            status_poll_ms: 100,
        }
    }
}

impl TimingConfig {
    /// Reject intervals the pump cannot keep up with. The device intervals
    /// may only be lengthened, and poll intervals must be non-zero.
    pub fn validate(&self) -> Result<()> {
        let floors = Self::default();
        for (name, value, floor) in [
            ("bolus_stop_retry_ms", self.bolus_stop_retry_ms, floors.bolus_stop_retry_ms),
            ("history_settle_ms", self.history_settle_ms, floors.history_settle_ms),
            ("history_trailing_ms", self.history_trailing_ms, floors.history_trailing_ms),
            ("settings_ack_ms", self.settings_ack_ms, floors.settings_ack_ms),
        ] {
            ensure!(
                value >= floor,
                "timing.{} must be at least {} ms, got {}",
                name,
                floor,
                value
            );
        }
        for (name, value) in [
            ("history_poll_ms", self.history_poll_ms),
            ("time_sync_poll_ms", self.time_sync_poll_ms),
            ("bolus_poll_ms", self.bolus_poll_ms),
            ("status_poll_ms", self.status_poll_ms),
        ] {
            ensure!(value > 0, "timing.{} must be greater than 0", name);
        }
        Ok(())
    }

    pub fn bolus_stop_retry(&self) -> Duration {
        Duration::from_millis(self.bolus_stop_retry_ms)
    }

    pub fn history_settle(&self) -> Duration {
        Duration::from_millis(self.history_settle_ms)
    }

    pub fn history_poll(&self) -> Duration {
        Duration::from_millis(self.history_poll_ms)
    }

    pub fn history_trailing(&self) -> Duration {
        Duration::from_millis(self.history_trailing_ms)
    }

    pub fn time_sync_poll(&self) -> Duration {
        Duration::from_millis(self.time_sync_poll_ms)
    }

    pub fn bolus_poll(&self) -> Duration {
        Duration::from_millis(self.bolus_poll_ms)
    }

    pub fn settings_ack(&self) -> Duration {
        Duration::from_millis(self.settings_ack_ms)
    }

    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Unacknowledged stop retries before the operator is alerted.
    /// Retrying continues after the alert.
    pub bolus_stop_escalation_retries: u32,

    /// Upper bound on waiting for a status refresh, in milliseconds.
    pub status_timeout_ms: u64,

    /// Minimum spacing of daily-limit warnings, in minutes.
    pub daily_limit_warning_interval_min: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bolus_stop_escalation_retries: 25,
            status_timeout_ms: 5000,
            daily_limit_warning_interval_min: 30,
        }
    }
}

impl SessionConfig {
    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
}

impl Config {
    fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`, writing the defaults there if the
    /// file does not exist yet.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config
                .timing
                .validate()
                .with_context(|| format!("invalid config {}", path.display()))?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_timing_constants() {
        let timing = TimingConfig::default();
        assert_eq!(timing.bolus_stop_retry(), Duration::from_millis(200));
        assert_eq!(timing.history_settle(), Duration::from_millis(400));
        assert_eq!(timing.history_poll(), Duration::from_millis(100));
        assert_eq!(timing.history_trailing(), Duration::from_millis(200));
        assert_eq!(timing.time_sync_poll(), Duration::from_millis(100));
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.pump.rfcomm_channel, 1);
        assert!(config.pump.device_name.is_empty());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[pump]\ndevice_name = \"PUMP12345AB\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.pump.device_name, "PUMP12345AB");
        assert_eq!(config.pump.rfcomm_channel, 1);
        assert_eq!(config.timing.history_settle_ms, 400);
        assert_eq!(config.session.bolus_stop_escalation_retries, 25);
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[timing]\nbolus_poll_ms = 0\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("timing.bolus_poll_ms must be greater than 0"));
    }

    #[test]
    fn test_device_interval_below_default_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[timing]\nhistory_settle_ms = 0\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("timing.history_settle_ms must be at least 400 ms"));

        std::fs::write(&path, "[timing]\nhistory_settle_ms = 1000\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.timing.history_settle(), Duration::from_millis(1000));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.pump.device_name = "PUMP98765ZZ".to_string();
        config.session.status_timeout_ms = 2500;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.pump.device_name, "PUMP98765ZZ");
        assert_eq!(loaded.session.status_timeout(), Duration::from_millis(2500));
    }
}
