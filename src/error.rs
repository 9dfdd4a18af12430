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

//! Error types for the pump session.

use std::io;
use thiserror::Error;

/// Failure to establish the serial link to the pump.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    #[error("No pump device configured")]
    NotConfigured,

    #[error("Device not found or not paired: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open serial link: {0}")]
    Open(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<bluer::Error> for ConnectError {
    fn from(e: bluer::Error) -> Self {
        ConnectError::Open(e.to_string())
    }
}

/// Errors surfaced by session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Connectivity error: {0}")]
    Connectivity(#[from] ConnectError),

    #[error("Pump is not connected")]
    NotConnected,

    #[error("Link lost during {0}")]
    LinkLost(&'static str),

    #[error("Connection attempt was cancelled")]
    ConnectCancelled,

    #[error("A bolus is already in progress")]
    BolusInProgress,

    #[error("Unknown history record type: {0:#04x}")]
    UnknownRecordType(u8),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl SessionError {
    /// Creates a new invalid argument error
    pub fn invalid(msg: impl Into<String>) -> Self {
        SessionError::InvalidArgument(msg.into())
    }
}

/// Frame decoding failures.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Bad frame delimiters")]
    BadDelimiters,

    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    Crc { expected: u16, actual: u16 },

    #[error("Truncated payload for command {0:#06x}")]
    Truncated(u16),
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
