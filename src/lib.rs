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

//! Session protocol engine for insulin pumps on a Bluetooth serial link.
//!
//! [`ProtocolEngine`] manages the connection lifecycle and the blocking
//! completion protocols (bolus stop, history download, whole-minute gate).
//! [`SerialPumpDriver`] implements the pump operations on top of it.

pub mod bluetooth;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod state;

pub use config::Config;
pub use driver::{PumpDriver, SerialPumpDriver};
pub use engine::{
    BolusContext, BolusStopOutcome, Clock, EngineBuilder, ProtocolEngine, PumpEnactResult,
    SystemClock, Treatment,
};
pub use error::{ConnectError, Result, SessionError};
pub use events::{EventNotifier, PumpEvent};
pub use state::{ConnectionState, PumpState, PumpStatus};
