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

//! Bluetooth serial link to the pump.
//!
//! Transport, framing, codec and the serial I/O worker.

pub mod codec;
mod connection;
pub mod protocol;
pub mod reassembler;
mod rfcomm;
pub mod transport;

pub use codec::{Decoded, FrameCodec, MessageCodec};
pub use connection::{SerialIoWorker, SessionSignal, WorkerContext};
pub use protocol::{
    codes, ApsDuration, BasalProfile, Command, HistoryRecord, RecordType, UserOptions,
};
pub use reassembler::{build_frame, FrameReassembler};
pub use rfcomm::{RfcommConnector, SPP_UUID};
pub use transport::{Connector, Link, LinkEvent, LinkStatus};
