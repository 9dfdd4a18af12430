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

//! Serial stream reassembly into pump frames.
//!
//! Frame layout:
//!
//! ```text
//! 7E 7E | len | F1 | cmd_hi cmd_lo | params... | crc_hi crc_lo | 2E 2E
//! ```
//!
//! `len` counts the `F1` marker, the command code and the params. The CRC
//! covers the same bytes.

use tracing::{debug, warn};

pub const FRAME_START: [u8; 2] = [0x7E, 0x7E];
pub const FRAME_END: [u8; 2] = [0x2E, 0x2E];
pub const FRAME_MARKER: u8 = 0xF1;

/// Start delimiter, length byte, CRC and end delimiter.
pub const FRAME_OVERHEAD: usize = 7;

/// Upper bound on buffered bytes before the buffer is discarded.
const MAX_BUF: usize = 8192;

/// CRC-16 used by the pump.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc = crc.rotate_left(8);
        crc ^= byte as u16;
        crc ^= (crc & 0xFF) >> 4;
        crc ^= crc << 12;
        crc ^= (crc & 0xFF) << 5;
    }
    crc
}

/// Build a complete frame for a command code and its params.
pub fn build_frame(code: u16, params: &[u8]) -> Vec<u8> {
    let body_len = params.len() + 3;
    let mut frame = Vec::with_capacity(body_len + FRAME_OVERHEAD);

    frame.extend_from_slice(&FRAME_START);
    frame.push(body_len as u8);
    frame.push(FRAME_MARKER);
    frame.extend_from_slice(&code.to_be_bytes());
    frame.extend_from_slice(params);

    let crc = crc16(&frame[3..]);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.extend_from_slice(&FRAME_END);
    frame
}

/// Splits the inbound byte stream into complete frames.
pub struct FrameReassembler {
    buffer: Vec<u8>,
}

impl FrameReassembler {
    /// Create a new frame reassembler.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(512),
        }
    }

    /// Process bytes read from the link.
    ///
    /// Returns every frame completed by `data`, in arrival order. Frames are
    /// delimited but not CRC-checked here.
    pub fn process_bytes(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() > MAX_BUF {
            warn!("Receive buffer overflow ({} bytes), resetting", self.buffer.len());
            self.reset();
            return Vec::new();
        }

        let mut frames = Vec::new();
        loop {
            // Resync on the start delimiter
            match self.buffer.windows(2).position(|w| w == FRAME_START) {
                Some(0) => {}
                Some(pos) => {
                    warn!("Discarding {} bytes before frame start", pos);
                    self.buffer.drain(..pos);
                }
                None => {
                    // Keep a trailing 0x7E, it may begin the next frame
                    let keep = usize::from(self.buffer.last() == Some(&FRAME_START[0]));
                    let drop = self.buffer.len() - keep;
                    if drop > 0 {
                        debug!("Discarding {} bytes without frame start", drop);
                        self.buffer.drain(..drop);
                    }
                    break;
                }
            }

            if self.buffer.len() < 3 {
                break;
            }

            let total = self.buffer[2] as usize + FRAME_OVERHEAD;
            if self.buffer.len() < total {
                break;
            }

            if self.buffer[total - 2..total] != FRAME_END {
                warn!("Missing frame end delimiter, resyncing");
                self.buffer.drain(..1);
                continue;
            }

            let frame: Vec<u8> = self.buffer.drain(..total).collect();
            debug!("Frame complete: {} bytes", frame.len());
            frames.push(frame);
        }

        frames
    }

    /// Reset the reassembler state.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Get current buffer size.
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new()
    }
}
