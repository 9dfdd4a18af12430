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

//! Serial I/O worker.
//!
//! One task owns the link for its lifetime. It writes outbound frames in
//! the order they were queued, reassembles and decodes inbound frames, and
//! reports handshake completion and link loss back to the engine.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::codec::{Decoded, MessageCodec};
use super::reassembler::FrameReassembler;
use super::transport::{BoxedReader, BoxedWriter, Link, LinkEvent, LinkStatus};
use crate::events::{EventNotifier, PumpEvent};
use crate::state::PumpState;

/// Signals from the worker to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// The handshake reply was decoded.
    HandshakeComplete { model: u8, protocol: u8 },
    /// Read or write failed, or the remote closed the stream.
    LinkLost { device: String },
}

/// Everything the IO loop needs besides the link itself.
pub struct WorkerContext {
    pub codec: Arc<dyn MessageCodec>,
    pub pump: Arc<PumpState>,
    pub notifier: EventNotifier,
    pub signal_tx: mpsc::UnboundedSender<SessionSignal>,
}

/// Handle to a running serial I/O task.
pub struct SerialIoWorker {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    status: LinkStatus,
    cancel: CancellationToken,
}

impl SerialIoWorker {
    /// Spawn the worker on `link`. Returns the handle and the link's event
    /// monitor, if the transport provides one.
    pub fn spawn(
        link: Link,
        ctx: WorkerContext,
    ) -> (Self, Option<mpsc::UnboundedReceiver<LinkEvent>>) {
        let device = link.device().to_string();
        let (reader, writer, status, monitor) = link.into_parts();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(io_loop(
            device,
            reader,
            writer,
            status.clone(),
            ctx,
            outbound_rx,
            cancel.clone(),
        ));

        let worker = Self {
            outbound,
            status,
            cancel,
        };
        (worker, monitor)
    }

    /// Queue an encoded frame. Returns false once the link is down.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        if !self.status.is_connected() {
            return false;
        }
        self.outbound.send(frame).is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    /// Stop the worker and close the link.
    pub fn disconnect(&self, reason: &str) {
        info!("Disconnecting serial link: {}", reason);
        self.status.set_connected(false);
        self.cancel.cancel();
    }
}

impl Drop for SerialIoWorker {
    fn drop(&mut self) {
        self.status.set_connected(false);
        self.cancel.cancel();
    }
}

async fn io_loop(
    device: String,
    mut reader: BoxedReader,
    mut writer: BoxedWriter,
    status: LinkStatus,
    ctx: WorkerContext,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    info!("Serial I/O worker started for {}", device);

    let mut reassembler = FrameReassembler::new();
    let mut buf = [0u8; 512];

    let lost = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Serial I/O worker cancelled");
                break false;
            }

            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    debug!("Sending {} bytes", frame.len());
                    let written = async {
                        writer.write_all(&frame).await?;
                        writer.flush().await
                    }
                    .await;
                    if let Err(e) = written {
                        error!("Write error: {}", e);
                        break true;
                    }
                }
                None => break false,
            },

            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    // EOF - connection closed
                    info!("Connection closed by remote");
                    break true;
                }
                Ok(n) => {
                    for frame in reassembler.process_bytes(&buf[..n]) {
                        handle_frame(&frame, &ctx);
                    }
                }
                Err(e) => {
                    error!("Read error: {}", e);
                    break true;
                }
            },
        }
    };

    status.set_connected(false);
    if lost {
        let _ = ctx.signal_tx.send(SessionSignal::LinkLost { device });
    }
    debug!("Serial I/O worker stopped");
}

fn handle_frame(frame: &[u8], ctx: &WorkerContext) {
    match ctx.codec.decode(frame, &ctx.pump) {
        Ok(Decoded::Handshake { model, protocol }) => {
            info!("Handshake reply: model {} protocol {}", model, protocol);
            let _ = ctx
                .signal_tx
                .send(SessionSignal::HandshakeComplete { model, protocol });
        }
        Ok(Decoded::HistoryRecord(record)) => {
            debug!("History record: {:?}", record.category);
            ctx.notifier.publish(PumpEvent::HistoryRecord(record));
        }
        Ok(Decoded::BolusProgress { delivered }) => {
            ctx.notifier.publish(PumpEvent::BolusProgress { delivered });
        }
        Ok(Decoded::Ack { code, ok: false }) => {
            warn!("Command {:#06x} rejected by pump", code);
        }
        Ok(decoded) => debug!("Decoded: {:?}", decoded),
        Err(e) => warn!("Dropping inbound frame: {}", e),
    }
}
