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

//! Transport abstraction for the serial link to the pump.
//!
//! A [`Connector`] opens a [`Link`]: the two halves of a byte stream, a
//! shared connected flag, and optionally a monitor of link events for the
//! bound device. The serial worker takes ownership of the halves; everyone
//! else only queries [`LinkStatus`].

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::ConnectError;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Link-level events reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The device with this identity dropped its link.
    Lost { device: String },
}

/// Shared connected flag of a link.
#[derive(Debug, Clone)]
pub struct LinkStatus(Arc<AtomicBool>);

impl LinkStatus {
    pub fn new(connected: bool) -> Self {
        Self(Arc::new(AtomicBool::new(connected)))
    }

    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.0.store(connected, Ordering::SeqCst);
    }
}

/// An open link to a device.
pub struct Link {
    device: String,
    reader: BoxedReader,
    writer: BoxedWriter,
    status: LinkStatus,
    monitor: Option<mpsc::UnboundedReceiver<LinkEvent>>,
}

impl Link {
    pub fn new(device: impl Into<String>, reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            device: device.into(),
            reader,
            writer,
            status: LinkStatus::new(true),
            monitor: None,
        }
    }

    /// Attach a monitor that reports link events for this device.
    pub fn with_monitor(mut self, monitor: mpsc::UnboundedReceiver<LinkEvent>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Identity of the bound device.
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn status(&self) -> LinkStatus {
        self.status.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    /// Mark the link closed. The stream itself closes when the halves drop.
    pub fn close(self) {
        self.status.set_connected(false);
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        BoxedReader,
        BoxedWriter,
        LinkStatus,
        Option<mpsc::UnboundedReceiver<LinkEvent>>,
    ) {
        (self.reader, self.writer, self.status, self.monitor)
    }
}

/// Opens links to devices by identity.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, device: &str) -> Result<Link, ConnectError>;
}
