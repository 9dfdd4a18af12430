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

//! Bluetooth RFCOMM transport.

use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr, Stream};
use bluer::{Adapter, Address, Device, DeviceEvent, DeviceProperty};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::transport::{Connector, Link, LinkEvent};
use crate::error::ConnectError;

/// Standard SPP UUID.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// Opens RFCOMM links to paired pumps by Bluetooth name.
pub struct RfcommConnector {
    channel: u8,
}

impl RfcommConnector {
    /// Create a connector for the given RFCOMM channel.
    pub fn new(channel: u8) -> Self {
        Self { channel }
    }

    /// Find a paired device whose name matches.
    async fn find_paired_device(adapter: &Adapter, name: &str) -> Result<Address, ConnectError> {
        for addr in adapter.device_addresses().await? {
            let device = adapter.device(addr)?;
            if !device.is_paired().await? {
                continue;
            }
            if device.name().await?.as_deref() == Some(name) {
                return Ok(addr);
            }
        }
        Err(ConnectError::DeviceNotFound(name.to_string()))
    }

    /// Watch the device's connected property and report link loss.
    fn spawn_monitor(device: Device, name: String) -> mpsc::UnboundedReceiver<LinkEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let events = match device.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Cannot watch device {}: {}", name, e);
                    return;
                }
            };
            let mut events = Box::pin(events);

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = events.next() => match event {
                        Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) => {
                            info!("Device was disconnected {}", name);
                            let _ = tx.send(LinkEvent::Lost { device: name.clone() });
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            debug!("Link monitor for {} stopped", name);
        });

        rx
    }
}

#[async_trait]
impl Connector for RfcommConnector {
    async fn open(&self, device_name: &str) -> Result<Link, ConnectError> {
        if device_name.is_empty() {
            return Err(ConnectError::NotConfigured);
        }

        let session = bluer::Session::new().await?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| ConnectError::NoAdapter)?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        // Ensure adapter is powered on
        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        let address = Self::find_paired_device(&adapter, device_name).await?;
        info!(
            "Connecting to {} ({}) on RFCOMM channel {} (SPP {})",
            device_name, address, self.channel, SPP_UUID
        );

        let stream = Stream::connect(SocketAddr::new(address, self.channel)).await?;
        let (reader, writer) = stream.into_split();

        let monitor = Self::spawn_monitor(adapter.device(address)?, device_name.to_string());

        Ok(Link::new(device_name, Box::new(reader), Box::new(writer)).with_monitor(monitor))
    }
}
