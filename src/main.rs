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

//! pumplink daemon

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pumplink::bluetooth::RfcommConnector;
use pumplink::{Config, ConnectionState, ProtocolEngine, PumpDriver, PumpEvent, SerialPumpDriver};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pumplink=info".parse()?),
        )
        .init();

    info!("Starting pumplink v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");
    if config.pump.device_name.is_empty() {
        warn!("No pump configured, set pump.device_name in the config file");
    }

    let connector = Arc::new(RfcommConnector::new(config.pump.rfcomm_channel));
    let engine = ProtocolEngine::new(config, connector);
    let driver = Arc::new(SerialPumpDriver::new(engine.clone()));

    // Log session events and refresh status once the session is ready
    let mut events = engine.subscribe();
    let driver_events = driver.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PumpEvent::StatusChanged { state, detail }) => {
                    info!(
                        "Pump {}{}",
                        state.as_str(),
                        detail.map(|d| format!(" ({})", d)).unwrap_or_default()
                    );
                    if state == ConnectionState::ConnectedReady {
                        let driver = driver_events.clone();
                        tokio::spawn(async move {
                            if driver.refresh_status().await {
                                let status = driver.engine().pump().status();
                                info!(
                                    "Reservoir {} U, battery {}%, today {} U",
                                    status.reservoir_units,
                                    status.battery_percent,
                                    status.daily_total_units
                                );
                            }
                        });
                    }
                }
                Ok(PumpEvent::ConnectivityError(e)) => error!("Connectivity error: {}", e),
                Ok(PumpEvent::BolusStopUnacknowledged { retries, attempts }) => error!(
                    "Bolus stop still unacknowledged after {} retries ({} sent)",
                    retries, attempts
                ),
                Ok(PumpEvent::DailyLimitApproaching { total, max }) => {
                    warn!("Daily insulin {} U is close to the limit of {} U", total, max)
                }
                Ok(event) => info!("Event: {:?}", event),
                Err(RecvError::Lagged(n)) => warn!("Event log skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Err(e) = driver.connect().await {
        error!("Failed to connect: {}", e);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    driver.disconnect("shutdown");

    info!("pumplink stopped");
    Ok(())
}
