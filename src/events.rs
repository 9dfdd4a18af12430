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

//! Session event publishing.

use tokio::sync::broadcast;
use tracing::debug;

use crate::bluetooth::HistoryRecord;
use crate::state::ConnectionState;

/// Capacity of the broadcast channel. Slow observers lag rather than block
/// the engine.
const EVENT_CAPACITY: usize = 64;

/// Events published by a pump session.
#[derive(Debug, Clone, PartialEq)]
pub enum PumpEvent {
    /// Connection state changed.
    StatusChanged {
        state: ConnectionState,
        detail: Option<String>,
    },
    /// Waiting for the clock to reach a whole minute.
    WaitingForTimeSync { seconds: u64 },
    /// The link could not be established. Shown to the user.
    ConnectivityError(String),
    /// A history record arrived from the pump.
    HistoryRecord(HistoryRecord),
    /// Progress of the running bolus.
    BolusProgress { delivered: f64 },
    /// The stop command is still unacknowledged after `retries` retry
    /// intervals. `attempts` counts the stop frames actually sent, which is
    /// lower when the link was down for part of the time.
    BolusStopUnacknowledged { retries: u32, attempts: u32 },
    /// Today's total is close to the daily maximum.
    DailyLimitApproaching { total: f64, max: f64 },
}

/// Fire-and-forget publisher for [`PumpEvent`]s.
#[derive(Debug, Clone)]
pub struct EventNotifier {
    tx: broadcast::Sender<PumpEvent>,
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl EventNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no observers is not an error.
    pub fn publish(&self, event: PumpEvent) {
        if self.tx.send(event).is_err() {
            debug!("No event observers");
        }
    }

    /// Publish a connection state change.
    pub fn status(&self, state: ConnectionState, detail: Option<String>) {
        self.publish(PumpEvent::StatusChanged { state, detail });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PumpEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_observers() {
        let notifier = EventNotifier::new();
        notifier.publish(PumpEvent::WaitingForTimeSync { seconds: 12 });
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let notifier = EventNotifier::new();
        let mut rx = notifier.subscribe();

        notifier.status(ConnectionState::Connecting, None);
        notifier.status(
            ConnectionState::Disconnected,
            Some("stopConnecting".to_string()),
        );

        assert_eq!(
            rx.recv().await.unwrap(),
            PumpEvent::StatusChanged {
                state: ConnectionState::Connecting,
                detail: None
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            PumpEvent::StatusChanged {
                state: ConnectionState::Disconnected,
                detail: Some("stopConnecting".to_string())
            }
        );
    }
}
