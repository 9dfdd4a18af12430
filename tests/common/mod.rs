//! Simulated pump for integration tests.
//!
//! Serves the pump side of the serial protocol over an in-memory duplex
//! stream and records every command it receives.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast, Notify};
use tokio::time::{timeout, Duration, Instant};

use pumplink::bluetooth::codec::parse_frame;
use pumplink::bluetooth::{build_frame, codes, Connector, FrameReassembler, Link, RecordType};
use pumplink::{Clock, Config, ConnectError, ConnectionState, ProtocolEngine, PumpEvent};

pub const DEVICE: &str = "PUMP12345AB";

/// How the simulated pump answers.
#[derive(Debug, Clone)]
pub struct Behavior {
    pub answer_handshake: bool,
    /// Acknowledge bolus stops from this stop onwards.
    pub stop_acks_from: Option<u32>,
    pub history_records: u8,
    /// Close the link instead of answering a history request.
    pub drop_on_history: bool,
    pub reject_bolus: bool,
    pub finish_bolus: bool,
    pub status_basic: [u8; 8],
    pub user_options_ok: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            answer_handshake: true,
            stop_acks_from: Some(1),
            history_records: 2,
            drop_on_history: false,
            reject_bolus: false,
            finish_bolus: true,
            // running, 5.00 of 25.00 U today, 150.00 U left, 80% battery
            status_basic: [0, 0x01, 0xF4, 0x09, 0xC4, 0x3A, 0x98, 80],
            user_options_ok: true,
        }
    }
}

pub struct SimulatedPump {
    behavior: Arc<Mutex<Behavior>>,
    received: Arc<Mutex<Vec<u16>>>,
    sever: Arc<Notify>,
}

impl SimulatedPump {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Arc::new(Mutex::new(behavior)),
            received: Arc::new(Mutex::new(Vec::new())),
            sever: Arc::new(Notify::new()),
        })
    }

    pub fn update(&self, f: impl FnOnce(&mut Behavior)) {
        f(&mut self.behavior.lock().unwrap());
    }

    /// Command codes in the order they arrived.
    pub fn received(&self) -> Vec<u16> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self, code: u16) -> usize {
        self.received().iter().filter(|c| **c == code).count()
    }

    /// Drop the link from the pump side.
    pub fn sever(&self) {
        self.sever.notify_one();
    }
}

#[async_trait]
impl Connector for SimulatedPump {
    async fn open(&self, device: &str) -> Result<Link, ConnectError> {
        if device != DEVICE {
            return Err(ConnectError::DeviceNotFound(device.to_string()));
        }
        let (local, remote) = tokio::io::duplex(4096);
        tokio::spawn(serve(
            remote,
            self.behavior.clone(),
            self.received.clone(),
            self.sever.clone(),
        ));
        let (reader, writer) = tokio::io::split(local);
        Ok(Link::new(device, Box::new(reader), Box::new(writer)))
    }
}

async fn serve(
    stream: DuplexStream,
    behavior: Arc<Mutex<Behavior>>,
    received: Arc<Mutex<Vec<u16>>>,
    sever: Arc<Notify>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut reassembler = FrameReassembler::new();
    let mut buf = [0u8; 512];
    let mut stops = 0u32;

    loop {
        let n = tokio::select! {
            _ = sever.notified() => return,
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            },
        };

        for frame in reassembler.process_bytes(&buf[..n]) {
            let Ok((code, params)) = parse_frame(&frame) else {
                continue;
            };
            received.lock().unwrap().push(code);
            let b = behavior.lock().unwrap().clone();

            let replies = match code {
                codes::CHECK_VALUE if b.answer_handshake => {
                    vec![build_frame(codes::CHECK_VALUE, &[5, 2, 1])]
                }
                codes::CHECK_VALUE => vec![],
                codes::BOLUS_STOP => {
                    stops += 1;
                    match b.stop_acks_from {
                        Some(from) if stops >= from => vec![build_frame(codes::BOLUS_STOP, &[0])],
                        _ => vec![],
                    }
                }
                codes::BOLUS_START if b.reject_bolus => {
                    vec![build_frame(codes::BOLUS_START, &[1])]
                }
                codes::BOLUS_START => {
                    let mut replies = vec![build_frame(codes::BOLUS_START, &[0])];
                    if b.finish_bolus {
                        replies.push(build_frame(codes::BOLUS_PROGRESS, &params[..2]));
                        replies.push(build_frame(codes::BOLUS_FINISHED, &[]));
                    }
                    replies
                }
                c if c == codes::HISTORY_EVENTS
                    || RecordType::from_history_command(c).is_some() =>
                {
                    if b.drop_on_history {
                        return;
                    }
                    let mut replies: Vec<Vec<u8>> = (0..b.history_records)
                        .map(|i| build_frame(c, &[26, 3, 14, 10, i, 0, 10 + i]))
                        .collect();
                    replies.push(build_frame(codes::HISTORY_DONE, &[]));
                    replies
                }
                codes::STATUS_BASIC => vec![build_frame(codes::STATUS_BASIC, &b.status_basic)],
                codes::STATUS_TEMP_BASAL => vec![build_frame(codes::STATUS_TEMP_BASAL, &[0, 0, 0])],
                codes::STATUS_EXTENDED_BOLUS => {
                    vec![build_frame(codes::STATUS_EXTENDED_BOLUS, &[0, 0, 0, 0])]
                }
                codes::SET_USER_OPTIONS => {
                    let result = if b.user_options_ok { 0 } else { 1 };
                    vec![build_frame(codes::SET_USER_OPTIONS, &[result])]
                }
                other => vec![build_frame(other, &[0])],
            };

            for reply in replies {
                if writer.write_all(&reply).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Wall clock that starts at a fixed time and follows tokio's clock.
pub struct TestClock {
    base_ms: i64,
    start: Instant,
}

impl TestClock {
    /// `offset_ms` past a whole minute.
    pub fn at_minute_offset(offset_ms: i64) -> Arc<Self> {
        // 2026-03-14 10:00:00 UTC
        let minute = 1_773_482_400_000;
        Arc::new(Self {
            base_ms: minute + offset_ms,
            start: Instant::now(),
        })
    }
}

impl Clock for TestClock {
    fn now_millis(&self) -> i64 {
        self.base_ms + self.start.elapsed().as_millis() as i64
    }
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.pump.device_name = DEVICE.to_string();
    config
}

pub fn engine(pump: &Arc<SimulatedPump>) -> ProtocolEngine {
    ProtocolEngine::new(config(), pump.clone())
}

/// Connect and wait for the handshake to complete.
pub async fn connect_ready(engine: &ProtocolEngine) {
    engine.connect().await.unwrap();
    wait_for_state(engine, ConnectionState::ConnectedReady).await;
}

pub async fn wait_for_state(engine: &ProtocolEngine, state: ConnectionState) {
    timeout(Duration::from_secs(5), async {
        while engine.state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("state not reached");
}

/// Next event matching `pred`, skipping others.
pub async fn next_event(
    events: &mut broadcast::Receiver<PumpEvent>,
    pred: impl Fn(&PumpEvent) -> bool,
) -> PumpEvent {
    timeout(Duration::from_secs(30), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not published")
}
