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

//! Pump session protocol engine.
//!
//! Owns the connection lifecycle and the completion waits that sit on top
//! of the asynchronous serial protocol:
//!
//! - the bolus stop is resent until the pump acknowledges it, with no
//!   timeout; only [`ProtocolEngine::override_bolus_stop`] ends it early
//! - a history download polls for the history-done marker while the link
//!   is up
//! - basal changes can be gated on the wall clock reaching a whole minute
//!
//! Every long operation is an async fn that sleeps cooperatively; callers
//! run them on a background task.

use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bluetooth::{
    Command, Connector, FrameCodec, LinkEvent, MessageCodec, RecordType, SerialIoWorker,
    SessionSignal, WorkerContext,
};
use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::events::{EventNotifier, PumpEvent};
use crate::state::{ConnectionState, PumpState};

const MINUTE_MS: i64 = 60_000;

pub(crate) const HISTORY_DOWNLOAD: &str = "history download";

/// Just past a whole minute.
const WHOLE_MINUTE_PASSED_MS: i64 = 59_800;

/// Close enough to the next whole minute.
const WHOLE_MINUTE_APPROACH_MS: i64 = 3_000;

/// Wall clock source.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Outcome of a pump operation, as reported to higher layers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PumpEnactResult {
    pub success: bool,
    pub enacted: bool,
    pub comment: String,
}

impl PumpEnactResult {
    pub fn success(comment: impl Into<String>) -> Self {
        Self {
            success: true,
            enacted: false,
            comment: comment.into(),
        }
    }

    pub fn failure(comment: impl Into<String>) -> Self {
        Self {
            success: false,
            enacted: false,
            comment: comment.into(),
        }
    }

    pub fn enacted(mut self, enacted: bool) -> Self {
        self.enacted = enacted;
        self
    }
}

/// Treatment record a bolus is delivered for.
#[derive(Debug, Clone, PartialEq)]
pub struct Treatment {
    pub id: String,
    pub insulin: f64,
    pub carbs: u32,
    pub timestamp: DateTime<Local>,
}

/// The bolus currently being delivered.
#[derive(Debug, Clone)]
pub struct BolusContext {
    pub treatment: Treatment,
    pub started_at: DateTime<Local>,
}

/// How [`ProtocolEngine::bolus_stop`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BolusStopOutcome {
    /// Nothing was sent; the bolus had already stopped.
    AlreadyStopped,
    /// Nothing to stop without a link; marked stopped.
    NotConnected,
    /// The pump acknowledged after this many stop frames were sent.
    Acknowledged { attempts: u32 },
    /// An operator override ended the retry loop after this many stop
    /// frames were sent.
    Overridden { attempts: u32 },
}

#[derive(Default)]
struct Session {
    state: ConnectionState,
    /// Incremented by every connect so stale signals can be told apart.
    generation: u64,
    device: Option<String>,
    worker: Option<SerialIoWorker>,
    bolus: Option<BolusContext>,
    stop_override: Option<CancellationToken>,
}

struct Inner {
    config: Config,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn MessageCodec>,
    pump: Arc<PumpState>,
    notifier: EventNotifier,
    clock: Arc<dyn Clock>,
    session: Mutex<Session>,
}

/// Builder for [`ProtocolEngine`].
pub struct EngineBuilder {
    config: Config,
    connector: Arc<dyn Connector>,
    codec: Option<Arc<dyn MessageCodec>>,
    pump: Option<Arc<PumpState>>,
    notifier: Option<EventNotifier>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    pub fn codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn pump(mut self, pump: Arc<PumpState>) -> Self {
        self.pump = Some(pump);
        self
    }

    pub fn notifier(mut self, notifier: EventNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> ProtocolEngine {
        let inner = Inner {
            config: self.config,
            connector: self.connector,
            codec: self.codec.unwrap_or_else(|| Arc::new(FrameCodec::new())),
            pump: self.pump.unwrap_or_else(PumpState::new),
            notifier: self.notifier.unwrap_or_default(),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            session: Mutex::new(Session::default()),
        };
        ProtocolEngine {
            inner: Arc::new(inner),
        }
    }
}

/// Handle to a pump session. Clones share the session.
#[derive(Clone)]
pub struct ProtocolEngine {
    inner: Arc<Inner>,
}

impl ProtocolEngine {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        Self::builder(config, connector).build()
    }

    pub fn builder(config: Config, connector: Arc<dyn Connector>) -> EngineBuilder {
        EngineBuilder {
            config,
            connector,
            codec: None,
            pump: None,
            notifier: None,
            clock: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn pump(&self) -> &Arc<PumpState> {
        &self.inner.pump
    }

    pub fn notifier(&self) -> &EventNotifier {
        &self.inner.notifier
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PumpEvent> {
        self.inner.notifier.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.session.lock().state
    }

    /// Connected with a live link.
    pub fn is_connected(&self) -> bool {
        let s = self.inner.session.lock();
        s.state.is_connected() && s.worker.as_ref().map_or(false, |w| w.is_connected())
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    pub fn is_handshake_in_progress(&self) -> bool {
        self.state() == ConnectionState::ConnectedHandshaking
    }

    /// The transport's own connected flag, independent of the lifecycle
    /// state.
    pub fn link_connected(&self) -> bool {
        let s = self.inner.session.lock();
        s.worker.as_ref().map_or(false, |w| w.is_connected())
    }

    /// Open the link to the configured pump and start the handshake.
    ///
    /// A no-op unless disconnected. Connectivity failures are published as
    /// [`PumpEvent::ConnectivityError`] and returned; there is no retry.
    pub async fn connect(&self) -> Result<()> {
        let generation = {
            let mut s = self.inner.session.lock();
            if s.state != ConnectionState::Disconnected {
                debug!("connect() ignored, state is {}", s.state.as_str());
                return Ok(());
            }
            s.state = ConnectionState::Connecting;
            s.generation += 1;
            s.generation
        };
        self.inner.notifier.status(ConnectionState::Connecting, None);

        let device = self.inner.config.pump.device_name.clone();
        info!("Connecting to pump {}", device);

        let link = match self.inner.connector.open(&device).await {
            Ok(link) => link,
            Err(e) => {
                error!("Connection to {} failed: {}", device, e);
                {
                    let mut s = self.inner.session.lock();
                    if s.generation == generation && s.state == ConnectionState::Connecting {
                        s.state = ConnectionState::Disconnected;
                    }
                }
                let detail = e.to_string();
                self.inner
                    .notifier
                    .publish(PumpEvent::ConnectivityError(detail.clone()));
                self.inner
                    .notifier
                    .status(ConnectionState::Disconnected, Some(detail));
                return Err(e.into());
            }
        };

        {
            let mut s = self.inner.session.lock();
            if s.generation != generation || s.state != ConnectionState::Connecting {
                info!("Connection attempt was cancelled, closing link");
                link.close();
                return Err(SessionError::ConnectCancelled);
            }

            let (signal_tx, signal_rx) = mpsc::unbounded_channel();
            let ctx = WorkerContext {
                codec: self.inner.codec.clone(),
                pump: self.inner.pump.clone(),
                notifier: self.inner.notifier.clone(),
                signal_tx,
            };
            let (worker, monitor) = SerialIoWorker::spawn(link, ctx);

            s.worker = Some(worker);
            s.device = Some(device.clone());
            s.state = ConnectionState::ConnectedHandshaking;

            tokio::spawn(supervise(
                Arc::downgrade(&self.inner),
                generation,
                signal_rx,
                monitor,
            ));
        }

        info!("Link to {} open, handshaking", device);
        self.inner
            .notifier
            .status(ConnectionState::ConnectedHandshaking, None);
        self.send(&Command::CheckValue);
        Ok(())
    }

    /// Mark the handshake complete.
    pub fn finish_handshaking(&self) {
        let mut s = self.inner.session.lock();
        let generation = s.generation;
        self.complete_handshake(&mut s, generation);
    }

    fn complete_handshake(&self, s: &mut Session, generation: u64) {
        if s.generation != generation || s.state != ConnectionState::ConnectedHandshaking {
            debug!("Ignoring handshake completion in state {}", s.state.as_str());
            return;
        }
        s.state = ConnectionState::ConnectedReady;
        info!("Handshake complete");
        self.inner.notifier.status(ConnectionState::ConnectedReady, None);
    }

    /// Tear the session down.
    pub fn disconnect(&self, reason: &str) {
        if !self.teardown(reason, |_| true) {
            debug!("disconnect({}) ignored, not connected", reason);
        }
    }

    /// Abort a connection that has not finished its handshake.
    pub fn stop_connecting(&self) {
        let stopped = self.teardown("stopConnecting", |s| {
            matches!(
                s.state,
                ConnectionState::Connecting | ConnectionState::ConnectedHandshaking
            )
        });
        if !stopped {
            debug!("stopConnecting() ignored");
        }
    }

    /// React to a link event from the transport. Only events for the bound
    /// device end the session.
    pub fn on_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Lost { device } => self.handle_link_lost(None, &device),
        }
    }

    fn handle_link_lost(&self, generation: Option<u64>, device: &str) {
        let lost = self.teardown("link lost", |s| {
            s.device.as_deref() == Some(device)
                && generation.map_or(true, |g| g == s.generation)
        });
        if lost {
            warn!("Link to {} lost", device);
        } else {
            debug!("Ignoring link loss of {}", device);
        }
    }

    /// Transition to Disconnected if `applies` holds for the session.
    fn teardown(&self, reason: &str, applies: impl FnOnce(&Session) -> bool) -> bool {
        let (worker, stopping) = {
            let mut s = self.inner.session.lock();
            if s.state == ConnectionState::Disconnected || !applies(&s) {
                return false;
            }
            s.state = ConnectionState::Disconnected;
            s.device = None;
            s.bolus = None;
            (s.worker.take(), s.stop_override.is_some())
        };

        if let Some(worker) = worker {
            worker.disconnect(reason);
        }
        self.inner.pump.reset();
        if stopping {
            // A running stop outlives the session
            self.inner.pump.set_bolus_stop_forced(true);
        }
        self.inner
            .notifier
            .status(ConnectionState::Disconnected, Some(reason.to_string()));
        true
    }

    /// Queue a command for transmission. Does not wait for a reply.
    ///
    /// Returns false, sending nothing, when not connected.
    pub fn send(&self, command: &Command) -> bool {
        let s = self.inner.session.lock();
        match s.worker.as_ref() {
            Some(worker) if s.state.is_connected() && worker.is_connected() => {
                debug!("Sending {:?}", command);
                worker.send(self.inner.codec.encode(command))
            }
            _ => {
                debug!("Not connected, dropping {:?}", command);
                false
            }
        }
    }

    /// Claim the in-flight bolus slot.
    pub fn begin_bolus(&self, treatment: Treatment) -> Result<()> {
        let mut s = self.inner.session.lock();
        if let Some(current) = &s.bolus {
            warn!(
                "Bolus of {} U requested while {} U is in flight",
                treatment.insulin, current.treatment.insulin
            );
            return Err(SessionError::BolusInProgress);
        }
        s.bolus = Some(BolusContext {
            treatment,
            started_at: Local::now(),
        });
        Ok(())
    }

    /// Release the in-flight slot if `treatment_id` still owns it.
    pub fn clear_bolus(&self, treatment_id: &str) -> bool {
        let mut s = self.inner.session.lock();
        match &s.bolus {
            Some(current) if current.treatment.id == treatment_id => {
                s.bolus = None;
                true
            }
            Some(current) => {
                debug!(
                    "Not clearing bolus {}, slot belongs to {}",
                    treatment_id, current.treatment.id
                );
                false
            }
            None => false,
        }
    }

    pub fn bolusing_treatment(&self) -> Option<Treatment> {
        self.inner
            .session
            .lock()
            .bolus
            .as_ref()
            .map(|b| b.treatment.clone())
    }

    /// Stop the running bolus and wait for the pump to acknowledge.
    ///
    /// The stop is resent every retry interval until acknowledged. There is
    /// no timeout and link loss does not end the wait; only
    /// [`override_bolus_stop`](Self::override_bolus_stop) does. While the
    /// link is down retries still elapse and count towards escalation, but
    /// nothing is transmitted.
    pub async fn bolus_stop(&self) -> BolusStopOutcome {
        let pump = &self.inner.pump;
        let stopping = self.bolusing_treatment();
        debug!(
            "bolusStop >>>>> @ {}",
            stopping
                .as_ref()
                .map(|t| t.insulin.to_string())
                .unwrap_or_default()
        );

        pump.set_bolus_stop_forced(true);
        if pump.is_bolus_stopped() {
            debug!("Bolus already stopped");
            return BolusStopOutcome::AlreadyStopped;
        }
        if !self.is_connected() {
            pump.set_bolus_stopped(true);
            return BolusStopOutcome::NotConnected;
        }

        let token = self
            .inner
            .session
            .lock()
            .stop_override
            .get_or_insert_with(CancellationToken::new)
            .clone();
        let interval = self.inner.config.timing.bolus_stop_retry();
        let escalate_after = self.inner.config.session.bolus_stop_escalation_retries;

        let mut attempts = u32::from(self.send(&Command::BolusStop));
        let mut retries = 0u32;

        let outcome = loop {
            tokio::select! {
                _ = sleep(interval) => {}
                _ = token.cancelled() => {
                    warn!("Bolus stop overridden after {} attempts", attempts);
                    break BolusStopOutcome::Overridden { attempts };
                }
            }
            if pump.is_bolus_stopped() {
                break BolusStopOutcome::Acknowledged { attempts };
            }

            if self.send(&Command::BolusStop) {
                attempts += 1;
            }
            retries += 1;
            if escalate_after > 0 && retries == escalate_after {
                warn!(
                    "Bolus stop unacknowledged after {} retries ({} sent)",
                    retries, attempts
                );
                self.inner
                    .notifier
                    .publish(PumpEvent::BolusStopUnacknowledged { retries, attempts });
            }
        };

        self.inner.session.lock().stop_override = None;
        if matches!(outcome, BolusStopOutcome::Acknowledged { .. }) {
            info!("Bolus stop acknowledged after {} attempts", attempts);
            if let Some(treatment) = stopping {
                self.clear_bolus(&treatment.id);
            }
        }
        outcome
    }

    /// Operator override: abandon a running bolus stop. Returns false if
    /// none is running.
    pub fn override_bolus_stop(&self) -> bool {
        match self.inner.session.lock().stop_override.as_ref() {
            Some(token) => {
                warn!("Operator override of bolus stop");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Download one history segment.
    ///
    /// Fails without sending anything when not connected, and fails if the
    /// link drops before the pump reports the segment done.
    pub async fn load_history(&self, record: RecordType) -> PumpEnactResult {
        if !self.is_connected() {
            return PumpEnactResult::failure(SessionError::NotConnected.to_string());
        }
        let timing = &self.inner.config.timing;
        info!("Loading {} history", record.as_str());

        self.inner.pump.set_history_done_received(false);
        self.send(&Command::CommStart);
        sleep(timing.history_settle()).await;
        self.send(&Command::HistoryRequest(record));

        let completed = self.wait_for_history_done().await;

        sleep(timing.history_trailing()).await;
        self.send(&Command::CommStop);

        if completed {
            PumpEnactResult::success("OK")
        } else {
            warn!("Link lost during {} history download", record.as_str());
            PumpEnactResult::failure(SessionError::LinkLost(HISTORY_DOWNLOAD).to_string())
        }
    }

    /// [`load_history`](Self::load_history) for a raw record type code.
    /// Unknown codes fail before anything is sent.
    pub async fn load_history_code(&self, code: u8) -> PumpEnactResult {
        match RecordType::from_code(code) {
            Ok(record) => self.load_history(record).await,
            Err(e) => {
                warn!("{}", e);
                PumpEnactResult::failure(e.to_string())
            }
        }
    }

    /// Poll until the history-done marker arrives or the link drops.
    /// Returns whether the marker arrived.
    pub async fn wait_for_history_done(&self) -> bool {
        let poll = self.inner.config.timing.history_poll();
        loop {
            if self.inner.pump.is_history_done_received() {
                return true;
            }
            if !self.link_connected() {
                return false;
            }
            sleep(poll).await;
        }
    }

    /// Block until the wall clock is close to a whole minute.
    pub async fn wait_for_whole_minute(&self) {
        let poll = self.inner.config.timing.time_sync_poll();
        loop {
            let now = self.inner.clock.now_millis();
            let to_whole_minute = MINUTE_MS - now.rem_euclid(MINUTE_MS);
            if to_whole_minute > WHOLE_MINUTE_PASSED_MS
                || to_whole_minute < WHOLE_MINUTE_APPROACH_MS
            {
                break;
            }
            self.inner.notifier.publish(PumpEvent::WaitingForTimeSync {
                seconds: (to_whole_minute / 1000) as u64,
            });
            sleep(Duration::from_millis(to_whole_minute as u64).min(poll)).await;
        }
    }

    /// Current wall clock time according to the engine's clock.
    pub fn now(&self) -> DateTime<Local> {
        DateTime::<Utc>::from_timestamp_millis(self.inner.clock.now_millis())
            .map(|t| t.with_timezone(&Local))
            .unwrap_or_else(Local::now)
    }
}

async fn next_link_event(
    monitor: &mut Option<mpsc::UnboundedReceiver<LinkEvent>>,
) -> Option<LinkEvent> {
    match monitor {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Route worker signals and transport link events of one session back to
/// the engine. Ends with the worker.
async fn supervise(
    inner: Weak<Inner>,
    generation: u64,
    mut signals: mpsc::UnboundedReceiver<SessionSignal>,
    mut monitor: Option<mpsc::UnboundedReceiver<LinkEvent>>,
) {
    loop {
        let signal = tokio::select! {
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
            Some(event) = next_link_event(&mut monitor) => match event {
                LinkEvent::Lost { device } => SessionSignal::LinkLost { device },
            },
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        let engine = ProtocolEngine { inner };
        match signal {
            SessionSignal::HandshakeComplete { .. } => {
                let mut s = engine.inner.session.lock();
                engine.complete_handshake(&mut s, generation);
            }
            SessionSignal::LinkLost { device } => {
                engine.handle_link_lost(Some(generation), &device);
            }
        }
    }
    debug!("Session {} supervisor stopped", generation);
}
