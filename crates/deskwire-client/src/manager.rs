//! Connection lifecycle: connect, heartbeat, reconnect with backoff, and the
//! circuit breaker that ends it all after too many errors.
//!
//! Every transition happens under one short-lived lock on [`Inner`]; events
//! are emitted only after the lock is released, so subscribers may call back
//! into the manager. Background tasks (event pump, reconnect loop) carry the
//! connection generation they were started for and go quiet once it changes.
//! Handshakes are serialized by an async lock, so at most one `open` is in
//! flight and the channel's socket always belongs to the latest handshake.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use deskwire_core::{
    AgentId, ClientEvent, ConnectionError, ConnectionState, DisconnectReason, ErrorRecord,
    EventKind, HandlerError, ServerEvent, ServerEventKind,
};
use deskwire_settings::ConnectionSettings;
use deskwire_telemetry::MetricsRecorder;

use crate::channel::{ConnectionChannel, Frame, TransportEvent};
use crate::circuit::{BreakerVerdict, CircuitBreaker};
use crate::heartbeat::HeartbeatController;
use crate::reconnect::ReconnectionPolicy;
use crate::registry::{SubscriptionId, SubscriptionRegistry};

/// Frame announcing the agent to the server after every successful open.
pub const AGENT_JOIN_EVENT: &str = "agent-join";

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub url: String,
    pub agent_id: AgentId,
    pub reconnection_attempts: u32,
    pub reconnection_delay: Duration,
    pub max_reconnection_delay: Duration,
    pub heartbeat_interval: Duration,
    pub max_errors: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&ConnectionSettings::default())
    }
}

impl From<&ConnectionSettings> for ConnectionConfig {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            url: settings.url.clone(),
            agent_id: settings
                .agent_id
                .as_deref()
                .map(AgentId::from_raw)
                .unwrap_or_default(),
            reconnection_attempts: settings.reconnection_attempts,
            reconnection_delay: Duration::from_millis(settings.reconnection_delay_ms),
            max_reconnection_delay: Duration::from_millis(settings.max_reconnection_delay_ms),
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
            max_errors: settings.max_errors,
        }
    }
}

impl ConnectionConfig {
    pub fn policy(&self) -> ReconnectionPolicy {
        ReconnectionPolicy {
            base_delay: self.reconnection_delay,
            max_delay: self.max_reconnection_delay,
            max_attempts: self.reconnection_attempts,
        }
    }
}

/// Point-in-time view for dashboards and diagnostics.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub agent_id: AgentId,
    pub url: String,
    pub error_count: u32,
    pub max_errors: u32,
    pub reconnect_attempts: u32,
    pub circuit_open: bool,
    /// Time since the circuit opened, while it is open.
    pub circuit_open_for_ms: Option<u64>,
    pub heartbeats_sent: u64,
    pub last_error: Option<ErrorRecord>,
    pub recent_errors: Vec<ErrorRecord>,
}

type Transition = Option<(ConnectionState, ConnectionState)>;

struct Inner {
    state: ConnectionState,
    breaker: CircuitBreaker,
    /// Consecutive failed reconnection attempts.
    attempts: u32,
    generation: u64,
    reconnect: Option<CancellationToken>,
}

impl Inner {
    fn set_state(&mut self, next: ConnectionState) -> Transition {
        if self.state == next {
            return None;
        }
        let from = std::mem::replace(&mut self.state, next);
        debug!(from = %from, to = %next, "connection state changed");
        Some((from, next))
    }
}

struct Shared {
    config: ConnectionConfig,
    policy: ReconnectionPolicy,
    channel: Arc<dyn ConnectionChannel>,
    heartbeat: HeartbeatController,
    registry: SubscriptionRegistry,
    metrics: Option<Arc<MetricsRecorder>>,
    inner: Mutex<Inner>,
    /// Held from `open` until the result is applied.
    handshake: AsyncMutex<()>,
}

/// Cloneable handle to one managed connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, channel: Arc<dyn ConnectionChannel>) -> Self {
        Self::build(config, channel, None)
    }

    pub fn with_metrics(
        config: ConnectionConfig,
        channel: Arc<dyn ConnectionChannel>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self::build(config, channel, Some(metrics))
    }

    fn build(
        config: ConnectionConfig,
        channel: Arc<dyn ConnectionChannel>,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        let heartbeat = HeartbeatController::new(Arc::clone(&channel), config.heartbeat_interval);
        let inner = Inner {
            state: ConnectionState::Disconnected,
            breaker: CircuitBreaker::new(config.max_errors),
            attempts: 0,
            generation: 0,
            reconnect: None,
        };
        Self {
            shared: Arc::new(Shared {
                policy: config.policy(),
                config,
                channel,
                heartbeat,
                registry: SubscriptionRegistry::new(),
                metrics,
                inner: Mutex::new(inner),
                handshake: AsyncMutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.shared.config.agent_id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn status(&self) -> ConnectionStatus {
        let inner = self.shared.inner.lock();
        ConnectionStatus {
            state: inner.state,
            agent_id: self.shared.config.agent_id.clone(),
            url: self.shared.config.url.clone(),
            error_count: inner.breaker.error_count(),
            max_errors: inner.breaker.max_errors(),
            reconnect_attempts: inner.attempts,
            circuit_open: inner.breaker.is_open(),
            circuit_open_for_ms: inner
                .breaker
                .opened_at()
                .map(|since| u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)),
            heartbeats_sent: self.shared.heartbeat.beats_sent(),
            last_error: inner.breaker.last_error().cloned(),
            recent_errors: inner.breaker.history().cloned().collect(),
        }
    }

    // ── Subscriptions ──────────────────────────────────────────────────

    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ClientEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.shared.registry.subscribe(kind, Arc::new(handler))
    }

    pub fn off(&self, kind: &EventKind, id: SubscriptionId) -> bool {
        self.shared.registry.unsubscribe(kind, id)
    }

    /// Convenience subscription for [`ClientEvent::Error`].
    pub fn on_error<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ErrorRecord) + Send + Sync + 'static,
    {
        self.on(EventKind::Error, move |event| {
            if let ClientEvent::Error(record) = event {
                handler(record);
            }
            Ok(())
        })
    }

    /// Deliver `event` to its subscribers.
    ///
    /// Handler failures are logged and re-published as `error` events,
    /// except failures of `error` handlers themselves, which are only logged.
    pub fn emit(&self, event: ClientEvent) {
        let failures = self.shared.registry.dispatch(&event);
        if failures.is_empty() {
            return;
        }
        let reportable = event.kind() != EventKind::Error;
        for failure in failures {
            warn!(
                event = %failure.event,
                subscription = %failure.subscription,
                panicked = failure.panicked,
                error = %failure.message,
                "event handler failed"
            );
            if reportable {
                let sequence = self.shared.inner.lock().breaker.allocate_sequence();
                let record = ErrorRecord::new(
                    "handler_error",
                    format!("{} handler: {}", failure.event, failure.message),
                    sequence,
                );
                for nested in self.shared.registry.dispatch(&ClientEvent::Error(record)) {
                    warn!(
                        subscription = %nested.subscription,
                        error = %nested.message,
                        "error handler failed"
                    );
                }
            }
        }
    }

    fn emit_transition(&self, transition: Transition) {
        if let Some((from, to)) = transition {
            self.emit(ClientEvent::StateChanged { from, to });
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Open the connection.
    ///
    /// No-op when already connected or connecting. Fails fast without a
    /// handshake while the circuit is open. Cancels any pending reconnect and
    /// attempts immediately.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let (generation, transition) = {
            let mut inner = self.shared.inner.lock();
            if inner.breaker.is_open() {
                let errors = inner.breaker.error_count();
                drop(inner);
                warn!(errors, "connect refused: circuit breaker open");
                return Err(ConnectionError::CircuitOpen { errors });
            }
            if inner.state.is_active() {
                debug!(state = %inner.state, "connect ignored: already active");
                return Ok(());
            }
            if let Some(pending) = inner.reconnect.take() {
                pending.cancel();
            }
            inner.generation += 1;
            (inner.generation, inner.set_state(ConnectionState::Connecting))
        };
        self.emit_transition(transition);

        // A retry handshake may still be unwinding from the cancel above.
        let _handshake = self.shared.handshake.lock().await;
        if !self.is_current(generation) {
            debug!("connect superseded before the handshake started");
            return Ok(());
        }

        info!(url = %self.shared.config.url, agent_id = %self.shared.config.agent_id, "connecting");
        match self.shared.channel.open(&self.shared.config.url).await {
            Ok(events) => {
                self.on_opened(generation, events, None);
                Ok(())
            }
            Err(e) => {
                if self.is_current(generation) {
                    let open = self.record_error("connect_error", &e.to_string());
                    if !open {
                        self.schedule_reconnect(generation);
                    }
                }
                Err(e.into())
            }
        }
    }

    /// Close the connection and stop all timers. Idempotent.
    ///
    /// The circuit state survives: a disconnect while open stays open.
    pub fn disconnect(&self) {
        let (transition, pending) = {
            let mut inner = self.shared.inner.lock();
            inner.generation += 1;
            let target = if inner.breaker.is_open() {
                ConnectionState::CircuitOpen
            } else {
                ConnectionState::Disconnected
            };
            (inner.set_state(target), inner.reconnect.take())
        };
        if let Some(pending) = pending {
            pending.cancel();
        }
        self.shared.heartbeat.stop();
        if self.shared.channel.is_open() {
            self.shared.channel.close();
        }

        if transition.is_some() {
            info!("disconnected by client");
            self.emit_transition(transition);
            self.emit(ClientEvent::Disconnected {
                reason: DisconnectReason::Client,
            });
        }
    }

    /// Write a frame. Returns `false` when not connected or when the
    /// transport rejects it.
    pub fn send(&self, event: &str, payload: Value) -> bool {
        let state = self.state();
        if state != ConnectionState::Connected {
            warn!(event, state = %state, "cannot send while not connected");
            return false;
        }
        match self.shared.channel.send(Frame::new(event, payload)) {
            Ok(()) => true,
            Err(e) => {
                self.record_error("send_error", &e.to_string());
                false
            }
        }
    }

    /// Close the circuit and restore the error budget. Does not reconnect.
    pub fn reset_circuit_breaker(&self) {
        let transition = {
            let mut inner = self.shared.inner.lock();
            inner.breaker.reset();
            inner.attempts = 0;
            if inner.state == ConnectionState::CircuitOpen {
                inner.set_state(ConnectionState::Disconnected)
            } else {
                None
            }
        };
        info!("circuit breaker reset by host");
        self.emit_transition(transition);
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn is_current(&self, generation: u64) -> bool {
        self.shared.inner.lock().generation == generation
    }

    fn count(&self, name: &str, labels: &[(&str, &str)]) {
        if let Some(metrics) = &self.shared.metrics {
            metrics.counter_inc(name, labels, 1);
        }
    }

    /// Apply a successful open. Callers hold the handshake lock, so the
    /// channel's socket is the one this open produced.
    fn on_opened(
        &self,
        generation: u64,
        events: mpsc::Receiver<TransportEvent>,
        reconnect_attempt: Option<u32>,
    ) {
        let transition = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                drop(inner);
                debug!("discarding connection opened for a superseded attempt");
                self.shared.channel.close();
                return;
            }
            inner.attempts = 0;
            inner.breaker.clear_count();
            inner.reconnect = None;
            inner.set_state(ConnectionState::Connected)
        };

        let pump = self.clone();
        tokio::spawn(async move { pump.pump(generation, events).await });

        let agent_id = self.shared.config.agent_id.clone();
        self.shared.heartbeat.start(agent_id.clone());
        info!(agent_id = %agent_id, attempt = reconnect_attempt, "connected");

        self.emit_transition(transition);
        self.send(AGENT_JOIN_EVENT, json!({ "agentId": agent_id }));
        if let Some(attempt) = reconnect_attempt {
            self.count("connection.reconnects", &[]);
            self.emit(ClientEvent::Reconnected { attempt });
        }
        self.emit(ClientEvent::Connected { agent_id });
    }

    async fn pump(&self, generation: u64, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            if !self.is_current(generation) {
                return;
            }
            match event {
                TransportEvent::Frame(frame) => {
                    let kind = ServerEventKind::from_wire(&frame.event);
                    self.emit(ClientEvent::Server(ServerEvent::new(kind, frame.data)));
                }
                TransportEvent::Error(message) => {
                    if self.record_error("transport_error", &message) {
                        return;
                    }
                }
                TransportEvent::Closed { reason } => {
                    self.on_transport_closed(generation, reason);
                    return;
                }
            }
        }
        self.on_transport_closed(generation, "event stream ended".to_string());
    }

    fn on_transport_closed(&self, generation: u64, reason: String) {
        let transition = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation || inner.state != ConnectionState::Connected {
                return;
            }
            inner.set_state(ConnectionState::Reconnecting)
        };
        self.shared.heartbeat.stop();
        warn!(reason = %reason, "connection lost");

        self.emit_transition(transition);
        self.emit(ClientEvent::Disconnected {
            reason: DisconnectReason::Transport(reason),
        });
        self.schedule_reconnect(generation);
    }

    fn schedule_reconnect(&self, generation: u64) {
        let token = CancellationToken::new();
        let transition = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation || inner.breaker.is_open() {
                return;
            }
            if let Some(previous) = inner.reconnect.replace(token.clone()) {
                previous.cancel();
            }
            inner.set_state(ConnectionState::Reconnecting)
        };
        self.emit_transition(transition);

        let this = self.clone();
        tokio::spawn(async move { this.reconnect_loop(generation, token).await });
    }

    async fn reconnect_loop(&self, generation: u64, token: CancellationToken) {
        loop {
            let attempt = {
                let inner = self.shared.inner.lock();
                if inner.generation != generation || token.is_cancelled() {
                    return;
                }
                inner.attempts
            };

            if !self.shared.policy.should_retry(attempt) {
                warn!(attempts = attempt, "reconnection attempts exhausted");
                let open = self.record_error(
                    "reconnect_failed",
                    &format!("gave up after {attempt} reconnection attempts"),
                );
                if !open {
                    let tripped = self.shared.inner.lock().breaker.trip();
                    if tripped {
                        self.open_circuit();
                    }
                }
                return;
            }

            let delay = self.shared.policy.delay_for_attempt(attempt);
            info!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            let _handshake = tokio::select! {
                () = token.cancelled() => return,
                guard = self.shared.handshake.lock() => guard,
            };
            if !self.is_current(generation) {
                return;
            }

            let opened = tokio::select! {
                () = token.cancelled() => {
                    debug!("reconnect handshake abandoned");
                    return;
                }
                opened = self.shared.channel.open(&self.shared.config.url) => opened,
            };
            match opened {
                Ok(events) => {
                    self.on_opened(generation, events, Some(attempt + 1));
                    return;
                }
                Err(e) => {
                    {
                        let mut inner = self.shared.inner.lock();
                        if inner.generation != generation {
                            return;
                        }
                        inner.attempts += 1;
                    }
                    if self.record_error("reconnect_error", &e.to_string()) {
                        return;
                    }
                }
            }
        }
    }

    /// Count an error, publish it, and open the circuit if this error
    /// exhausted the budget. Returns whether the circuit is now open.
    fn record_error(&self, kind: &str, message: &str) -> bool {
        let (record, verdict) = self.shared.inner.lock().breaker.record(kind, message);
        self.count("connection.errors", &[("kind", kind)]);
        match verdict {
            BreakerVerdict::Counting { errors, remaining } => {
                warn!(kind, errors, remaining, error = message, "connection error");
            }
            BreakerVerdict::Tripped { errors } | BreakerVerdict::Open { errors } => {
                warn!(kind, errors, error = message, "connection error with circuit open");
            }
        }
        self.emit(ClientEvent::Error(record));
        if matches!(verdict, BreakerVerdict::Tripped { .. }) {
            self.open_circuit();
        }
        verdict.is_open()
    }

    /// Tear down after the breaker opened. Runs once per opening.
    fn open_circuit(&self) {
        let (transition, pending, error_count, last_error) = {
            let mut inner = self.shared.inner.lock();
            inner.generation += 1;
            (
                inner.set_state(ConnectionState::CircuitOpen),
                inner.reconnect.take(),
                inner.breaker.error_count(),
                inner.breaker.last_error().cloned(),
            )
        };
        if let Some(pending) = pending {
            pending.cancel();
        }
        self.shared.heartbeat.stop();
        self.shared.channel.close();

        error!(
            errors = error_count,
            "circuit breaker open; real-time updates suspended until reset"
        );
        self.count("connection.circuit_open", &[]);
        let was_connected = matches!(transition, Some((ConnectionState::Connected, _)));
        self.emit_transition(transition);
        if was_connected {
            self.emit(ClientEvent::Disconnected {
                reason: DisconnectReason::CircuitOpen,
            });
        }
        self.emit(ClientEvent::CircuitBreakerOpen {
            error_count,
            last_error,
        });
    }
}
