//! Gateway (WebSocket) session client.
//!
//! This module owns the persistent connection lifecycle:
//!   - connect → receive HELLO → send IDENTIFY or RESUME
//!   - heartbeat timer with zombie-connection detection
//!   - sequence number + session_id tracking
//!   - reconnect (with resume) on drops, server requests, and missed acks
//!   - gateway send rate limiting (120 events / 60s)
//!
//! The protocol logic lives in [`SessionMachine`], which never touches a
//! socket: it turns inbound envelopes and heartbeat ticks into [`Action`]s.
//! [`GatewayClient`] runs the machine on a tokio task over
//! `tokio_tungstenite` and republishes dispatches on the [`EventBus`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::config::{BotConfig, ReconnectConfig};
use crate::error::{BotError, BotResult};
use crate::events::BotEvent;
use crate::types::{
    GatewayPayload, Hello, Identify, IdentifyProperties, Intents, OpCode, Resume,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// At most 120 gateway sends per 60 seconds.
const SEND_BUDGET_MAX: u32 = 120;
const SEND_BUDGET_WINDOW: Duration = Duration::from_secs(60);

/// How long a fresh socket may stay silent before HELLO.
const HELLO_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounds of the randomized delay before re-handshaking after op 9.
const INVALID_SESSION_DELAY_MS: (u64, u64) = (1_000, 5_000);

// ---------------------------------------------------------------------------
// Gateway send rate limiter
// ---------------------------------------------------------------------------

/// Sliding-window rate limiter for outbound gateway messages.
struct SendRateLimiter {
    timestamps: Vec<Instant>,
    budget: u32,
    window: Duration,
}

impl SendRateLimiter {
    fn new(budget: u32, window: Duration) -> Self {
        Self {
            timestamps: Vec::with_capacity(budget as usize),
            budget,
            window,
        }
    }

    /// How long the caller should wait before sending, or `None` if it can
    /// send immediately. Does not record the send.
    fn delay(&self) -> Option<Duration> {
        let now = Instant::now();
        let in_window: Vec<Instant> = self
            .timestamps
            .iter()
            .copied()
            .filter(|&t| now.duration_since(t) < self.window)
            .collect();

        if (in_window.len() as u32) < self.budget {
            return None;
        }
        in_window
            .into_iter()
            .min()
            .map(|oldest| (oldest + self.window).saturating_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    fn record(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.timestamps.retain(|&t| now.duration_since(t) < window);
        self.timestamps.push(now);
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Connection lifecycle, observable through [`GatewayClient::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingHandshake,
    Identifying,
    Resuming,
    Connected,
    Reconnecting,
}

/// Resumable session bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub session_id: Option<String>,
    /// Last dispatch sequence number; never decreases within a session.
    pub sequence: Option<u64>,
    pub heartbeat_interval: Duration,
    pub heartbeat_acknowledged: bool,
    pub reconnect_attempts: u32,
    /// Server-provided URL to use for RESUME, if any.
    pub resume_gateway_url: Option<String>,
}

/// Why the machine wants a fresh socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectReason {
    /// op 7.
    ServerRequested,
    /// The previous heartbeat was never acknowledged.
    MissedHeartbeatAck,
    /// A dispatch arrived with a lower sequence than one already seen.
    SequenceRegression { previous: u64, received: u64 },
}

/// Side effects requested by [`SessionMachine`].
#[derive(Debug, Clone)]
pub enum Action {
    Send(GatewayPayload),
    /// (Re)start the heartbeat timer at this interval.
    StartHeartbeat(Duration),
    Publish(BotEvent),
    /// Send `payload` after `delay` unless the connection goes away first.
    Schedule { delay: Duration, payload: GatewayPayload },
    /// Drop the socket and connect again straight away, keeping the session.
    Reconnect(ReconnectReason),
    Transition(ConnectionState),
    /// READY or RESUMED arrived; the session is usable.
    Established,
}

// ---------------------------------------------------------------------------
// SessionMachine
// ---------------------------------------------------------------------------

/// The handshake / heartbeat / resume state machine, free of I/O.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    token: String,
    intents: Intents,
    shard: Option<[u32; 2]>,
    properties: IdentifyProperties,
    session: Session,
}

impl SessionMachine {
    pub fn new(token: impl Into<String>, intents: Intents) -> Self {
        Self {
            token: token.into(),
            intents,
            shard: None,
            properties: IdentifyProperties::default(),
            session: Session::default(),
        }
    }

    pub fn with_shard(mut self, shard: Option<[u32; 2]>) -> Self {
        self.shard = shard;
        self
    }

    /// Start from a previously held session so the next HELLO resumes it.
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = session;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Forget the session so the next handshake is a fresh IDENTIFY.
    pub fn clear_session(&mut self) {
        self.session.session_id = None;
        self.session.sequence = None;
        self.session.resume_gateway_url = None;
    }

    pub fn can_resume(&self) -> bool {
        self.session.session_id.is_some()
    }

    /// Feed one decoded inbound envelope.
    pub fn on_payload(&mut self, payload: GatewayPayload) -> Vec<Action> {
        match payload.op {
            OpCode::Hello => {
                let hello = payload
                    .d
                    .map(serde_json::from_value::<Hello>)
                    .transpose();
                match hello {
                    Ok(Some(hello)) => self.on_hello(hello),
                    Ok(None) | Err(_) => {
                        warn!("HELLO without a valid heartbeat_interval, dropping");
                        Vec::new()
                    }
                }
            }
            OpCode::Dispatch => self.on_dispatch(payload),
            OpCode::HeartbeatAck => {
                debug!("heartbeat acknowledged");
                self.session.heartbeat_acknowledged = true;
                Vec::new()
            }
            OpCode::Heartbeat => {
                debug!("server requested a heartbeat");
                vec![Action::Send(self.heartbeat_payload())]
            }
            OpCode::Reconnect => {
                info!("gateway requested reconnect (op 7)");
                vec![Action::Reconnect(ReconnectReason::ServerRequested)]
            }
            OpCode::InvalidSession => {
                let resumable = payload
                    .d
                    .as_ref()
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                self.on_invalid_session(resumable)
            }
            OpCode::Identify
            | OpCode::StatusUpdate
            | OpCode::VoiceStateUpdate
            | OpCode::Resume => {
                warn!(op = ?payload.op, "received a send-only opcode, dropping");
                Vec::new()
            }
        }
    }

    /// HELLO: start heartbeating, then exactly one of IDENTIFY or RESUME.
    pub fn on_hello(&mut self, hello: Hello) -> Vec<Action> {
        let interval = Duration::from_millis(hello.heartbeat_interval);
        info!(interval_ms = hello.heartbeat_interval, "received HELLO");
        self.session.heartbeat_interval = interval;
        self.session.heartbeat_acknowledged = true;

        let (state, handshake) = if self.can_resume() {
            (ConnectionState::Resuming, self.resume_payload())
        } else {
            (ConnectionState::Identifying, self.identify_payload())
        };
        vec![
            Action::StartHeartbeat(interval),
            Action::Transition(state),
            Action::Send(handshake),
        ]
    }

    fn on_dispatch(&mut self, payload: GatewayPayload) -> Vec<Action> {
        if let Some(seq) = payload.s {
            match self.session.sequence {
                Some(previous) if seq < previous => {
                    let violation =
                        BotError::Protocol(format!("sequence {seq} after {previous}"));
                    error!(previous, received = seq, error = %violation, "gateway sequence went backwards");
                    return vec![
                        Action::Publish(BotEvent::Error(violation.to_string())),
                        Action::Reconnect(ReconnectReason::SequenceRegression {
                            previous,
                            received: seq,
                        }),
                    ];
                }
                _ => self.session.sequence = Some(seq),
            }
        }

        let Some(name) = payload.t else {
            warn!("dispatch without an event name, dropping");
            return Vec::new();
        };
        let event = BotEvent::from_dispatch(&name, payload.d.unwrap_or_default());

        match &event {
            BotEvent::Ready(ready) => {
                info!(session_id = %ready.session_id, "gateway READY");
                self.session.session_id = Some(ready.session_id.clone());
                self.session.resume_gateway_url = ready.resume_gateway_url.clone();
                vec![Action::Established, Action::Publish(event)]
            }
            BotEvent::Resumed => {
                info!("gateway RESUMED");
                vec![Action::Established, Action::Publish(event)]
            }
            _ => vec![Action::Publish(event)],
        }
    }

    fn on_invalid_session(&mut self, resumable: bool) -> Vec<Action> {
        warn!(resumable, "session invalidated (op 9)");
        if !resumable {
            self.clear_session();
        }
        let (lo, hi) = INVALID_SESSION_DELAY_MS;
        let delay = Duration::from_millis(rand::thread_rng().gen_range(lo..=hi));

        let (state, payload) = if self.can_resume() {
            (ConnectionState::Resuming, self.resume_payload())
        } else {
            (ConnectionState::Identifying, self.identify_payload())
        };
        vec![
            Action::Transition(state),
            Action::Schedule { delay, payload },
        ]
    }

    /// Heartbeat timer fired.
    pub fn on_heartbeat_tick(&mut self) -> Action {
        if !self.session.heartbeat_acknowledged {
            warn!("no heartbeat ACK since last beat, connection is a zombie");
            return Action::Reconnect(ReconnectReason::MissedHeartbeatAck);
        }
        self.session.heartbeat_acknowledged = false;
        debug!(seq = ?self.session.sequence, "sending heartbeat");
        Action::Send(self.heartbeat_payload())
    }

    /// Record a reconnect attempt; returns the new count.
    pub fn note_reconnect_attempt(&mut self) -> u32 {
        self.session.reconnect_attempts += 1;
        self.session.reconnect_attempts
    }

    /// Reset the attempt counter; returns what it was.
    pub fn reset_reconnect_attempts(&mut self) -> u32 {
        std::mem::take(&mut self.session.reconnect_attempts)
    }

    fn heartbeat_payload(&self) -> GatewayPayload {
        GatewayPayload::new(OpCode::Heartbeat, json!(self.session.sequence))
    }

    fn identify_payload(&self) -> GatewayPayload {
        let identify = Identify {
            token: self.token.clone(),
            properties: self.properties.clone(),
            intents: self.intents.bits(),
            shard: self.shard,
        };
        GatewayPayload::new(OpCode::Identify, json!(identify))
    }

    fn resume_payload(&self) -> GatewayPayload {
        let resume = Resume {
            token: self.token.clone(),
            session_id: self.session.session_id.clone().unwrap_or_default(),
            seq: self.session.sequence,
        };
        GatewayPayload::new(OpCode::Resume, json!(resume))
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Options for the gateway connection.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub intents: Intents,
    /// Optional shard info: `[shard_id, num_shards]`.
    pub shard: Option<[u32; 2]>,
    pub reconnect: ReconnectConfig,
    pub ready_timeout: Duration,
}

impl From<&BotConfig> for GatewayConfig {
    fn from(config: &BotConfig) -> Self {
        Self {
            url: config.gateway_url.clone(),
            intents: config.intents(),
            shard: config.shard,
            reconnect: config.reconnect.clone(),
            ready_timeout: config.ready_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// GatewayClient
// ---------------------------------------------------------------------------

struct Inner {
    config: GatewayConfig,
    bus: EventBus,
    state: watch::Sender<ConnectionState>,
    /// Bumped by every connect/disconnect; a driver only writes shared state
    /// while its own epoch is current.
    epoch: AtomicU64,
    connecting: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
    outbound: Mutex<Option<mpsc::Sender<GatewayPayload>>>,
    session: Mutex<Session>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn set_state(&self, epoch: u64, state: ConnectionState) {
        if self.is_current(epoch) {
            debug!(?state, "gateway state");
            self.state.send_replace(state);
        }
    }

    fn publish(&self, epoch: u64, event: BotEvent) {
        if self.is_current(epoch) {
            self.bus.publish(event);
        }
    }

    fn set_outbound(&self, epoch: u64, tx: Option<mpsc::Sender<GatewayPayload>>) {
        if self.is_current(epoch) {
            *lock(&self.outbound) = tx;
        }
    }

    fn store_session(&self, epoch: u64, session: &Session) {
        if self.is_current(epoch) {
            *lock(&self.session) = session.clone();
        }
    }
}

/// Clears the `connecting` flag however `connect` exits.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Handle to the single persistent gateway connection. Cheap to clone.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

impl GatewayClient {
    pub fn new(config: impl Into<GatewayConfig>, bus: EventBus) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config: config.into(),
                bus,
                state,
                epoch: AtomicU64::new(0),
                connecting: AtomicBool::new(false),
                driver: Mutex::new(None),
                outbound: Mutex::new(None),
                session: Mutex::new(Session::default()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Snapshot of the current session.
    pub fn session(&self) -> Session {
        lock(&self.inner.session).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Open the connection and wait until READY (or RESUMED).
    ///
    /// Fails with [`BotError::AlreadyConnecting`] if another `connect` is in
    /// flight, [`BotError::Timeout`] if the session is not established within
    /// the configured ready timeout, and [`BotError::Disconnected`] if the
    /// client gives up or [`GatewayClient::disconnect`] is called meanwhile.
    pub async fn connect(&self, token: impl Into<String>) -> BotResult<()> {
        if self.inner.connecting.swap(true, Ordering::SeqCst) {
            return Err(BotError::AlreadyConnecting);
        }
        let _guard = ConnectingGuard(&self.inner.connecting);

        if self.is_connected() {
            return Ok(());
        }

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(stale) = lock(&self.inner.driver).take() {
            stale.abort();
        }

        let mut state_rx = self.inner.state.subscribe();
        self.inner.set_state(epoch, ConnectionState::Connecting);

        let machine = SessionMachine::new(token, self.inner.config.intents)
            .with_shard(self.inner.config.shard)
            .with_session(self.session());
        let handle = tokio::spawn(drive(Arc::clone(&self.inner), machine, epoch));
        *lock(&self.inner.driver) = Some(handle);

        let ready_timeout = self.inner.config.ready_timeout;
        let settled = tokio::time::timeout(
            ready_timeout,
            state_rx.wait_for(|s| {
                matches!(s, ConnectionState::Connected | ConnectionState::Disconnected)
            }),
        )
        .await;

        match settled {
            Ok(Ok(state)) if *state == ConnectionState::Connected => Ok(()),
            Ok(_) => Err(BotError::Disconnected),
            Err(_) => {
                warn!(timeout_ms = ready_timeout.as_millis() as u64, "no READY in time");
                self.disconnect();
                Err(BotError::Timeout(ready_timeout))
            }
        }
    }

    /// Tear down the socket and heartbeat timer and forget the session.
    ///
    /// Synchronous and idempotent. Anyone awaiting `connect` is released with
    /// [`BotError::Disconnected`].
    pub fn disconnect(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        let driver = lock(&self.inner.driver).take();
        let had_driver = driver.is_some();
        if let Some(handle) = driver {
            handle.abort();
        }
        lock(&self.inner.outbound).take();
        *lock(&self.inner.session) = Session::default();

        let previous = self.inner.state.send_replace(ConnectionState::Disconnected);
        if had_driver || previous != ConnectionState::Disconnected {
            info!("gateway disconnected by client");
            self.inner.bus.publish(BotEvent::Disconnect {
                reason: "client disconnect".to_string(),
            });
        }
    }

    /// Send a raw envelope on the open connection.
    pub async fn send(&self, op: OpCode, d: serde_json::Value) -> BotResult<()> {
        let tx = lock(&self.inner.outbound)
            .clone()
            .ok_or(BotError::NotConnected)?;
        tx.send(GatewayPayload::new(op, d))
            .await
            .map_err(|_| BotError::NotConnected)
    }
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// The driver loop (runs in a spawned task)
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, WsMessage>;

/// How a single physical connection ended.
#[derive(Debug)]
enum ConnectionExit {
    /// Reconnect straight away (op 7, zombie, protocol violation).
    Immediate,
    /// Unexpected drop: back off, then reconnect.
    Retry,
    /// Retrying cannot help (bad token, bad intents).
    Fatal(String),
}

async fn drive(inner: Arc<Inner>, mut machine: SessionMachine, epoch: u64) {
    let policy = inner.config.reconnect.clone();
    let mut reconnecting = false;

    loop {
        let url = machine
            .session()
            .resume_gateway_url
            .clone()
            .filter(|_| machine.can_resume())
            .unwrap_or_else(|| inner.config.url.clone());

        inner.set_state(epoch, ConnectionState::Connecting);
        info!(url = %url, "connecting to gateway");

        let exit = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!("WebSocket connected");
                run_connection(&inner, epoch, &mut machine, ws, &mut reconnecting).await
            }
            Err(e) => {
                error!(error = %e, "failed to connect to gateway");
                ConnectionExit::Retry
            }
        };

        inner.set_outbound(epoch, None);
        inner.store_session(epoch, machine.session());

        match exit {
            ConnectionExit::Immediate => {
                inner.set_state(epoch, ConnectionState::Reconnecting);
                reconnecting = true;
                continue;
            }
            ConnectionExit::Fatal(reason) => {
                error!(reason = %reason, "fatal gateway error, not reconnecting");
                inner.set_state(epoch, ConnectionState::Disconnected);
                inner.publish(epoch, BotEvent::Disconnect { reason });
                return;
            }
            ConnectionExit::Retry => {}
        }

        let attempt = machine.note_reconnect_attempt();
        inner.store_session(epoch, machine.session());
        if attempt > policy.max_attempts {
            error!(attempts = attempt - 1, "exceeded max reconnect attempts, giving up");
            inner.set_state(epoch, ConnectionState::Disconnected);
            inner.publish(
                epoch,
                BotEvent::Disconnect {
                    reason: "reconnect attempts exhausted".to_string(),
                },
            );
            return;
        }

        inner.set_state(epoch, ConnectionState::Reconnecting);
        reconnecting = true;
        let delay = policy.delay_for(attempt);
        warn!(
            delay_ms = delay.as_millis() as u64,
            attempt,
            "reconnecting after backoff"
        );
        tokio::time::sleep(delay).await;
    }
}

async fn run_connection(
    inner: &Inner,
    epoch: u64,
    machine: &mut SessionMachine,
    ws: WsStream,
    reconnecting: &mut bool,
) -> ConnectionExit {
    let (mut ws_write, mut ws_read) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<GatewayPayload>(64);
    inner.set_outbound(epoch, Some(send_tx));
    inner.set_state(epoch, ConnectionState::AwaitingHandshake);

    let mut rate_limiter = SendRateLimiter::new(SEND_BUDGET_MAX, SEND_BUDGET_WINDOW);
    let mut heartbeat: Option<Interval> = None;
    let mut scheduled: Option<(Instant, GatewayPayload)> = None;
    let hello_deadline = Instant::now() + HELLO_TIMEOUT;

    loop {
        let scheduled_at = scheduled.as_ref().map(|(at, _)| *at);
        let awaiting_hello = heartbeat.is_none();

        let actions = tokio::select! {
            biased;

            // Outbound sends from the host (presence, voice, ...).
            Some(payload) = send_rx.recv() => vec![Action::Send(payload)],

            _ = next_tick(&mut heartbeat) => vec![machine.on_heartbeat_tick()],

            _ = sleep_until_opt(scheduled_at) => match scheduled.take() {
                Some((_, payload)) => vec![Action::Send(payload)],
                None => Vec::new(),
            },

            _ = tokio::time::sleep_until(hello_deadline), if awaiting_hello => {
                error!("timed out waiting for HELLO");
                return ConnectionExit::Retry;
            }

            // Inbound messages from the server.
            msg = ws_read.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<GatewayPayload>(&text) {
                        Ok(payload) => machine.on_payload(payload),
                        Err(e) => {
                            warn!(error = %e, "failed to parse gateway payload");
                            Vec::new()
                        }
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    return close_exit(frame, machine);
                }
                // Ping/Pong/Binary: ignore.
                Some(Ok(_)) => Vec::new(),
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket read error");
                    return ConnectionExit::Retry;
                }
                None => {
                    info!("WebSocket stream ended");
                    return ConnectionExit::Retry;
                }
            },
        };

        for action in actions {
            match action {
                Action::Send(payload) => {
                    if let Err(e) = rate_limited_send(&mut ws_write, &mut rate_limiter, &payload).await
                    {
                        warn!(error = %e, op = ?payload.op, "gateway send failed");
                        return ConnectionExit::Retry;
                    }
                }
                Action::StartHeartbeat(interval) => {
                    // First beat after `interval * jitter`, jitter in [0, 1).
                    let jitter = rand::random::<f64>();
                    let first = Instant::now() + interval.mul_f64(jitter);
                    let mut timer = tokio::time::interval_at(first, interval);
                    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    heartbeat = Some(timer);
                }
                Action::Publish(event) => inner.publish(epoch, event),
                Action::Schedule { delay, payload } => {
                    debug!(delay_ms = delay.as_millis() as u64, "scheduling handshake");
                    scheduled = Some((Instant::now() + delay, payload));
                }
                Action::Transition(state) => inner.set_state(epoch, state),
                Action::Established => {
                    let attempts = machine.reset_reconnect_attempts();
                    inner.store_session(epoch, machine.session());
                    inner.set_state(epoch, ConnectionState::Connected);
                    if std::mem::take(reconnecting) {
                        info!(attempts, "gateway reconnected");
                        inner.publish(epoch, BotEvent::Reconnect { attempts });
                    }
                }
                Action::Reconnect(reason) => {
                    warn!(?reason, "reconnecting");
                    inner.store_session(epoch, machine.session());
                    let _ = ws_write.send(WsMessage::Close(None)).await;
                    return ConnectionExit::Immediate;
                }
            }
        }
        inner.store_session(epoch, machine.session());
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Map a server close frame to what the driver should do next.
fn close_exit(frame: Option<CloseFrame<'_>>, machine: &mut SessionMachine) -> ConnectionExit {
    let code = frame.as_ref().map(|f| u16::from(f.code));
    warn!(close_code = ?code, "WebSocket closed by server");

    match code {
        Some(4004) => ConnectionExit::Fatal("authentication failed (close 4004)".to_string()),
        Some(code @ 4010..=4014) => {
            ConnectionExit::Fatal(format!("gateway rejected configuration (close {code})"))
        }
        Some(4007) | Some(4009) => {
            // Invalid seq or session timed out: re-identify.
            machine.clear_session();
            ConnectionExit::Retry
        }
        _ => ConnectionExit::Retry,
    }
}

/// Send a payload on the WebSocket, respecting the send rate limiter.
async fn rate_limited_send(
    ws_write: &mut WsSink,
    rate_limiter: &mut SendRateLimiter,
    payload: &GatewayPayload,
) -> BotResult<()> {
    while let Some(delay) = rate_limiter.delay() {
        debug!(
            delay_ms = delay.as_millis() as u64,
            "gateway send rate-limited, waiting"
        );
        tokio::time::sleep(delay).await;
    }
    rate_limiter.record();

    let text = serde_json::to_string(payload)?;
    ws_write.send(WsMessage::Text(text)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> SessionMachine {
        SessionMachine::new("secret", Intents::default())
    }

    fn envelope(value: serde_json::Value) -> GatewayPayload {
        serde_json::from_value(value).unwrap()
    }

    fn sent(actions: &[Action]) -> Vec<&GatewayPayload> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn ready(machine: &mut SessionMachine, session_id: &str, seq: u64) -> Vec<Action> {
        machine.on_payload(envelope(json!({
            "op": 0, "t": "READY", "s": seq, "d": {"session_id": session_id}
        })))
    }

    // -- HELLO -------------------------------------------------------------

    #[test]
    fn hello_without_session_sends_identify() {
        let mut m = machine();
        let actions = m.on_payload(envelope(json!({"op": 10, "d": {"heartbeat_interval": 30000}})));

        let sends = sent(&actions);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].op, OpCode::Identify);
        let d = sends[0].d.as_ref().unwrap();
        assert_eq!(d["token"], "secret");
        assert_eq!(d["intents"], Intents::default().bits());
        assert!(d["properties"]["os"].is_string());

        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::StartHeartbeat(d) if *d == Duration::from_secs(30))));
        assert!(m.session().heartbeat_acknowledged);
    }

    #[test]
    fn hello_with_session_sends_resume_only() {
        let mut m = machine();
        ready(&mut m, "abc", 7);

        let actions = m.on_hello(Hello {
            heartbeat_interval: 41250,
        });
        let sends = sent(&actions);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].op, OpCode::Resume);
        let d = sends[0].d.as_ref().unwrap();
        assert_eq!(d["session_id"], "abc");
        assert_eq!(d["seq"], 7);
        assert_eq!(d["token"], "secret");
    }

    #[test]
    fn malformed_hello_is_dropped() {
        let mut m = machine();
        assert!(m.on_payload(envelope(json!({"op": 10, "d": {"nope": 1}}))).is_empty());
    }

    // -- DISPATCH ----------------------------------------------------------

    #[test]
    fn ready_stores_session_and_publishes() {
        let mut m = machine();
        let actions = ready(&mut m, "abc", 1);

        assert_eq!(m.session().session_id.as_deref(), Some("abc"));
        assert_eq!(m.session().sequence, Some(1));
        assert!(matches!(actions[0], Action::Established));
        assert!(matches!(&actions[1], Action::Publish(BotEvent::Ready(r)) if r.session_id == "abc"));
    }

    #[test]
    fn sequence_is_non_decreasing() {
        let mut m = machine();
        ready(&mut m, "abc", 1);
        for seq in [2, 2, 5] {
            let actions = m.on_payload(envelope(json!({
                "op": 0, "t": "TYPING_START", "s": seq,
                "d": {"channel_id": "1", "user_id": "2", "timestamp": 0}
            })));
            assert!(matches!(actions[0], Action::Publish(BotEvent::TypingStart(_))));
            assert_eq!(m.session().sequence, Some(seq));
        }
    }

    #[test]
    fn sequence_regression_forces_reconnect() {
        let mut m = machine();
        ready(&mut m, "abc", 10);

        let actions = m.on_payload(envelope(json!({"op": 0, "t": "RESUMED", "s": 3, "d": null})));
        assert!(matches!(
            &actions[0],
            Action::Publish(BotEvent::Error(message))
                if *message == BotError::Protocol("sequence 3 after 10".into()).to_string()
        ));
        assert!(matches!(
            actions[1],
            Action::Reconnect(ReconnectReason::SequenceRegression {
                previous: 10,
                received: 3
            })
        ));
        // The higher sequence and the session survive for the resume.
        assert_eq!(m.session().sequence, Some(10));
        assert!(m.can_resume());
    }

    #[test]
    fn dispatch_without_name_is_dropped() {
        let mut m = machine();
        assert!(m.on_payload(envelope(json!({"op": 0, "s": 1, "d": {}}))).is_empty());
        assert_eq!(m.session().sequence, Some(1));
    }

    // -- Heartbeat ---------------------------------------------------------

    #[test]
    fn heartbeat_carries_sequence_and_awaits_ack() {
        let mut m = machine();
        m.on_hello(Hello {
            heartbeat_interval: 30000,
        });
        ready(&mut m, "abc", 4);

        match m.on_heartbeat_tick() {
            Action::Send(p) => {
                assert_eq!(p.op, OpCode::Heartbeat);
                assert_eq!(p.d, Some(json!(4)));
            }
            other => panic!("expected heartbeat, got {other:?}"),
        }
        assert!(!m.session().heartbeat_acknowledged);

        m.on_payload(envelope(json!({"op": 11})));
        assert!(m.session().heartbeat_acknowledged);
        assert!(matches!(m.on_heartbeat_tick(), Action::Send(_)));
    }

    #[test]
    fn missed_ack_triggers_exactly_one_reconnect() {
        let mut m = machine();
        m.on_hello(Hello {
            heartbeat_interval: 30000,
        });
        assert!(matches!(m.on_heartbeat_tick(), Action::Send(_)));

        // No ACK arrived before the next tick.
        assert!(matches!(
            m.on_heartbeat_tick(),
            Action::Reconnect(ReconnectReason::MissedHeartbeatAck)
        ));
        // A late ACK restores normal beating.
        m.on_payload(envelope(json!({"op": 11})));
        assert!(matches!(m.on_heartbeat_tick(), Action::Send(_)));
    }

    #[test]
    fn server_heartbeat_request_is_answered() {
        let mut m = machine();
        let actions = m.on_payload(envelope(json!({"op": 1, "d": null})));
        assert_eq!(sent(&actions)[0].op, OpCode::Heartbeat);
    }

    // -- Reconnect / invalid session -----------------------------------------

    #[test]
    fn reconnect_request_keeps_session() {
        let mut m = machine();
        ready(&mut m, "abc", 2);
        let actions = m.on_payload(envelope(json!({"op": 7})));
        assert!(matches!(
            actions[0],
            Action::Reconnect(ReconnectReason::ServerRequested)
        ));
        assert!(m.can_resume());
    }

    #[test]
    fn non_resumable_invalid_session_clears_and_reidentifies() {
        let mut m = machine();
        ready(&mut m, "abc", 2);

        let actions = m.on_payload(envelope(json!({"op": 9, "d": false})));
        assert!(m.session().session_id.is_none());
        assert!(m.session().sequence.is_none());

        let scheduled = actions
            .iter()
            .find_map(|a| match a {
                Action::Schedule { delay, payload } => Some((*delay, payload)),
                _ => None,
            })
            .unwrap();
        assert!(scheduled.0 >= Duration::from_secs(1) && scheduled.0 <= Duration::from_secs(5));
        assert_eq!(scheduled.1.op, OpCode::Identify);
    }

    #[test]
    fn resumable_invalid_session_resumes() {
        let mut m = machine();
        ready(&mut m, "abc", 2);
        let actions = m.on_payload(envelope(json!({"op": 9, "d": true})));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Schedule { payload, .. } if payload.op == OpCode::Resume
        )));
        assert_eq!(m.session().session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn reconnect_attempts_reset_on_establish() {
        let mut m = machine();
        assert_eq!(m.note_reconnect_attempt(), 1);
        assert_eq!(m.note_reconnect_attempt(), 2);
        assert_eq!(m.reset_reconnect_attempts(), 2);
        assert_eq!(m.session().reconnect_attempts, 0);
    }

    // -- close codes -------------------------------------------------------

    #[test]
    fn auth_close_is_fatal_and_invalid_seq_reidentifies() {
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

        let mut m = machine();
        ready(&mut m, "abc", 2);

        let frame = |code: u16| {
            Some(CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            })
        };
        assert!(matches!(close_exit(frame(4004), &mut m), ConnectionExit::Fatal(_)));
        assert!(matches!(close_exit(frame(4000), &mut m), ConnectionExit::Retry));
        assert!(m.can_resume());
        assert!(matches!(close_exit(frame(4007), &mut m), ConnectionExit::Retry));
        assert!(!m.can_resume());
    }

    // -- send limiter --------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn send_limiter_waits_for_window() {
        let mut limiter = SendRateLimiter::new(2, Duration::from_secs(10));
        limiter.record();
        assert!(limiter.delay().is_none());
        limiter.record();
        let delay = limiter.delay().unwrap();
        assert!(delay <= Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.delay().is_none());
    }

    // -- client --------------------------------------------------------------

    static_assertions::assert_impl_all!(GatewayClient: Send, Sync, Clone);

    #[tokio::test]
    async fn send_without_connection_fails() {
        let client = GatewayClient::new(&BotConfig::default(), EventBus::default());
        let err = client.send(OpCode::StatusUpdate, json!({})).await.unwrap_err();
        assert!(matches!(err, BotError::NotConnected));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let bus = EventBus::default();
        let events = bus.subscribe();
        let client = GatewayClient::new(&BotConfig::default(), bus);

        client.disconnect();
        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        // Nothing was running, so nothing to announce.
        assert!(events.is_empty());
    }
}
