//! Connection manager for one real-time session.
//!
//! A [`Connection`] owns at most one transport at a time and drives it from a
//! background task: heartbeat, pong deadline, bounded reconnect and fan-out of
//! inbound frames to the listeners registered on *this* connection. Every
//! session (room list, a lobby, a battle) gets its own `Connection`, so
//! `disconnect()` never reaches another session's listeners.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::{Result, SessionError, classify_server_error};
use crate::protocol::{Channel, ClientMessage, RoomId, ServerMessage};
use crate::transport::{Connector, Frame, NORMAL_CLOSE, Transport, WsConnector};

/// Capacity of the notice broadcast channel
const NOTICE_CAPACITY: usize = 32;

/// Transport lifecycle as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Out-of-band events published alongside the message fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A reconnect was scheduled after an abnormal close.
    Reconnecting { attempt: u32 },
    /// All reconnect attempts failed; the session is over.
    ReconnectExhausted { attempts: u32 },
    /// No pong arrived in time; the session was torn down.
    LivenessLost,
    /// The server rejected the token; the session was torn down.
    AuthorizationFailed(String),
    /// The server rejected a request. Local state is untouched.
    Application(String),
}

/// Everything needed to (re)open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub channel: Channel,
    pub token: String,
}

impl SessionParams {
    pub fn room_list(token: impl Into<String>) -> Self {
        Self {
            channel: Channel::RoomList,
            token: token.into(),
        }
    }

    pub fn lobby(room: impl Into<RoomId>, token: impl Into<String>) -> Self {
        Self {
            channel: Channel::Lobby(room.into()),
            token: token.into(),
        }
    }

    pub fn battle(room: impl Into<RoomId>, token: impl Into<String>) -> Self {
        Self {
            channel: Channel::Battle(room.into()),
            token: token.into(),
        }
    }
}

/// Fan-out subscriber. Runs synchronously on the connection task.
pub type Listener = Box<dyn FnMut(&ServerMessage) + Send>;

/// Called instead of reconnecting when the very first attempt fails.
pub type InitialFailure = Box<dyn FnOnce(SessionError) + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

struct ListenerEntry {
    id: String,
    token: u64,
    callback: Arc<Mutex<Listener>>,
}

/// Insertion-ordered listener set keyed by id.
#[derive(Default)]
struct ListenerRegistry {
    next_token: u64,
    entries: Vec<ListenerEntry>,
}

impl ListenerRegistry {
    /// Re-registering an id replaces its callback in place.
    fn insert(&mut self, id: String, callback: Listener) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        let callback = Arc::new(Mutex::new(callback));
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.token = token;
                entry.callback = callback;
            }
            None => self.entries.push(ListenerEntry { id, token, callback }),
        }
        token
    }

    fn remove(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        before != self.entries.len()
    }

    fn remove_token(&mut self, token: u64) {
        self.entries.retain(|e| e.token != token);
    }

    fn contains_token(&self, token: u64) -> bool {
        self.entries.iter().any(|e| e.token == token)
    }

    fn snapshot(&self) -> Vec<(u64, Arc<Mutex<Listener>>)> {
        self.entries
            .iter()
            .map(|e| (e.token, Arc::clone(&e.callback)))
            .collect()
    }
}

/// State shared between the handle and the connection task.
struct Shared {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    state_tx: watch::Sender<ConnectionState>,
    /// True while a connection task is running for the current generation.
    active_tx: watch::Sender<bool>,
    notices: broadcast::Sender<Notice>,
    listeners: Mutex<ListenerRegistry>,
    params: Mutex<Option<SessionParams>>,
    last_pong: Mutex<Option<Instant>>,
    reconnect_attempts: AtomicU32,
    generation: AtomicU64,
}

/// What became of one inbound text frame.
enum Inbound {
    Pong,
    Handled,
    Unauthorized(String),
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn set_state(&self, generation: u64, state: ConnectionState) {
        if self.is_current(generation) {
            self.state_tx.send_replace(state);
        }
    }

    fn publish(&self, notice: Notice) {
        // No receivers is fine
        let _ = self.notices.send(notice);
    }

    /// Drop every listener and the session parameters.
    fn clear(&self) {
        lock(&self.listeners).entries.clear();
        *lock(&self.params) = None;
    }

    fn handle_text(&self, text: &str) -> Inbound {
        let msg = match ServerMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("[WS] Dropping frame: {}", e);
                return Inbound::Handled;
            }
        };

        match msg {
            ServerMessage::Pong => {
                *lock(&self.last_pong) = Some(Instant::now());
                return Inbound::Pong;
            }
            ServerMessage::Error { message, code } => {
                match classify_server_error(&message, code.as_ref()) {
                    SessionError::Authorization(message) => {
                        warn!("[WS] Server rejected credentials: {}", message);
                        return Inbound::Unauthorized(message);
                    }
                    _ => {
                        warn!("[WS] Server error: {}", message);
                        self.publish(Notice::Application(message));
                    }
                }
            }
            msg => self.dispatch(&msg),
        }
        Inbound::Handled
    }

    /// Deliver to every listener in registration order.
    ///
    /// The registry lock is not held while callbacks run, so a callback may
    /// register, unregister or disconnect. Listeners removed mid-dispatch are
    /// skipped.
    fn dispatch(&self, msg: &ServerMessage) {
        debug!("[WS] <- {}", msg.kind());
        let snapshot = lock(&self.listeners).snapshot();
        for (token, callback) in snapshot {
            if !lock(&self.listeners).contains_token(token) {
                continue;
            }
            let mut listener = lock(&callback);
            (*listener)(msg);
        }
    }
}

enum Command {
    Send(String),
    Disconnect,
}

struct ActiveSession {
    cmd_tx: mpsc::UnboundedSender<Command>,
    /// Cleared by the task, under the session lock, before it reports how it ended.
    running: Arc<AtomicBool>,
}

impl ActiveSession {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Handle to one session's connection. Clones share the same session.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    session: Arc<Mutex<Option<ActiveSession>>>,
}

impl Connection {
    /// Connection over WebSocket.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    pub fn with_connector(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (active_tx, _) = watch::channel(false);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                state_tx,
                active_tx,
                notices,
                listeners: Mutex::new(ListenerRegistry::default()),
                params: Mutex::new(None),
                last_pong: Mutex::new(None),
                reconnect_attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
            }),
            session: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Open the session. No-op while a connection task is already running.
    pub fn connect(&self, params: SessionParams) {
        self.start(params, None);
    }

    /// Like [`connect`](Self::connect), but if the very first attempt fails
    /// `on_initial_failure` runs instead of the reconnect path.
    pub fn connect_or_else(
        &self,
        params: SessionParams,
        on_initial_failure: impl FnOnce(SessionError) + Send + 'static,
    ) {
        self.start(params, Some(Box::new(on_initial_failure)));
    }

    fn start(&self, params: SessionParams, on_initial_failure: Option<InitialFailure>) {
        let mut session = lock(&self.session);
        if session.as_ref().is_some_and(ActiveSession::is_running) {
            debug!("[WS] Already connected, ignoring connect for {}", params.channel);
            return;
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.reconnect_attempts.store(0, Ordering::Release);
        *lock(&self.shared.params) = Some(params.clone());
        self.shared.state_tx.send_replace(ConnectionState::Connecting);
        self.shared.active_tx.send_replace(true);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let shared = Arc::clone(&self.shared);
        let slot = Arc::downgrade(&self.session);
        let flag = Arc::clone(&running);
        tokio::spawn(async move {
            let fail_fast = on_initial_failure.is_some();
            let outcome =
                connection_loop(Arc::clone(&shared), generation, params, cmd_rx, fail_fast).await;
            {
                // Holding the slot orders this against a concurrent `start`.
                // Weak, so dropping every handle still closes the command channel.
                let slot = slot.upgrade();
                let _slot = slot.as_deref().map(lock);
                flag.store(false, Ordering::Release);
                if shared.is_current(generation) {
                    shared.active_tx.send_replace(false);
                }
            }
            match outcome {
                Outcome::Ended => {}
                Outcome::Notify(notice) => shared.publish(notice),
                Outcome::FirstAttemptFailed(e) => match on_initial_failure {
                    Some(callback) => callback(e),
                    None => debug!("[WS] Initial connect failed: {}", e),
                },
            }
        });
        *session = Some(ActiveSession { cmd_tx, running });
    }

    /// Close with the normal close code, stop heartbeat and pending timers,
    /// and clear this connection's listeners and parameters.
    pub fn disconnect(&self) {
        let session = lock(&self.session).take();
        if let Some(session) = session {
            if session.is_running() {
                self.shared.state_tx.send_replace(ConnectionState::Closing);
                let _ = session.cmd_tx.send(Command::Disconnect);
            }
        }
        self.shared.clear();
        self.shared.active_tx.send_replace(false);
        info!("[WS] Disconnected");
    }

    /// Register a subscriber. The returned handle unregisters on drop.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn add_listener(
        &self,
        id: impl Into<String>,
        callback: impl FnMut(&ServerMessage) + Send + 'static,
    ) -> Subscription {
        let id = id.into();
        let token = lock(&self.shared.listeners).insert(id.clone(), Box::new(callback));
        Subscription {
            id,
            token,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Unregister by id. Returns whether a listener was removed.
    pub fn remove_listener(&self, id: &str) -> bool {
        lock(&self.shared.listeners).remove(id)
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.shared.listeners).entries.len()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.state_tx.borrow() == ConnectionState::Open
    }

    /// Send if open; otherwise the message is dropped. Nothing is queued.
    pub fn send_message(&self, message: &ClientMessage) {
        if !self.is_connected() {
            debug!("[WS] Not connected, dropping {:?}", message);
            return;
        }
        let json = match message.encode() {
            Ok(json) => json,
            Err(e) => {
                error!("[WS] Failed to serialize: {}", e);
                return;
            }
        };
        match lock(&self.session).as_ref() {
            Some(session) => {
                if session.cmd_tx.send(Command::Send(json)).is_err() {
                    debug!("[WS] Connection task gone, message dropped");
                }
            }
            None => debug!("[WS] No active session, message dropped"),
        }
    }

    /// Whether a connection task is running (open, connecting or waiting to reconnect).
    pub fn is_active(&self) -> bool {
        *self.shared.active_tx.borrow()
    }

    /// Flips to `false` once the session ends for good.
    pub fn active(&self) -> watch::Receiver<bool> {
        self.shared.active_tx.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.shared.notices.subscribe()
    }

    pub fn params(&self) -> Option<SessionParams> {
        lock(&self.shared.params).clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::Acquire)
    }

    pub fn last_pong(&self) -> Option<Instant> {
        *lock(&self.shared.last_pong)
    }
}

/// Registration handle returned by [`Connection::add_listener`].
pub struct Subscription {
    id: String,
    token: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // A newer registration under the same id keeps its slot
        if let Some(shared) = self.shared.upgrade() {
            lock(&shared.listeners).remove_token(self.token);
        }
    }
}

/// Reason a live connection stopped.
enum SessionEnd {
    Requested,
    Liveness,
    Unauthorized(String),
    Closed(Option<u16>),
    Failed(SessionError),
}

/// How the connection task ended. Reported only after the session is marked
/// as no longer running, so a consumer reacting to it can `connect` again.
enum Outcome {
    Ended,
    Notify(Notice),
    /// The very first attempt failed; the caller decides between the
    /// initial-failure callback and a plain log line.
    FirstAttemptFailed(SessionError),
}

/// Connect, pump, and reconnect until the session ends.
async fn connection_loop(
    shared: Arc<Shared>,
    generation: u64,
    params: SessionParams,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    fail_fast: bool,
) -> Outcome {
    let url = params.channel.url(&shared.config.server_url, &params.token);
    let mut first_attempt = true;

    loop {
        shared.set_state(generation, ConnectionState::Connecting);
        debug!("[WS] Connecting to {}", params.channel);

        let connected = tokio::select! {
            () = wait_for_disconnect(&mut cmd_rx) => {
                shared.set_state(generation, ConnectionState::Closed);
                return Outcome::Ended;
            }
            result = shared.connector.connect(&url) => result,
        };

        match connected {
            Ok(mut transport) => {
                first_attempt = false;
                shared.reconnect_attempts.store(0, Ordering::Release);
                shared.set_state(generation, ConnectionState::Open);
                info!("[WS] Connected to {}", params.channel);

                let end = match handshake(&params.channel, &mut transport).await {
                    Ok(()) => pump(&shared, generation, &mut transport, &mut cmd_rx).await,
                    Err(e) => SessionEnd::Failed(e),
                };
                match end {
                    SessionEnd::Requested => {
                        shared.set_state(generation, ConnectionState::Closed);
                        return Outcome::Ended;
                    }
                    SessionEnd::Liveness => {
                        warn!("[WS] {}, tearing down", SessionError::Liveness);
                        teardown(&shared, generation, &mut transport).await;
                        return Outcome::Notify(Notice::LivenessLost);
                    }
                    SessionEnd::Unauthorized(message) => {
                        teardown(&shared, generation, &mut transport).await;
                        return Outcome::Notify(Notice::AuthorizationFailed(message));
                    }
                    SessionEnd::Closed(Some(NORMAL_CLOSE)) => {
                        info!("[WS] Server closed {}", params.channel);
                        shared.set_state(generation, ConnectionState::Closed);
                        return Outcome::Ended;
                    }
                    SessionEnd::Closed(code) => {
                        warn!("[WS] Connection closed abnormally (code {:?})", code);
                    }
                    SessionEnd::Failed(e) => {
                        warn!("[WS] Connection lost: {}", e);
                    }
                }
            }
            Err(e) => {
                warn!("[WS] Failed to connect: {}", e);
                if first_attempt && fail_fast {
                    shared.set_state(generation, ConnectionState::Closed);
                    return Outcome::FirstAttemptFailed(e);
                }
                first_attempt = false;
            }
        }

        shared.set_state(generation, ConnectionState::Closed);

        let attempts = shared.reconnect_attempts.load(Ordering::Acquire);
        if attempts >= shared.config.max_reconnect_attempts {
            error!("[WS] Max reconnect attempts ({}) reached, giving up", attempts);
            return Outcome::Notify(Notice::ReconnectExhausted { attempts });
        }
        let attempt = attempts + 1;
        shared.reconnect_attempts.store(attempt, Ordering::Release);
        shared.publish(Notice::Reconnecting { attempt });
        info!(
            "[WS] Reconnecting in {:?} (attempt {}/{})",
            shared.config.reconnect_delay, attempt, shared.config.max_reconnect_attempts
        );

        tokio::select! {
            () = wait_for_disconnect(&mut cmd_rx) => {
                shared.set_state(generation, ConnectionState::Closed);
                return Outcome::Ended;
            }
            () = tokio::time::sleep(shared.config.reconnect_delay) => {}
        }
    }
}

/// Lobby channels ask for the participant list and chat history on open.
async fn handshake(channel: &Channel, transport: &mut Box<dyn Transport>) -> Result<()> {
    if !matches!(channel, Channel::Lobby(_)) {
        return Ok(());
    }
    for msg in [ClientMessage::RequestParticipants, ClientMessage::RequestChatHistory] {
        transport.send(msg.encode()?).await?;
    }
    Ok(())
}

/// Process commands, heartbeat and inbound frames until the connection ends.
async fn pump(
    shared: &Shared,
    generation: u64,
    transport: &mut Box<dyn Transport>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd {
    let interval = shared.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(json)) => {
                    if let Err(e) = transport.send(json).await {
                        return SessionEnd::Failed(e);
                    }
                }
                Some(Command::Disconnect) | None => {
                    let _ = transport.close(NORMAL_CLOSE).await;
                    return SessionEnd::Requested;
                }
            },

            _ = heartbeat.tick() => {
                if let Ok(json) = ClientMessage::Ping.encode() {
                    if let Err(e) = transport.send(json).await {
                        return SessionEnd::Failed(e);
                    }
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + shared.config.pong_timeout);
                }
            }

            () = sleep_until(pong_deadline) => return SessionEnd::Liveness,

            incoming = transport.recv() => match incoming {
                // Superseded by a newer connect; the listeners belong to it now
                Some(Ok(Frame::Text(_))) if !shared.is_current(generation) => {}
                Some(Ok(Frame::Text(text))) => match shared.handle_text(&text) {
                    Inbound::Pong => pong_deadline = None,
                    Inbound::Handled => {}
                    Inbound::Unauthorized(message) => return SessionEnd::Unauthorized(message),
                },
                Some(Ok(Frame::Close(code))) => return SessionEnd::Closed(code),
                Some(Err(e)) => return SessionEnd::Failed(e),
                None => return SessionEnd::Closed(None),
            },
        }
    }
}

/// Same effect as [`Connection::disconnect`], run from the connection task.
async fn teardown(shared: &Shared, generation: u64, transport: &mut Box<dyn Transport>) {
    shared.set_state(generation, ConnectionState::Closing);
    let _ = transport.close(NORMAL_CLOSE).await;
    if shared.is_current(generation) {
        shared.clear();
    }
    shared.set_state(generation, ConnectionState::Closed);
}

/// Resolves once a disconnect is requested or every handle is gone.
/// Stray sends are dropped: nothing is queued while not open.
async fn wait_for_disconnect(cmd_rx: &mut mpsc::UnboundedReceiver<Command>) {
    loop {
        match cmd_rx.recv().await {
            Some(Command::Send(_)) => debug!("[WS] Not connected, dropping queued send"),
            Some(Command::Disconnect) | None => return,
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
