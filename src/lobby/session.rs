//! Lobby session controller.
//!
//! Feeds inbound frames through [`LobbyState::handle`] and owns the side
//! effects the pure state machine cannot: the countdown ticker, notice
//! expiry, the disconnect on being kicked, and all outbound sends.

use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connection::{Connection, SessionParams, Subscription};
use crate::error::{Result, SessionError};
use crate::lobby::chat::local_message;
use crate::lobby::state::{LobbyContext, LobbyEvent, LobbyPhase, LobbyState};
use crate::protocol::ClientMessage;

/// How a lobby session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum LobbyExit {
    /// Hand `question` to the battle session.
    BattleStarted { question: Option<Value> },
    RoomClosed { message: Option<String> },
    /// The local user was removed by the host.
    Kicked,
    /// The connection ended before the lobby reached a terminal state.
    ConnectionLost,
}

impl LobbyExit {
    fn from_phase(phase: &LobbyPhase) -> Option<Self> {
        match phase {
            LobbyPhase::BattleStarted { question } => Some(LobbyExit::BattleStarted {
                question: question.clone(),
            }),
            LobbyPhase::RoomClosed { message } => Some(LobbyExit::RoomClosed {
                message: message.clone(),
            }),
            LobbyPhase::Kicked => Some(LobbyExit::Kicked),
            _ => None,
        }
    }
}

struct Driver {
    connection: Connection,
    state: watch::Sender<LobbyState>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Driver {
    fn apply(self: &Arc<Self>, event: LobbyEvent) {
        let mut before = None;
        let mut after = None;
        self.state.send_if_modified(|state| {
            let previous = state.clone();
            state.handle(&event);
            let changed = *state != previous;
            before = Some(previous.phase);
            after = Some(state.phase.clone());
            changed
        });
        let (Some(before), Some(after)) = (before, after) else {
            return;
        };

        if before != after {
            debug!("[LOBBY] {:?} -> {:?}", before, after);
        }
        let counting = |phase: &LobbyPhase| matches!(phase, LobbyPhase::Countdown(_));
        if !counting(&before) && counting(&after) {
            self.start_ticker();
        }
        if after.is_terminal() && !before.is_terminal() {
            self.stop_ticker();
            match after {
                LobbyPhase::Kicked => {
                    warn!("[LOBBY] Removed from the room by the host");
                    self.connection.disconnect();
                }
                LobbyPhase::RoomClosed { .. } => info!("[LOBBY] Room closed by the host"),
                LobbyPhase::BattleStarted { .. } => info!("[LOBBY] Battle starting"),
                _ => {}
            }
        }
        if let LobbyEvent::ParticipantLeft { username } = event {
            self.expire_notice(username);
        }
    }

    fn start_ticker(self: &Arc<Self>) {
        let period = self.connection.config().tick_interval;
        let driver: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(driver) = driver.upgrade() else {
                    break;
                };
                driver.apply(LobbyEvent::Tick);
                if !matches!(driver.state.borrow().phase, LobbyPhase::Countdown(_)) {
                    break;
                }
            }
        });
        let previous = self
            .ticker
            .lock()
            .ok()
            .and_then(|mut slot| slot.replace(handle));
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_ticker(&self) {
        let handle = self.ticker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    fn expire_notice(self: &Arc<Self>, username: String) {
        let ttl = self.connection.config().notice_ttl;
        let driver = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(driver) = driver.upgrade() {
                driver.apply(LobbyEvent::NoticeExpired { username });
            }
        });
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}

/// Controller for one lobby.
pub struct LobbySession {
    driver: Arc<Driver>,
    _subscription: Subscription,
}

impl LobbySession {
    /// Subscribe to `connection` and open it in lobby mode.
    pub fn join(connection: Connection, context: LobbyContext, token: impl Into<String>) -> Self {
        let params = SessionParams::lobby(context.room_id.clone(), token);
        let session = Self::subscribe(connection, context);
        session.driver.connection.connect(params);
        session
    }

    /// Like [`join`](Self::join), running `on_initial_failure` if the first connect fails.
    pub fn join_or_else(
        connection: Connection,
        context: LobbyContext,
        token: impl Into<String>,
        on_initial_failure: impl FnOnce(SessionError) + Send + 'static,
    ) -> Self {
        let params = SessionParams::lobby(context.room_id.clone(), token);
        let session = Self::subscribe(connection, context);
        session.driver.connection.connect_or_else(params, on_initial_failure);
        session
    }

    fn subscribe(connection: Connection, context: LobbyContext) -> Self {
        let listener_id = format!("lobby-{}", context.room_id);
        let (state, _) = watch::channel(LobbyState::new(context));
        let driver = Arc::new(Driver {
            connection,
            state,
            ticker: Mutex::new(None),
        });

        let weak = Arc::downgrade(&driver);
        let subscription = driver.connection.add_listener(listener_id, move |msg| {
            let Some(driver) = weak.upgrade() else {
                return;
            };
            if let Some(event) = LobbyEvent::from_server(msg) {
                driver.apply(event);
            }
        });
        driver.apply(LobbyEvent::Connecting);

        Self {
            driver,
            _subscription: subscription,
        }
    }

    pub fn state(&self) -> watch::Receiver<LobbyState> {
        self.driver.state.subscribe()
    }

    pub fn snapshot(&self) -> LobbyState {
        self.driver.state.borrow().clone()
    }

    pub fn connection(&self) -> &Connection {
        &self.driver.connection
    }

    /// Toggle our ready flag. Applied locally before the server confirms.
    pub fn set_ready(&self, ready: bool) -> Result<()> {
        if self.driver.state.borrow().is_host() {
            return Err(SessionError::Application(
                "The host does not need to ready up".to_string(),
            ));
        }
        self.driver.apply(LobbyEvent::LocalReady(ready));
        self.driver
            .connection
            .send_message(&ClientMessage::ReadyToggle { ready });
        Ok(())
    }

    pub fn kick(&self, username: &str) -> Result<()> {
        self.driver.state.borrow().check_can_kick(username)?;
        self.driver.connection.send_message(&ClientMessage::KickParticipant {
            username: username.to_string(),
        });
        Ok(())
    }

    /// Ask the server to begin the pre-match countdown.
    pub fn start_countdown(&self, seconds: u32) -> Result<()> {
        self.driver.state.borrow().check_can_start()?;
        self.driver
            .connection
            .send_message(&ClientMessage::StartCountdown { countdown: seconds });
        Ok(())
    }

    pub fn close_room(&self) -> Result<()> {
        self.driver.state.borrow().check_can_close()?;
        self.driver.connection.send_message(&ClientMessage::CloseRoom);
        Ok(())
    }

    pub fn send_chat(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::Application("Message is empty".to_string()));
        }
        let (sender, room_id) = {
            let state = self.driver.state.borrow();
            (state.context.username.clone(), state.context.room_id.clone())
        };
        let message = local_message(&sender, text);
        let outbound = ClientMessage::ChatMessage {
            message: message.message.clone(),
            sender,
            room_id,
            timestamp: message.timestamp.clone(),
        };
        self.driver.apply(LobbyEvent::ChatSent(message));
        self.driver.connection.send_message(&outbound);
        Ok(())
    }

    /// Tell the server we are leaving, then close the connection.
    pub fn leave(self) {
        self.driver.connection.send_message(&ClientMessage::LeaveRoom);
        self.driver.connection.disconnect();
    }

    /// Wait for a terminal state, then for its grace delay.
    pub async fn finished(&self) -> LobbyExit {
        let mut state = self.driver.state.subscribe();
        let mut active = self.driver.connection.active();
        let config = self.driver.connection.config().clone();

        let exit = loop {
            if let Some(exit) = LobbyExit::from_phase(&state.borrow_and_update().phase) {
                break exit;
            }
            if !*active.borrow_and_update() {
                break LobbyExit::ConnectionLost;
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        break LobbyExit::ConnectionLost;
                    }
                }
                changed = active.changed() => {
                    if changed.is_err() {
                        break LobbyExit::ConnectionLost;
                    }
                }
            }
        };

        match exit {
            LobbyExit::RoomClosed { .. } => tokio::time::sleep(config.room_closed_grace).await,
            LobbyExit::Kicked => tokio::time::sleep(config.kicked_grace).await,
            _ => {}
        }
        exit
    }
}
