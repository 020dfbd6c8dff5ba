//! Battle session controller.
//!
//! Drives [`BattleState`] from a battle-channel [`Connection`], ticks the clock
//! every `tick_interval`, and mirrors the remaining time into a
//! [`CountdownCache`] so a restarted client can show a provisional value.

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::battle::state::{BattleEvent, BattlePhase, BattleState};
use crate::cache::CountdownCache;
use crate::connection::{Connection, SessionParams, Subscription};
use crate::error::SessionError;
use crate::protocol::{LeaderboardEntry, RoomId};

#[derive(Debug, Clone, PartialEq)]
pub enum BattleExit {
    Completed {
        winners: Vec<LeaderboardEntry>,
        room_capacity: Option<u32>,
    },
    ConnectionLost,
}

struct Driver {
    connection: Connection,
    cache: Arc<dyn CountdownCache>,
    state: watch::Sender<BattleState>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Driver {
    fn room(&self) -> RoomId {
        self.state.borrow().room_id.clone()
    }

    fn apply(&self, event: BattleEvent) {
        let mut before = BattlePhase::Waiting;
        let mut snapshot = None;
        self.state.send_if_modified(|state| {
            before = state.phase;
            let previous = state.clone();
            state.handle(&event);
            snapshot = Some((state.phase, state.remaining()));
            *state != previous
        });
        let Some((after, remaining)) = snapshot else {
            return;
        };

        if before != after {
            debug!("[BATTLE] {:?} -> {:?}", before, after);
        }
        let room = self.room();
        if after == BattlePhase::Completed {
            if before != BattlePhase::Completed {
                info!("[BATTLE] Battle {} completed", room);
                self.stop_ticker();
                self.cache.clear(&room);
            }
            return;
        }
        let clock_moved = matches!(
            event,
            BattleEvent::Tick | BattleEvent::Started { .. } | BattleEvent::TimeUpdate(_)
        );
        if let Some(seconds) = remaining.filter(|_| clock_moved) {
            self.cache.store(&room, seconds);
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
                driver.apply(BattleEvent::Tick);
                if driver.state.borrow().is_completed() {
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
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}

/// Controller for one battle.
pub struct BattleSession {
    driver: Arc<Driver>,
    _subscription: Subscription,
}

impl BattleSession {
    /// Subscribe to `connection` and open it on the battle channel of `room`.
    pub fn join(
        connection: Connection,
        room: impl Into<RoomId>,
        token: impl Into<String>,
        cache: Arc<dyn CountdownCache>,
    ) -> Self {
        let room = room.into();
        let params = SessionParams::battle(room.clone(), token);
        let session = Self::subscribe(connection, room, cache);
        session.driver.connection.connect(params);
        session
    }

    /// Like [`join`](Self::join), running `on_initial_failure` if the first connect fails.
    pub fn join_or_else(
        connection: Connection,
        room: impl Into<RoomId>,
        token: impl Into<String>,
        cache: Arc<dyn CountdownCache>,
        on_initial_failure: impl FnOnce(SessionError) + Send + 'static,
    ) -> Self {
        let room = room.into();
        let params = SessionParams::battle(room.clone(), token);
        let session = Self::subscribe(connection, room, cache);
        session.driver.connection.connect_or_else(params, on_initial_failure);
        session
    }

    fn subscribe(connection: Connection, room: RoomId, cache: Arc<dyn CountdownCache>) -> Self {
        let listener_id = format!("battle-{}", room);
        let cached = cache.load(&room);
        let (state, _) = watch::channel(BattleState::new(room));
        let driver = Arc::new(Driver {
            connection,
            cache,
            state,
            ticker: Mutex::new(None),
        });
        if let Some(seconds) = cached {
            debug!("[BATTLE] Restored {}s from cache", seconds);
            driver.apply(BattleEvent::Restore(seconds));
        }

        let weak = Arc::downgrade(&driver);
        let subscription = driver.connection.add_listener(listener_id, move |msg| {
            let Some(driver) = weak.upgrade() else {
                return;
            };
            if let Some(event) = BattleEvent::from_server(msg) {
                driver.apply(event);
            }
        });
        driver.start_ticker();

        Self {
            driver,
            _subscription: subscription,
        }
    }

    pub fn state(&self) -> watch::Receiver<BattleState> {
        self.driver.state.subscribe()
    }

    pub fn snapshot(&self) -> BattleState {
        self.driver.state.borrow().clone()
    }

    pub fn connection(&self) -> &Connection {
        &self.driver.connection
    }

    pub fn leave(self) {
        self.driver.stop_ticker();
        self.driver.connection.disconnect();
    }

    /// Wait for `battle_completed` or for the connection to give up.
    pub async fn finished(&self) -> BattleExit {
        let mut state = self.driver.state.subscribe();
        let mut active = self.driver.connection.active();
        loop {
            {
                let current = state.borrow_and_update();
                if current.is_completed() {
                    return BattleExit::Completed {
                        winners: current.winners.clone(),
                        room_capacity: current.room_capacity,
                    };
                }
            }
            if !*active.borrow_and_update() {
                return BattleExit::ConnectionLost;
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return BattleExit::ConnectionLost;
                    }
                }
                changed = active.changed() => {
                    if changed.is_err() {
                        return BattleExit::ConnectionLost;
                    }
                }
            }
        }
    }
}
