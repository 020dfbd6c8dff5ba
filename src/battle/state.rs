//! Battle state machine.
//!
//! The server owns ranking and the clock. This side upserts leaderboard rows
//! as they arrive, ticks the clock locally between resyncs, and freezes
//! everything once the battle completes.

use serde_json::Value;

use crate::protocol::{LeaderboardEntry, RoomId, ServerMessage};
use crate::timer::TimerSync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BattlePhase {
    /// Connected, no `battle_started` or `time_update` yet.
    Waiting,
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BattleEvent {
    Started { start_time: Value, time_limit: u64 },
    CodeVerified(LeaderboardEntry),
    TimeUpdate(u64),
    Completed { winners: Vec<LeaderboardEntry>, room_capacity: u32 },
    Tick,
    /// Cached remaining time from an earlier run. Never authoritative.
    Restore(u64),
}

impl BattleEvent {
    pub fn from_server(msg: &ServerMessage) -> Option<Self> {
        let event = match msg {
            ServerMessage::BattleStarted { start_time, time_limit } => BattleEvent::Started {
                start_time: start_time.clone(),
                time_limit: *time_limit,
            },
            ServerMessage::CodeVerified(entry) => BattleEvent::CodeVerified(entry.clone()),
            ServerMessage::TimeUpdate { remaining_seconds } => {
                BattleEvent::TimeUpdate(*remaining_seconds)
            }
            ServerMessage::BattleCompleted { winners, room_capacity } => BattleEvent::Completed {
                winners: winners.clone(),
                room_capacity: *room_capacity,
            },
            _ => return None,
        };
        Some(event)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BattleState {
    pub room_id: RoomId,
    pub phase: BattlePhase,
    pub clock: TimerSync,
    pub start_time: Option<Value>,
    pub time_limit: Option<u64>,
    /// Ordered by server-assigned position.
    pub leaderboard: Vec<LeaderboardEntry>,
    pub winners: Vec<LeaderboardEntry>,
    pub room_capacity: Option<u32>,
}

/// Pure transition: `(state, event) → state`.
pub fn transition(mut state: BattleState, event: &BattleEvent) -> BattleState {
    state.handle(event);
    state
}

impl BattleState {
    pub fn new(room_id: impl Into<RoomId>) -> Self {
        Self {
            room_id: room_id.into(),
            phase: BattlePhase::Waiting,
            clock: TimerSync::new(),
            start_time: None,
            time_limit: None,
            leaderboard: Vec::new(),
            winners: Vec::new(),
            room_capacity: None,
        }
    }

    pub fn remaining(&self) -> Option<u64> {
        self.clock.remaining()
    }

    pub fn is_completed(&self) -> bool {
        self.phase == BattlePhase::Completed
    }

    pub fn position_of(&self, username: &str) -> Option<u32> {
        self.leaderboard
            .iter()
            .find(|e| e.username == username)
            .map(|e| e.position)
    }

    pub fn handle(&mut self, event: &BattleEvent) {
        if self.is_completed() {
            return;
        }
        match event {
            BattleEvent::Started { start_time, time_limit } => {
                self.start_time = Some(start_time.clone());
                self.time_limit = Some(*time_limit);
                self.clock.resync(*time_limit);
                self.phase = BattlePhase::Running;
            }
            BattleEvent::CodeVerified(entry) => self.upsert(entry.clone()),
            BattleEvent::TimeUpdate(remaining) => {
                self.clock.resync(*remaining);
                self.phase = BattlePhase::Running;
            }
            BattleEvent::Completed { winners, room_capacity } => {
                self.winners = winners.clone();
                self.room_capacity = Some(*room_capacity);
                self.phase = BattlePhase::Completed;
            }
            BattleEvent::Tick => {
                self.clock.tick();
            }
            BattleEvent::Restore(remaining) => {
                self.clock.hydrate(*remaining);
            }
        }
    }

    fn upsert(&mut self, entry: LeaderboardEntry) {
        match self.leaderboard.iter_mut().find(|e| e.username == entry.username) {
            Some(existing) => *existing = entry,
            None => self.leaderboard.push(entry),
        }
        self.leaderboard.sort_by_key(|e| e.position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(username: &str, position: u32, completion_time: f64) -> LeaderboardEntry {
        LeaderboardEntry {
            username: username.into(),
            position,
            completion_time,
        }
    }

    fn started(time_limit: u64) -> BattleEvent {
        BattleEvent::Started {
            start_time: json!("2026-10-16T10:00:00Z"),
            time_limit,
        }
    }

    #[test]
    fn time_update_overrides_local_ticks() {
        let mut state = transition(BattleState::new("r1"), &started(1800));
        for _ in 0..10 {
            state.handle(&BattleEvent::Tick);
        }
        assert_eq!(state.remaining(), Some(1790));

        state.handle(&BattleEvent::TimeUpdate(1750));
        assert_eq!(state.remaining(), Some(1750));
    }

    #[test]
    fn restore_is_ignored_once_authoritative() {
        let mut state = BattleState::new("r1");
        state.handle(&BattleEvent::Restore(600));
        assert_eq!(state.remaining(), Some(600));
        assert!(!state.clock.is_authoritative());
        assert_eq!(state.phase, BattlePhase::Waiting);

        state.handle(&BattleEvent::TimeUpdate(1200));
        state.handle(&BattleEvent::Restore(30));
        assert_eq!(state.remaining(), Some(1200));
        assert_eq!(state.phase, BattlePhase::Running);
    }

    #[test]
    fn leaderboard_uses_server_positions() {
        let mut state = transition(BattleState::new("r1"), &started(600));
        state.handle(&BattleEvent::CodeVerified(entry("cy", 2, 95.0)));
        state.handle(&BattleEvent::CodeVerified(entry("bob", 1, 120.0)));
        // position is taken as given even if the times disagree
        let names: Vec<_> = state.leaderboard.iter().map(|e| e.username.as_str()).collect();
        assert_eq!(names, vec!["bob", "cy"]);

        state.handle(&BattleEvent::CodeVerified(entry("cy", 3, 95.0)));
        assert_eq!(state.leaderboard.len(), 2);
        assert_eq!(state.position_of("cy"), Some(3));
    }

    #[test]
    fn completion_freezes_state() {
        let mut state = transition(BattleState::new("r1"), &started(600));
        state.handle(&BattleEvent::CodeVerified(entry("bob", 1, 120.0)));
        state.handle(&BattleEvent::Completed {
            winners: vec![entry("bob", 1, 120.0)],
            room_capacity: 5,
        });
        let frozen = state.clone();

        state.handle(&BattleEvent::CodeVerified(entry("cy", 2, 200.0)));
        state.handle(&BattleEvent::TimeUpdate(10));
        state.handle(&BattleEvent::Tick);
        assert_eq!(state, frozen);
        assert_eq!(state.room_capacity, Some(5));
    }

    #[test]
    fn clock_stops_at_zero() {
        let mut state = transition(BattleState::new("r1"), &started(2));
        for _ in 0..5 {
            state.handle(&BattleEvent::Tick);
        }
        assert_eq!(state.remaining(), Some(0));
        assert_eq!(state.phase, BattlePhase::Running);
    }
}
