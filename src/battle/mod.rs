//! Live battle: server-ranked leaderboard and the remaining-time clock.

pub mod session;
pub mod state;

pub use session::{BattleExit, BattleSession};
pub use state::{BattleEvent, BattlePhase, BattleState, transition};
