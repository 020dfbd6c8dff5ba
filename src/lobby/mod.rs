//! Pre-match lobby: participants, readiness, countdown, chat.

pub mod chat;
pub mod session;
pub mod state;

pub use chat::{ChatEntry, ChatTimeline};
pub use session::{LobbyExit, LobbySession};
pub use state::{
    LobbyContext, LobbyEvent, LobbyPhase, LobbyState, minimum_participants, resolve_role,
    transition,
};
