//! Client session layer for a real-time coding-battle arena.
//!
//! A [`Connection`] owns one WebSocket session (room list, lobby or battle)
//! with heartbeat and bounded reconnect. The [`rooms`], [`lobby`] and
//! [`battle`] controllers subscribe to a connection and fold its frames into
//! state published over `tokio::sync::watch`.

pub mod battle;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod lobby;
pub mod protocol;
pub mod rooms;
pub mod timer;
pub mod transport;

pub use config::SessionConfig;
pub use connection::{Connection, ConnectionState, Notice, SessionParams, Subscription};
pub use error::{Result, SessionError};
pub use protocol::{Channel, ClientMessage, RoomId, ServerMessage};
