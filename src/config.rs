//! Session timing and endpoint configuration.
//!
//! Defaults match the values the arena server is tuned for; tests and the CLI
//! override them through the `with_*` builders.

use std::time::Duration;

/// Arena server address used when none is configured
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8000";

/// Heartbeat configuration
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect configuration
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Grace delays before a terminal lobby state is handed back to the caller
pub const ROOM_CLOSED_GRACE: Duration = Duration::from_secs(3);
pub const KICKED_GRACE: Duration = Duration::from_secs(2);

/// How long a "participant left" notice stays visible
pub const NOTICE_TTL: Duration = Duration::from_secs(5);

/// Local countdown tick period
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Scheme and authority, e.g. `ws://localhost:8000`. Channel paths are appended.
    pub server_url: String,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub room_closed_grace: Duration,
    pub kicked_grace: Duration,
    pub notice_ttl: Duration,
    pub tick_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            pong_timeout: PONG_TIMEOUT,
            reconnect_delay: RECONNECT_DELAY,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            room_closed_grace: ROOM_CLOSED_GRACE,
            kicked_grace: KICKED_GRACE,
            notice_ttl: NOTICE_TTL,
            tick_interval: TICK_INTERVAL,
        }
    }
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration, pong_timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.pong_timeout = pong_timeout;
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_grace(mut self, room_closed: Duration, kicked: Duration) -> Self {
        self.room_closed_grace = room_closed;
        self.kicked_grace = kicked;
        self
    }

    #[must_use]
    pub fn with_notice_ttl(mut self, ttl: Duration) -> Self {
        self.notice_ttl = ttl;
        self
    }
}
