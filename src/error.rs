//! Error taxonomy for the session layer.

use serde::{Deserialize, Serialize};

/// Errors raised by connections and session controllers.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport failed to open, closed abnormally, or errored.
    #[error("connection error: {0}")]
    Connection(String),
    /// Inbound frame was not valid JSON or carried an unknown `type`.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// No pong arrived before the liveness deadline.
    #[error("heartbeat timed out waiting for pong")]
    Liveness,
    /// The server rejected the token.
    #[error("authorization error: {0}")]
    Authorization(String),
    /// Business-rule rejection, either from the server or a local gate.
    #[error("{0}")]
    Application(String),
    /// Outbound message could not be encoded.
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Codes the server uses for invalid or expired credentials.
const AUTH_ERROR_CODES: &[&str] = &[
    "4001",
    "4003",
    "auth_failed",
    "authentication_failed",
    "invalid_token",
    "token_expired",
    "token_invalid",
    "unauthorized",
];

/// Message fragments that mark an authorization failure when no code is sent.
const AUTH_ERROR_HINTS: &[&str] = &["token", "authenticat"];

/// `code` may arrive as a string or a number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Text(String),
    Number(i64),
}

impl ErrorCode {
    pub fn as_text(&self) -> String {
        match self {
            ErrorCode::Text(s) => s.clone(),
            ErrorCode::Number(n) => n.to_string(),
        }
    }
}

/// Classify a server-pushed `error` frame as authorization or application.
pub fn classify_server_error(message: &str, code: Option<&ErrorCode>) -> SessionError {
    let by_code = code
        .map(|c| c.as_text().to_ascii_lowercase())
        .is_some_and(|c| AUTH_ERROR_CODES.contains(&c.as_str()));
    let lowered = message.to_ascii_lowercase();
    let by_message = AUTH_ERROR_HINTS.iter().any(|hint| lowered.contains(hint));

    if by_code || by_message {
        SessionError::Authorization(message.to_string())
    } else {
        SessionError::Application(message.to_string())
    }
}
