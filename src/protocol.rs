//! Wire protocol for the arena real-time channels.
//!
//! Every frame is a JSON object with a `type` discriminant. Inbound frames are
//! decoded in two steps so that a missing or unknown `type` can be told apart
//! from a known frame with a bad payload.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{ErrorCode, Result, SessionError};

/// Accepts `"42"` or `42` and yields `"42"`.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Float(f64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Int(n) => n.to_string(),
        Raw::Float(n) => n.to_string(),
    })
}

fn default_string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<String, D::Error> {
    Option::<Value>::deserialize(deserializer).map(|v| match v {
        Some(Value::String(s)) => s,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    })
}

/// Room identifier. The server uses numeric ids in some payloads and strings in others.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        string_or_number(deserializer).map(RoomId)
    }
}

/// Logical subscription target. Together with its room id it identifies a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    RoomList,
    Lobby(RoomId),
    Battle(RoomId),
}

impl Channel {
    pub fn path(&self) -> String {
        match self {
            Channel::RoomList => "/ws/rooms/".to_string(),
            Channel::Lobby(room) => format!("/ws/room/{room}/"),
            Channel::Battle(room) => format!("/ws/battle/{room}/"),
        }
    }

    /// Full transport address with the token as a query parameter.
    pub fn url(&self, server_url: &str, token: &str) -> String {
        format!(
            "{}{}?token={}",
            server_url.trim_end_matches('/'),
            self.path(),
            urlencoding::encode(token)
        )
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            Channel::RoomList => None,
            Channel::Lobby(room) | Channel::Battle(room) => Some(room),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Channel::RoomList => "room-list",
            Channel::Lobby(_) => "lobby",
            Channel::Battle(_) => "battle",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.room_id() {
            Some(room) => write!(f, "{}:{room}", self.kind()),
            None => f.write_str(self.kind()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[serde(alias = "owner")]
    Host,
    #[serde(other)]
    Participant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Joined,
    Left,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub username: String,
    #[serde(default)]
    pub role: Option<Role>,
    pub status: ParticipantStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantsPayload {
    #[serde(default)]
    pub participants: Vec<Participant>,
    /// Role of the receiving user, when the server attaches it.
    #[serde(default)]
    pub role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, deserialize_with = "default_string_or_number")]
    pub id: String,
    pub sender: String,
    pub message: String,
    #[serde(default, deserialize_with = "default_string_or_number")]
    pub timestamp: String,
    #[serde(default)]
    pub is_system: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub username: String,
    /// Server-assigned rank, 1-based.
    pub position: u32,
    /// Seconds from battle start to the accepted submission.
    #[serde(default)]
    pub completion_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSummary {
    #[serde(alias = "room_id")]
    pub id: RoomId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub capacity: u32,
    #[serde(default, alias = "participants_count")]
    pub participant_count: u32,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Client -> Server messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    RequestParticipants,
    RequestChatHistory,
    ReadyToggle { ready: bool },
    KickParticipant { username: String },
    StartCountdown { countdown: u32 },
    LeaveRoom,
    CloseRoom,
    ChatMessage {
        message: String,
        sender: String,
        room_id: RoomId,
        timestamp: String,
    },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Server -> Client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Pong,
    Error {
        message: String,
        #[serde(default)]
        code: Option<ErrorCode>,
    },
    ParticipantList(ParticipantsPayload),
    ParticipantUpdate(ParticipantsPayload),
    Countdown {
        countdown: u32,
    },
    ReadyStatus {
        username: String,
        ready: bool,
    },
    RoomClosed {
        #[serde(default)]
        message: Option<String>,
    },
    Kicked {
        username: String,
    },
    ParticipantLeft {
        username: String,
    },
    StartBattle {
        #[serde(default)]
        question: Value,
    },
    BattleStarted {
        #[serde(default)]
        start_time: Value,
        time_limit: u64,
    },
    CodeVerified(LeaderboardEntry),
    TimeUpdate {
        remaining_seconds: u64,
    },
    BattleCompleted {
        #[serde(default)]
        winners: Vec<LeaderboardEntry>,
        #[serde(default)]
        room_capacity: u32,
    },
    ChatMessage(ChatMessage),
    ChatHistory {
        #[serde(default)]
        messages: Vec<ChatMessage>,
    },
    RoomList {
        #[serde(default)]
        rooms: Vec<RoomSummary>,
    },
    RoomUpdate {
        #[serde(default)]
        rooms: Vec<RoomSummary>,
    },
}

/// Every inbound `type` this client understands.
const INBOUND_TYPES: &[&str] = &[
    "pong",
    "error",
    "participant_list",
    "participant_update",
    "countdown",
    "ready_status",
    "room_closed",
    "kicked",
    "participant_left",
    "start_battle",
    "battle_started",
    "code_verified",
    "time_update",
    "battle_completed",
    "chat_message",
    "chat_history",
    "room_list",
    "room_update",
];

impl ServerMessage {
    /// Decode a text frame. Errors are always [`SessionError::Protocol`].
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SessionError::Protocol(format!("invalid JSON: {e}")))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::Protocol("frame has no `type` field".to_string()))?
            .to_string();
        if !INBOUND_TYPES.contains(&kind.as_str()) {
            return Err(SessionError::Protocol(format!("unknown frame type `{kind}`")));
        }
        serde_json::from_value(value)
            .map_err(|e| SessionError::Protocol(format!("malformed `{kind}` frame: {e}")))
    }

    /// The wire `type` of this message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Pong => "pong",
            ServerMessage::Error { .. } => "error",
            ServerMessage::ParticipantList(_) => "participant_list",
            ServerMessage::ParticipantUpdate(_) => "participant_update",
            ServerMessage::Countdown { .. } => "countdown",
            ServerMessage::ReadyStatus { .. } => "ready_status",
            ServerMessage::RoomClosed { .. } => "room_closed",
            ServerMessage::Kicked { .. } => "kicked",
            ServerMessage::ParticipantLeft { .. } => "participant_left",
            ServerMessage::StartBattle { .. } => "start_battle",
            ServerMessage::BattleStarted { .. } => "battle_started",
            ServerMessage::CodeVerified(_) => "code_verified",
            ServerMessage::TimeUpdate { .. } => "time_update",
            ServerMessage::BattleCompleted { .. } => "battle_completed",
            ServerMessage::ChatMessage(_) => "chat_message",
            ServerMessage::ChatHistory { .. } => "chat_history",
            ServerMessage::RoomList { .. } => "room_list",
            ServerMessage::RoomUpdate { .. } => "room_update",
        }
    }
}
