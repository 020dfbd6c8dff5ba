//! Lobby state machine.
//!
//! `Initializing → Connecting → Synced → Countdown → {BattleStarted | RoomClosed | Kicked}`
//!
//! [`transition`] is pure: it takes a state and an event and returns the next
//! state. Side effects (timers, disconnects, sends) live in the session
//! controller.

use std::collections::{BTreeMap, VecDeque};

use serde_json::Value;

use crate::error::{Result, SessionError};
use crate::lobby::chat::ChatTimeline;
use crate::protocol::{
    ChatMessage, Participant, ParticipantStatus, ParticipantsPayload, Role, RoomId, ServerMessage,
};
use crate::timer::{Tick, TimerSync};

/// Maximum number of "participant left" notices kept at once
pub const MAX_LEFT_NOTICES: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum LobbyPhase {
    Initializing,
    Connecting,
    Synced,
    Countdown(TimerSync),
    BattleStarted { question: Option<Value> },
    RoomClosed { message: Option<String> },
    Kicked,
}

impl LobbyPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LobbyPhase::BattleStarted { .. } | LobbyPhase::RoomClosed { .. } | LobbyPhase::Kicked
        )
    }

    pub fn countdown(&self) -> Option<u64> {
        match self {
            LobbyPhase::Countdown(timer) => timer.remaining(),
            _ => None,
        }
    }
}

/// Facts about the room and the local user known before the socket opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyContext {
    pub room_id: RoomId,
    pub username: String,
    /// Room owner from the REST snapshot, if known.
    pub owner: Option<String>,
    pub capacity: u32,
    /// Role from the REST snapshot, used until the first participant frame.
    pub initial_role: Option<Role>,
}

impl LobbyContext {
    pub fn new(room_id: impl Into<RoomId>, username: impl Into<String>, capacity: u32) -> Self {
        Self {
            room_id: room_id.into(),
            username: username.into(),
            owner: None,
            capacity,
            initial_role: None,
        }
    }

    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.initial_role = Some(role);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LobbyEvent {
    Connecting,
    Participants(ParticipantsPayload),
    Countdown(u32),
    Tick,
    ReadyStatus { username: String, ready: bool },
    /// Our own toggle, applied before the server confirms.
    LocalReady(bool),
    RoomClosed(Option<String>),
    Kicked { username: String },
    ParticipantLeft { username: String },
    NoticeExpired { username: String },
    StartBattle { question: Value },
    ChatReceived(ChatMessage),
    ChatHistory(Vec<ChatMessage>),
    ChatSent(ChatMessage),
}

impl LobbyEvent {
    /// Map an inbound frame to a lobby event. Frames for other channels map to `None`.
    pub fn from_server(msg: &ServerMessage) -> Option<Self> {
        let event = match msg {
            ServerMessage::ParticipantList(payload) | ServerMessage::ParticipantUpdate(payload) => {
                LobbyEvent::Participants(payload.clone())
            }
            ServerMessage::Countdown { countdown } => LobbyEvent::Countdown(*countdown),
            ServerMessage::ReadyStatus { username, ready } => LobbyEvent::ReadyStatus {
                username: username.clone(),
                ready: *ready,
            },
            ServerMessage::RoomClosed { message } => LobbyEvent::RoomClosed(message.clone()),
            ServerMessage::Kicked { username } => LobbyEvent::Kicked {
                username: username.clone(),
            },
            ServerMessage::ParticipantLeft { username } => LobbyEvent::ParticipantLeft {
                username: username.clone(),
            },
            ServerMessage::StartBattle { question } => LobbyEvent::StartBattle {
                question: question.clone(),
            },
            ServerMessage::ChatMessage(message) => LobbyEvent::ChatReceived(message.clone()),
            ServerMessage::ChatHistory { messages } => LobbyEvent::ChatHistory(messages.clone()),
            _ => return None,
        };
        Some(event)
    }
}

/// Role of `me`, from the most specific source available.
///
/// 1. the role the server attached for the receiving user,
/// 2. the role on `me`'s entry in the participant list,
/// 3. host if `me` owns the room, otherwise participant.
pub fn resolve_role(
    own_role: Option<Role>,
    participants: &[Participant],
    owner: Option<&str>,
    me: &str,
) -> Role {
    if let Some(role) = own_role {
        return role;
    }
    if let Some(role) = participants
        .iter()
        .find(|p| p.username == me)
        .and_then(|p| p.role)
    {
        return role;
    }
    if owner == Some(me) {
        Role::Host
    } else {
        Role::Participant
    }
}

/// Participants needed before the host may start: 2→2, 5→3, 10→6.
pub fn minimum_participants(capacity: u32) -> usize {
    capacity as usize / 2 + 1
}

#[derive(Debug, Clone, PartialEq)]
pub struct LobbyState {
    pub context: LobbyContext,
    pub phase: LobbyPhase,
    /// Joined participants from the latest snapshot.
    pub participants: Vec<Participant>,
    pub role: Role,
    pub ready: BTreeMap<String, bool>,
    pub chat: ChatTimeline,
    pub left_notices: VecDeque<String>,
    /// Match payload from `start_battle`, handed to the battle session.
    pub question: Option<Value>,
}

/// Pure transition: `(state, event) → state`.
pub fn transition(mut state: LobbyState, event: &LobbyEvent) -> LobbyState {
    state.handle(event);
    state
}

impl LobbyState {
    pub fn new(context: LobbyContext) -> Self {
        let owner = context.owner.as_deref();
        let role = context
            .initial_role
            .unwrap_or_else(|| resolve_role(None, &[], owner, &context.username));
        Self {
            context,
            phase: LobbyPhase::Initializing,
            participants: Vec::new(),
            role,
            ready: BTreeMap::new(),
            chat: ChatTimeline::default(),
            left_notices: VecDeque::new(),
            question: None,
        }
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn is_ready(&self, username: &str) -> bool {
        self.ready.get(username).copied().unwrap_or(false)
    }

    /// Apply one event in place.
    pub fn handle(&mut self, event: &LobbyEvent) {
        if self.phase.is_terminal() {
            // The question may trail the countdown reaching zero
            if let LobbyEvent::StartBattle { question } = event {
                if let LobbyPhase::BattleStarted { question: slot } = &mut self.phase {
                    if slot.is_none() {
                        *slot = Some(question.clone());
                        self.question = Some(question.clone());
                    }
                }
            }
            return;
        }

        match event {
            LobbyEvent::Connecting => {
                if self.phase == LobbyPhase::Initializing {
                    self.phase = LobbyPhase::Connecting;
                }
            }
            LobbyEvent::Participants(payload) => {
                self.participants = payload
                    .participants
                    .iter()
                    .filter(|p| p.status == ParticipantStatus::Joined)
                    .cloned()
                    .collect();
                self.role = resolve_role(
                    payload.role,
                    &payload.participants,
                    self.context.owner.as_deref(),
                    &self.context.username,
                );
                if matches!(self.phase, LobbyPhase::Initializing | LobbyPhase::Connecting) {
                    self.phase = LobbyPhase::Synced;
                }
            }
            LobbyEvent::Countdown(0) => self.start_battle(),
            LobbyEvent::Countdown(seconds) => {
                let seconds = u64::from(*seconds);
                if let LobbyPhase::Countdown(timer) = &mut self.phase {
                    timer.resync(seconds);
                } else {
                    self.phase = LobbyPhase::Countdown(TimerSync::starting_at(seconds));
                }
            }
            LobbyEvent::Tick => {
                if let LobbyPhase::Countdown(timer) = &mut self.phase {
                    if timer.tick() == Tick::Expired {
                        self.start_battle();
                    }
                }
            }
            LobbyEvent::ReadyStatus { username, ready } => {
                self.ready.insert(username.clone(), *ready);
            }
            LobbyEvent::LocalReady(ready) => {
                self.ready.insert(self.context.username.clone(), *ready);
            }
            LobbyEvent::RoomClosed(message) => {
                self.phase = LobbyPhase::RoomClosed {
                    message: message.clone(),
                };
            }
            LobbyEvent::Kicked { username } => {
                if *username == self.context.username {
                    self.phase = LobbyPhase::Kicked;
                }
            }
            LobbyEvent::ParticipantLeft { username } => {
                if !self.left_notices.contains(username) {
                    self.left_notices.push_back(username.clone());
                    while self.left_notices.len() > MAX_LEFT_NOTICES {
                        self.left_notices.pop_front();
                    }
                }
            }
            LobbyEvent::NoticeExpired { username } => {
                self.left_notices.retain(|u| u != username);
            }
            LobbyEvent::StartBattle { question } => {
                self.question = Some(question.clone());
                self.start_battle();
            }
            LobbyEvent::ChatReceived(message) => {
                self.chat.receive(message.clone());
            }
            LobbyEvent::ChatHistory(messages) => self.chat.replace_history(messages.clone()),
            LobbyEvent::ChatSent(message) => self.chat.push_local(message.clone()),
        }
    }

    fn start_battle(&mut self) {
        self.phase = LobbyPhase::BattleStarted {
            question: self.question.clone(),
        };
    }

    /// Host plus every joined non-host that is ready.
    pub fn ready_count(&self) -> usize {
        let me = self.context.username.as_str();
        let others = self
            .participants
            .iter()
            .filter(|p| p.username != me && p.role != Some(Role::Host))
            .filter(|p| self.is_ready(&p.username))
            .count();
        others + 1
    }

    /// Local gate for `start_countdown`. The server re-validates.
    pub fn check_can_start(&self) -> Result<()> {
        if !self.is_host() {
            return Err(SessionError::Application(
                "Only the host can start the battle".to_string(),
            ));
        }
        match self.phase {
            LobbyPhase::Synced => {}
            LobbyPhase::Countdown(_) => {
                return Err(SessionError::Application("Countdown already started".to_string()));
            }
            _ => {
                return Err(SessionError::Application(
                    "Lobby is not ready to start".to_string(),
                ));
            }
        }
        let required = minimum_participants(self.context.capacity);
        let ready = self.ready_count();
        if ready < required {
            return Err(SessionError::Application(format!(
                "Minimum participants not met: {required} required, {ready} ready"
            )));
        }
        Ok(())
    }

    /// Local gate for `kick_participant`. The server re-validates.
    pub fn check_can_kick(&self, username: &str) -> Result<()> {
        if !self.is_host() {
            return Err(SessionError::Application(
                "Only the host can remove participants".to_string(),
            ));
        }
        if username == self.context.username {
            return Err(SessionError::Application("Cannot remove yourself".to_string()));
        }
        if !self.participants.iter().any(|p| p.username == username) {
            return Err(SessionError::Application(format!("{username} is not in the room")));
        }
        Ok(())
    }

    /// Local gate for `close_room`. The server re-validates.
    pub fn check_can_close(&self) -> Result<()> {
        if self.is_host() {
            Ok(())
        } else {
            Err(SessionError::Application("Only the host can close the room".to_string()))
        }
    }
}
