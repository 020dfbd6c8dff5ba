//! Lobby chat timeline with optimistic sends.

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::protocol::ChatMessage;

/// Prefix of ids generated for messages not yet echoed by the server
pub const LOCAL_ID_PREFIX: &str = "local-";

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub message: ChatMessage,
    /// Sent by us and not yet echoed back.
    pub pending: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatTimeline {
    entries: Vec<ChatEntry>,
}

/// Build the optimistic copy of an outgoing message.
pub fn local_message(sender: &str, text: &str) -> ChatMessage {
    ChatMessage {
        id: format!("{LOCAL_ID_PREFIX}{}", hex::encode(rand::random::<[u8; 8]>())),
        sender: sender.to_string(),
        message: text.to_string(),
        timestamp: now_rfc3339(),
        is_system: false,
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

fn same_text(a: &ChatMessage, b: &ChatMessage) -> bool {
    a.sender == b.sender && a.message == b.message
}

impl ChatTimeline {
    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.entries.iter().map(|e| &e.message)
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push_local(&mut self, message: ChatMessage) {
        self.entries.push(ChatEntry {
            message,
            pending: true,
        });
    }

    /// Merge one inbound message. Returns whether the timeline changed.
    pub fn receive(&mut self, message: ChatMessage) -> bool {
        if !message.id.is_empty() && self.entries.iter().any(|e| e.message.id == message.id) {
            return false;
        }
        // Server echo of our own optimistic message
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.pending && same_text(&e.message, &message))
        {
            entry.message = message;
            entry.pending = false;
            return true;
        }
        if message.id.is_empty()
            && self.entries.iter().any(|e| {
                !e.pending
                    && same_text(&e.message, &message)
                    && e.message.timestamp == message.timestamp
            })
        {
            return false;
        }
        self.entries.push(ChatEntry {
            message,
            pending: false,
        });
        true
    }

    /// Replace with server history, keeping pending sends the history lacks.
    pub fn replace_history(&mut self, history: Vec<ChatMessage>) {
        let mut entries: Vec<ChatEntry> = Vec::with_capacity(history.len());
        for message in history {
            if !message.id.is_empty() && entries.iter().any(|e| e.message.id == message.id) {
                continue;
            }
            entries.push(ChatEntry {
                message,
                pending: false,
            });
        }
        for pending in self.entries.drain(..).filter(|e| e.pending) {
            if !entries.iter().any(|e| same_text(&e.message, &pending.message)) {
                entries.push(pending);
            }
        }
        self.entries = entries;
    }
}
