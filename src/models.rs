// Core domain types shared by the sync engine and the call signaling machine.
// Records are immutable-by-replacement: event handlers read the old value,
// merge, and store a full replacement.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Seconds a contact stays open for freeform replies after their most recent
/// incoming message. Outside this window only template sends are permitted.
pub const MESSAGING_WINDOW_SECS: i64 = 24 * 60 * 60;

/// Prefix marking a locally assigned message id that the provider has not
/// confirmed yet.
pub const PROVISIONAL_ID_PREFIX: &str = "tmp_";

/// Generate a fresh provisional message id.
pub fn provisional_id() -> String {
    format!("{}{}", PROVISIONAL_ID_PREFIX, uuid::Uuid::new_v4())
}

/// Whether `id` is a locally assigned placeholder still awaiting the
/// provider's canonical id.
pub fn is_provisional(id: &str) -> bool {
    id.starts_with(PROVISIONAL_ID_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Sticker,
    Template,
    Interactive,
    #[serde(other)]
    Unknown,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Text
    }
}

/// Delivery status of a message. Ordering of the variants matters: a status
/// never moves backwards, and Failed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl Default for MessageStatus {
    fn default() -> Self {
        MessageStatus::Sent
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: i64,
    #[serde(default)]
    pub status: MessageStatus,
    pub direction: Direction,
    /// One active reaction per reactor, keyed by the reactor's identifier.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub reactions: HashMap<String, String>,
    /// Back-reference to the id of the message this one quotes, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl Message {
    /// The id of the contact whose thread this message belongs to.
    pub fn counterpart(&self) -> &str {
        match self.direction {
            Direction::Incoming => &self.from,
            Direction::Outgoing => &self.to,
        }
    }

    /// Apply a status update, enforcing monotonicity. Returns true if the
    /// status actually changed. Failed is terminal and is never overwritten.
    pub fn apply_status(&mut self, new_status: MessageStatus) -> bool {
        if self.status == MessageStatus::Failed {
            return false;
        }
        if new_status == MessageStatus::Failed || new_status > self.status {
            self.status = new_status;
            return true;
        }
        false
    }

    /// Record or replace a reactor's reaction. An empty emoji retracts the
    /// reactor's existing reaction. Returns true if anything changed.
    pub fn apply_reaction(&mut self, from: &str, emoji: &str) -> bool {
        if emoji.is_empty() {
            return self.reactions.remove(from).is_some();
        }
        self.reactions.insert(from.to_string(), emoji.to_string()) != Some(emoji.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    /// Raw name as first observed (often just the party identifier).
    #[serde(default)]
    pub name: String,
    /// Display name pushed by the provider, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pushed_name: Option<String>,
    /// Name assigned locally by the user. Wins over everything else.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub is_favorite: bool,
    /// Most recent message in either direction, denormalized for list
    /// ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    /// Timestamp of the most recent incoming message from this contact.
    /// Anchors the messaging window; never advanced by outgoing sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_user_msg_timestamp: Option<i64>,
}

impl Contact {
    /// A placeholder contact created the first time an unknown identifier
    /// shows up in a message.
    pub fn stub(id: &str) -> Self {
        Contact {
            id: id.to_string(),
            name: id.to_string(),
            pushed_name: None,
            custom_name: None,
            is_favorite: false,
            last_message: None,
            last_user_msg_timestamp: None,
        }
    }

    /// Resolve the name to display: custom > provider-pushed > raw > id.
    pub fn display_name(&self) -> &str {
        if let Some(custom) = self.custom_name.as_deref() {
            if !custom.is_empty() {
                return custom;
            }
        }
        if let Some(pushed) = self.pushed_name.as_deref() {
            if !pushed.is_empty() {
                return pushed;
            }
        }
        if !self.name.is_empty() {
            return &self.name;
        }
        &self.id
    }

    /// Whether the contact is currently open for freeform sends: true iff a
    /// message was received from them less than 24 hours before `now`.
    pub fn is_window_open(&self, now: i64) -> bool {
        match self.last_user_msg_timestamp {
            Some(ts) => now - ts < MESSAGING_WINDOW_SECS,
            None => false,
        }
    }

    /// Seconds left before the messaging window closes, zero when it already
    /// has (or never opened).
    pub fn window_remaining_secs(&self, now: i64) -> i64 {
        match self.last_user_msg_timestamp {
            Some(ts) => (ts + MESSAGING_WINDOW_SECS - now).max(0),
            None => 0,
        }
    }
}

/// Partial contact update, merged field-by-field into the stored record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pushed_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_favorite: Option<bool>,
}
