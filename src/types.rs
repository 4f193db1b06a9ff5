//! Core data model for the chat synchronization engine.
//!
//! These types are deliberately plain: the engine owns them outright and all
//! mutation happens inside the owning component (see module docs on
//! [`crate::store`] and [`crate::engine`]).

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Whether a conversation is one-to-one or a group topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatKind {
    Private,
    Group,
}

/// Identity of a conversation.
///
/// Equality and hashing are structural on `(kind, id)` only; the display name
/// is presentation data and may differ between two refs to the same
/// conversation.
#[derive(Debug, Clone)]
pub struct ConversationRef {
    pub kind: ChatKind,
    pub id: String,
    pub display_name: String,
}

impl ConversationRef {
    /// A one-to-one conversation with `peer`. The peer's username doubles as
    /// the display name.
    pub fn private(peer: impl Into<String>) -> Self {
        let id = peer.into();
        Self {
            kind: ChatKind::Private,
            display_name: id.clone(),
            id,
        }
    }

    pub fn group(group_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            kind: ChatKind::Group,
            id: group_id.into(),
            display_name: display_name.into(),
        }
    }

    pub fn is_group(&self) -> bool {
        self.kind == ChatKind::Group
    }
}

impl std::fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_group() {
            write!(f, "group {}", self.id)
        } else {
            write!(f, "user {}", self.id)
        }
    }
}

impl PartialEq for ConversationRef {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.id == other.id
    }
}

impl Eq for ConversationRef {}

impl Hash for ConversationRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.id.hash(state);
    }
}

/// Local delivery status of a timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Optimistically inserted; not yet confirmed by the server.
    Pending,
    /// Carries a server-assigned id.
    Confirmed,
}

/// A single timeline entry.
///
/// Exactly one of `recipient` (private) or `group_id` (group) is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub recipient: Option<String>,
    pub group_id: Option<String>,
    pub text: String,
    /// Milliseconds since the epoch; within a timeline, entries are ordered
    /// by this field with arrival order breaking ties.
    pub sent_at: u64,
    pub delivery: DeliveryState,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        self.delivery == DeliveryState::Pending
    }
}

/// Group membership as last reported by the backend.
///
/// Always replaced wholesale, never merged incrementally.
#[derive(Debug, Clone)]
pub struct MembershipSnapshot {
    pub group_id: String,
    pub members: HashSet<String>,
    pub created_by: String,
}

impl MembershipSnapshot {
    pub fn contains(&self, user: &str) -> bool {
        self.members.contains(user)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Process-wide session state.
///
/// Created on login, torn down on logout. `active` is written only by the
/// selection coordinator; `subscribed_group_channel` only by the subscription
/// registry.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub connection: ConnectionStatus,
    pub active: Option<ConversationRef>,
    pub subscribed_group_channel: Option<String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            connection: ConnectionStatus::Disconnected,
            active: None,
            subscribed_group_channel: None,
        }
    }

    /// Hard invariant: the subscribed group channel tracks the active
    /// conversation exactly — equal to its id when a group is active, absent
    /// otherwise.
    pub fn channel_invariant_holds(&self) -> bool {
        match &self.active {
            Some(chat) if chat.is_group() => {
                self.subscribed_group_channel.as_deref() == Some(chat.id.as_str())
            }
            _ => self.subscribed_group_channel.is_none(),
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire shape of a chat message, shared by push payloads and history
/// responses. Field names follow the backend's JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub message_text: String,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

impl WireMessage {
    /// Convert into a confirmed timeline entry. A missing timestamp falls
    /// back to the local clock.
    pub fn into_confirmed(self) -> Message {
        Message {
            id: self.id,
            sender: self.sender_id,
            recipient: self.receiver_id,
            group_id: self.group_id,
            text: self.message_text,
            sent_at: self.timestamp.unwrap_or_else(now_millis),
            delivery: DeliveryState::Confirmed,
        }
    }
}
