//! Message router: classifies inbound push frames and decides whether they
//! belong to the active conversation.
//!
//! The router is pure with respect to the session: it never mutates store
//! or transport state, only returns a decision for the engine to act on.

use serde_json::Value;

use crate::types::{ConversationRef, Message, WireMessage};

/// What the engine should do with a classified inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// A private message for the active conversation, from the peer.
    /// `mark_read_peer` names the sender whose thread should be marked
    /// read, since the user is looking at it right now.
    DeliverPrivate {
        message: Message,
        mark_read_peer: String,
    },
    /// A group message for the active group, from another member.
    DeliverGroup { message: Message },
    /// The server echo of a message this user sent; reconcile against
    /// pending optimistic entries instead of appending.
    SelfEcho { message: Message },
    /// Not for the active conversation, or no conversation is active.
    Drop { reason: &'static str },
}

pub struct MessageRouter {
    local_user: String,
}

impl MessageRouter {
    pub fn new(local_user: impl Into<String>) -> Self {
        Self {
            local_user: local_user.into(),
        }
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    /// Decode a raw push payload into a confirmed message. Payloads missing
    /// both a group id and a receiver are malformed.
    pub fn classify(&self, payload: Value) -> Result<Message, String> {
        let wire: WireMessage = serde_json::from_value(payload)
            .map_err(|e| format!("undecodable push payload: {e}"))?;
        if wire.group_id.is_none() && wire.receiver_id.is_none() {
            return Err("push payload has neither groupId nor receiverId".to_string());
        }
        Ok(wire.into_confirmed())
    }

    /// Decide where a classified message goes relative to the active
    /// conversation.
    pub fn route(&self, active: Option<&ConversationRef>, message: Message) -> RouteDecision {
        let Some(active) = active else {
            return RouteDecision::Drop {
                reason: "no active conversation",
            };
        };

        if let Some(group_id) = &message.group_id {
            if !active.is_group() || active.id != *group_id {
                return RouteDecision::Drop {
                    reason: "group message for inactive group",
                };
            }
            if message.sender == self.local_user {
                return RouteDecision::SelfEcho { message };
            }
            return RouteDecision::DeliverGroup { message };
        }

        // Private: the pair (sender, receiver) must match (peer, me) or
        // (me, peer) for the active private thread.
        if active.is_group() {
            return RouteDecision::Drop {
                reason: "private message while a group is active",
            };
        }
        let peer = &active.id;
        let receiver = message.recipient.as_deref().unwrap_or_default();
        let from_peer = message.sender == *peer && receiver == self.local_user;
        let from_self = message.sender == self.local_user && receiver == *peer;
        if from_self {
            RouteDecision::SelfEcho { message }
        } else if from_peer {
            let mark_read_peer = message.sender.clone();
            RouteDecision::DeliverPrivate {
                message,
                mark_read_peer,
            }
        } else {
            RouteDecision::Drop {
                reason: "private message for a different thread",
            }
        }
    }
}
