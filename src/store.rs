//! Conversation store: the timeline and membership of the active
//! conversation.
//!
//! Exactly one conversation's state is held at a time; leaving a
//! conversation drops its timeline and the history is re-fetched on return
//! (memory traded for guaranteed freshness). The timeline invariants are
//! enforced here: entries ordered by `sent_at` with arrival order breaking
//! ties, and no duplicate confirmed ids.

use std::collections::HashSet;

use crate::hlog;
use crate::logging;
use crate::types::{DeliveryState, MembershipSnapshot, Message};

/// What [`ConversationStore::reconcile`] did with an inbound echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A pending optimistic entry was promoted to confirmed.
    Matched { local_id: String },
    /// No pending candidate matched; appended as a new confirmed entry
    /// (e.g. a message sent from another session of the same account).
    Appended,
    /// The confirmed id was already in the timeline; dropped.
    Duplicate,
}

pub struct ConversationStore {
    timeline: Vec<Message>,
    membership: Option<MembershipSnapshot>,
    confirmed_ids: HashSet<String>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            timeline: Vec::new(),
            membership: None,
            confirmed_ids: HashSet::new(),
        }
    }

    pub fn timeline(&self) -> &[Message] {
        &self.timeline
    }

    pub fn membership(&self) -> Option<&MembershipSnapshot> {
        self.membership.as_ref()
    }

    /// Replace the whole timeline with fetched history. Full replace, never
    /// a merge: any entries delivered by push while the fetch was in flight
    /// are either present in the response or will be re-delivered and
    /// deduplicated.
    pub fn load_history(&mut self, messages: Vec<Message>) {
        self.timeline.clear();
        self.confirmed_ids.clear();
        for message in messages {
            if message.delivery == DeliveryState::Confirmed
                && !self.confirmed_ids.insert(message.id.clone())
            {
                continue;
            }
            self.insert_ordered(message);
        }
    }

    /// Insert a locally-originated message before any round trip. The entry
    /// differs from a confirmed one only in its delivery state.
    pub fn append_optimistic(&mut self, message: Message) {
        debug_assert!(message.is_pending());
        self.insert_ordered(message);
    }

    /// Append a server-confirmed message. Returns false when the id is
    /// already present (at-least-once delivery from the transport).
    pub fn append_confirmed(&mut self, message: Message) -> bool {
        debug_assert_eq!(message.delivery, DeliveryState::Confirmed);
        if !self.confirmed_ids.insert(message.id.clone()) {
            hlog!("store: duplicate confirmed message {} dropped", message.id);
            return false;
        }
        self.insert_ordered(message);
        true
    }

    /// Match a self-originated server echo against pending optimistic
    /// entries.
    ///
    /// Matching rule: the first (oldest) pending entry with the same sender
    /// and text wins. On a match the entry takes the server's id and
    /// timestamp and becomes confirmed. With no candidate the echo is
    /// appended as a new confirmed entry. Conversation identity is implicit:
    /// the store only ever holds the active conversation, and the router
    /// delivers only messages belonging to it.
    ///
    /// Never fails; an unmatched echo always degrades to an append.
    pub fn reconcile(&mut self, incoming: Message) -> ReconcileOutcome {
        if self.confirmed_ids.contains(&incoming.id) {
            return ReconcileOutcome::Duplicate;
        }

        let candidate = self.timeline.iter().position(|entry| {
            entry.is_pending() && entry.sender == incoming.sender && entry.text == incoming.text
        });

        match candidate {
            Some(index) => {
                let mut entry = self.timeline.remove(index);
                let local_id = std::mem::replace(&mut entry.id, incoming.id.clone());
                entry.sent_at = incoming.sent_at;
                entry.delivery = DeliveryState::Confirmed;
                self.confirmed_ids.insert(incoming.id);
                self.insert_ordered(entry);
                hlog!(
                    "store: pending {} confirmed by {}",
                    local_id,
                    logging::user_id(&incoming.sender)
                );
                ReconcileOutcome::Matched { local_id }
            }
            None => {
                self.append_confirmed(incoming);
                ReconcileOutcome::Appended
            }
        }
    }

    /// Replace the membership snapshot wholesale.
    pub fn set_membership(&mut self, snapshot: MembershipSnapshot) {
        self.membership = Some(snapshot);
    }

    /// Drop everything when leaving the conversation.
    pub fn clear(&mut self) {
        self.timeline.clear();
        self.membership = None;
        self.confirmed_ids.clear();
    }

    /// Insert keeping the timeline ordered by `sent_at`; equal timestamps
    /// keep arrival order.
    fn insert_ordered(&mut self, message: Message) {
        let position = self
            .timeline
            .partition_point(|entry| entry.sent_at <= message.sent_at);
        self.timeline.insert(position, message);
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}
