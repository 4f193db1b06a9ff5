//! Subscription registry: the single owner of the active group channel.
//!
//! At most one group channel is live at a time. Swapping groups subscribes
//! the new channel before unsubscribing the old one, so there is no window
//! with zero group subscriptions while a group conversation is marked
//! active. The personal channel is owned by the transport session directly
//! and is never touched here.
//!
//! This type is also the only writer of
//! [`SessionState::subscribed_group_channel`].

use crate::hlog;
use crate::logging;
use crate::transport::{group_channel, PushHandler, PushWire, SendError, SubscriptionHandle, TransportSession};
use crate::types::SessionState;

struct ActiveGroup {
    group_id: String,
    handle: SubscriptionHandle,
}

pub struct SubscriptionRegistry {
    active: Option<ActiveGroup>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self { active: None }
    }

    pub fn active_group(&self) -> Option<&str> {
        self.active.as_ref().map(|group| group.group_id.as_str())
    }

    /// Make `group_id` the single active group channel.
    ///
    /// Subscribe-then-unsubscribe: the new channel is registered before the
    /// old handle is released. When re-activating the group that is already
    /// live, the transport's single-slot policy swaps the handler without a
    /// gap and the superseded handle becomes a no-op.
    pub fn activate_group<W: PushWire>(
        &mut self,
        transport: &mut TransportSession<W>,
        state: &mut SessionState,
        group_id: &str,
        handler: PushHandler,
    ) -> Result<(), SendError> {
        let handle = transport.subscribe(&group_channel(group_id), handler)?;
        let previous = self.active.replace(ActiveGroup {
            group_id: group_id.to_string(),
            handle,
        });
        if let Some(previous) = previous {
            hlog!(
                "registry: group channel {} -> {}",
                logging::chat_id(&previous.group_id),
                logging::chat_id(group_id)
            );
            transport.unsubscribe(&previous.handle);
        } else {
            hlog!("registry: group channel {} live", logging::chat_id(group_id));
        }
        state.subscribed_group_channel = Some(group_id.to_string());
        Ok(())
    }

    /// Drop the active group channel, if any. Used when switching to a
    /// private conversation or to no conversation.
    pub fn deactivate_group<W: PushWire>(
        &mut self,
        transport: &mut TransportSession<W>,
        state: &mut SessionState,
    ) {
        if let Some(previous) = self.active.take() {
            hlog!(
                "registry: group channel {} released",
                logging::chat_id(&previous.group_id)
            );
            transport.unsubscribe(&previous.handle);
        }
        state.subscribed_group_channel = None;
    }

    /// Forget the active group without touching the transport. Used after
    /// the wire itself is gone (its subscriptions died with it).
    pub fn reset(&mut self, state: &mut SessionState) {
        self.active = None;
        state.subscribed_group_channel = None;
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
