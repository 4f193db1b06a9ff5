//! Transport session: ownership of the single physical push connection.
//!
//! [`TransportSession`] wraps a [`PushWire`] implementation (the production
//! one lives in [`crate::ws`]) and enforces the session-level rules: connect
//! is idempotent, the personal channel is subscribed before `connect`
//! returns, each channel slot has at most one live handler, and `send` fails
//! synchronously with [`SendError::NotConnected`] rather than queueing.
//!
//! The session does not retry on its own. A dropped wire is reported exactly
//! once through the status callback and stays down until the owner calls
//! `connect` again; silent retry would mask credential expiry.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::hlog;
use crate::logging;
use crate::types::ConnectionStatus;

/// Per-user queue carrying private messages. Subscribed implicitly on
/// connect, never dropped while the session is up.
pub const PERSONAL_CHANNEL: &str = "/user/queue/messages";

/// Topic carrying a group's messages.
pub fn group_channel(group_id: &str) -> String {
    format!("/topic/group/{group_id}")
}

/// Publish destination for one-to-one messages.
pub const PRIVATE_DESTINATION: &str = "/app/private-message";
/// Publish destination for group messages.
pub const GROUP_DESTINATION: &str = "/app/group-message";

#[derive(Debug, Clone)]
pub enum ConnectionError {
    /// The backend could not be reached.
    Unreachable(String),
    /// The backend refused the credential.
    AuthRejected(String),
    /// The connection came up but the personal channel could not be
    /// subscribed.
    Subscribe(String),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Unreachable(error) => write!(f, "transport unreachable: {error}"),
            ConnectionError::AuthRejected(error) => write!(f, "credential rejected: {error}"),
            ConnectionError::Subscribe(error) => {
                write!(f, "personal channel subscription failed: {error}")
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

/// A publish or subscribe attempt without a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    NotConnected,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::NotConnected => write!(f, "not connected"),
        }
    }
}

impl std::error::Error for SendError {}

/// Events surfaced by the wire to its owner.
#[derive(Debug)]
pub enum WireEvent {
    /// An inbound payload on a subscribed channel.
    Frame { channel: String, payload: Value },
    /// The physical connection is gone. Sent at most once per connection.
    Closed { reason: String },
}

/// One live physical connection. Implementations queue outbound traffic on
/// an ordered stream, so a subscribe issued before an unsubscribe reaches the
/// backend in that order.
pub trait WireSession: Send {
    /// Register interest in a channel; returns a wire-level subscription id.
    fn subscribe(&mut self, channel: &str) -> Result<u64, SendError>;
    fn unsubscribe(&mut self, subscription_id: u64, channel: &str);
    fn publish(&mut self, destination: &str, payload: &Value) -> Result<(), SendError>;
    fn close(&mut self);
}

/// Factory for physical connections.
pub trait PushWire: Send + Sync + 'static {
    type Session: WireSession;

    /// Establish a connection authenticated by `credential`. Inbound frames
    /// and the eventual close notification arrive on `inbound`.
    fn connect(
        &self,
        credential: &str,
        inbound: mpsc::UnboundedSender<WireEvent>,
    ) -> impl std::future::Future<Output = Result<Self::Session, ConnectionError>> + Send;
}

/// Callback invoked once per push payload on a subscribed channel.
pub type PushHandler = Box<dyn FnMut(Value) + Send>;

/// Callback for out-of-band connection status changes.
pub type StatusCallback = Box<dyn FnMut(ConnectionStatus) + Send>;

/// Proof of a subscription. Passing a stale handle to
/// [`TransportSession::unsubscribe`] (one superseded by a later subscribe on
/// the same channel) is a no-op.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    channel: String,
    wire_id: u64,
}

impl SubscriptionHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// Owner of the physical connection and all raw channel subscriptions.
pub struct TransportSession<W: PushWire> {
    wire: W,
    session: Option<W::Session>,
    handlers: HashMap<String, (u64, PushHandler)>,
    on_status: StatusCallback,
}

impl<W: PushWire> TransportSession<W> {
    pub fn new(wire: W, on_status: StatusCallback) -> Self {
        Self {
            wire,
            session: None,
            handlers: HashMap::new(),
            on_status,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Establish the transport. Idempotent: a call while already connected is
    /// a no-op. On success the personal channel is subscribed (with
    /// `personal_handler`) before this returns.
    pub async fn connect(
        &mut self,
        credential: &str,
        inbound: mpsc::UnboundedSender<WireEvent>,
        personal_handler: PushHandler,
    ) -> Result<(), ConnectionError> {
        if self.session.is_some() {
            hlog!("transport: connect ignored, already connected");
            return Ok(());
        }

        (self.on_status)(ConnectionStatus::Connecting);
        let session = match self.wire.connect(credential, inbound).await {
            Ok(session) => session,
            Err(error) => {
                (self.on_status)(ConnectionStatus::Disconnected);
                return Err(error);
            }
        };
        self.session = Some(session);

        if let Err(error) = self.install_handler(PERSONAL_CHANNEL, personal_handler) {
            self.teardown();
            (self.on_status)(ConnectionStatus::Disconnected);
            return Err(ConnectionError::Subscribe(error.to_string()));
        }

        (self.on_status)(ConnectionStatus::Connected);
        hlog!("transport: connected, personal channel live");
        Ok(())
    }

    /// Tear down the connection and every subscription. Safe to call when
    /// already disconnected.
    pub fn disconnect(&mut self) {
        if self.session.is_none() {
            return;
        }
        self.teardown();
        (self.on_status)(ConnectionStatus::Disconnected);
        hlog!("transport: disconnected");
    }

    /// Register `handler` for `channel`. A channel slot holds at most one
    /// subscription: an existing one is unsubscribed first, so the backend
    /// never delivers a payload twice.
    pub fn subscribe(
        &mut self,
        channel: &str,
        handler: PushHandler,
    ) -> Result<SubscriptionHandle, SendError> {
        if self.session.is_none() {
            return Err(SendError::NotConnected);
        }
        let wire_id = self.install_handler(channel, handler)?;
        Ok(SubscriptionHandle {
            channel: channel.to_string(),
            wire_id,
        })
    }

    /// Drop the subscription identified by `handle`. A handle superseded by
    /// a later subscribe on the same channel is ignored.
    pub fn unsubscribe(&mut self, handle: &SubscriptionHandle) {
        let current = self.handlers.get(&handle.channel).map(|(id, _)| *id);
        if current != Some(handle.wire_id) {
            return;
        }
        self.handlers.remove(&handle.channel);
        if let Some(session) = self.session.as_mut() {
            session.unsubscribe(handle.wire_id, &handle.channel);
        }
    }

    /// Fire-and-forget publish. Does not queue or retry; while disconnected
    /// this fails synchronously.
    pub fn send(&mut self, destination: &str, payload: &Value) -> Result<(), SendError> {
        match self.session.as_mut() {
            Some(session) => session.publish(destination, payload),
            None => Err(SendError::NotConnected),
        }
    }

    /// Deliver an inbound frame to the channel's handler. Returns false when
    /// no handler holds the slot (a late frame for a dropped subscription).
    pub fn dispatch(&mut self, channel: &str, payload: Value) -> bool {
        match self.handlers.get_mut(channel) {
            Some((_, handler)) => {
                handler(payload);
                true
            }
            None => false,
        }
    }

    /// The wire reported itself gone. Clears all session state and reports
    /// `Disconnected` through the status callback exactly once.
    pub fn handle_closed(&mut self, reason: &str) {
        if self.session.is_none() {
            return;
        }
        hlog!("transport: connection lost: {reason}");
        self.session = None;
        self.handlers.clear();
        (self.on_status)(ConnectionStatus::Disconnected);
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.handlers.contains_key(channel)
    }

    fn install_handler(&mut self, channel: &str, handler: PushHandler) -> Result<u64, SendError> {
        let session = self.session.as_mut().ok_or(SendError::NotConnected)?;
        if let Some((old_id, _)) = self.handlers.remove(channel) {
            hlog!(
                "transport: replacing live subscription on {}",
                logging::chat_id(channel)
            );
            session.unsubscribe(old_id, channel);
        }
        let wire_id = session.subscribe(channel)?;
        self.handlers.insert(channel.to_string(), (wire_id, handler));
        Ok(wire_id)
    }

    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.handlers.clear();
    }
}
