//! Shared fixtures: a recording in-memory wire and a scripted REST API.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use huddle::api::{ApiError, ChatApi, GroupDetail, GroupSummary};
use huddle::transport::{ConnectionError, PushWire, SendError, WireEvent, WireSession};
use huddle::types::{DeliveryState, Message};

#[derive(Debug, Clone, PartialEq)]
pub enum WireAction {
    Subscribe(String),
    Unsubscribe(String),
    Publish { destination: String, payload: Value },
    Close,
}

/// A [`PushWire`] that records every wire-level action and lets tests inject
/// inbound events. Cloning shares the underlying recording.
#[derive(Clone)]
pub struct InMemoryWire {
    actions: Arc<Mutex<Vec<WireAction>>>,
    inbound: Arc<Mutex<Option<mpsc::UnboundedSender<WireEvent>>>>,
    fail_connect: bool,
    fail_publish: Arc<Mutex<bool>>,
}

impl InMemoryWire {
    pub fn new() -> Self {
        Self {
            actions: Arc::new(Mutex::new(Vec::new())),
            inbound: Arc::new(Mutex::new(None)),
            fail_connect: false,
            fail_publish: Arc::new(Mutex::new(false)),
        }
    }

    /// A wire whose connect attempts always fail.
    pub fn unreachable() -> Self {
        Self {
            fail_connect: true,
            ..Self::new()
        }
    }

    pub fn actions(&self) -> Vec<WireAction> {
        self.actions.lock().unwrap().clone()
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter_map(|action| match action {
                WireAction::Subscribe(channel) => Some(channel),
                _ => None,
            })
            .collect()
    }

    pub fn published(&self) -> Vec<(String, Value)> {
        self.actions()
            .into_iter()
            .filter_map(|action| match action {
                WireAction::Publish { destination, payload } => Some((destination, payload)),
                _ => None,
            })
            .collect()
    }

    /// Make every later publish fail as if the socket had just dropped.
    pub fn fail_publishes(&self) {
        *self.fail_publish.lock().unwrap() = true;
    }

    /// Deliver an inbound event as if it arrived from the backend.
    pub fn inject(&self, event: WireEvent) {
        let guard = self.inbound.lock().unwrap();
        let sender = guard.as_ref().expect("wire not connected");
        sender.send(event).expect("inbound channel closed");
    }
}

pub struct InMemorySession {
    actions: Arc<Mutex<Vec<WireAction>>>,
    fail_publish: Arc<Mutex<bool>>,
    next_id: u64,
}

impl WireSession for InMemorySession {
    fn subscribe(&mut self, channel: &str) -> Result<u64, SendError> {
        self.actions
            .lock()
            .unwrap()
            .push(WireAction::Subscribe(channel.to_string()));
        self.next_id += 1;
        Ok(self.next_id)
    }

    fn unsubscribe(&mut self, _subscription_id: u64, channel: &str) {
        self.actions
            .lock()
            .unwrap()
            .push(WireAction::Unsubscribe(channel.to_string()));
    }

    fn publish(&mut self, destination: &str, payload: &Value) -> Result<(), SendError> {
        if *self.fail_publish.lock().unwrap() {
            return Err(SendError::NotConnected);
        }
        self.actions.lock().unwrap().push(WireAction::Publish {
            destination: destination.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }

    fn close(&mut self) {
        self.actions.lock().unwrap().push(WireAction::Close);
    }
}

impl PushWire for InMemoryWire {
    type Session = InMemorySession;

    async fn connect(
        &self,
        _credential: &str,
        inbound: mpsc::UnboundedSender<WireEvent>,
    ) -> Result<InMemorySession, ConnectionError> {
        if self.fail_connect {
            return Err(ConnectionError::Unreachable("wire down".to_string()));
        }
        *self.inbound.lock().unwrap() = Some(inbound);
        Ok(InMemorySession {
            actions: Arc::clone(&self.actions),
            fail_publish: Arc::clone(&self.fail_publish),
            next_id: 0,
        })
    }
}

/// Scripted [`ChatApi`] with call recording.
pub struct FakeApi {
    calls: Mutex<Vec<String>>,
    friends: Mutex<Vec<String>>,
    groups: Mutex<HashMap<String, GroupDetail>>,
    group_history: Mutex<HashMap<String, Vec<Message>>>,
    private_history: Mutex<HashMap<String, Vec<Message>>>,
    fail: Mutex<HashSet<&'static str>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            friends: Mutex::new(Vec::new()),
            groups: Mutex::new(HashMap::new()),
            group_history: Mutex::new(HashMap::new()),
            private_history: Mutex::new(HashMap::new()),
            fail: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_friends(self, friends: &[&str]) -> Self {
        *self.friends.lock().unwrap() = friends.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_group(self, group_id: &str, name: &str, members: &[&str]) -> Self {
        self.groups.lock().unwrap().insert(
            group_id.to_string(),
            GroupDetail {
                group_id: group_id.to_string(),
                group_name: name.to_string(),
                created_by: members.first().unwrap_or(&"admin").to_string(),
                members: members.iter().map(|s| s.to_string()).collect(),
                description: None,
            },
        );
        self
    }

    pub fn with_group_history(self, group_id: &str, messages: Vec<Message>) -> Self {
        self.group_history
            .lock()
            .unwrap()
            .insert(group_id.to_string(), messages);
        self
    }

    pub fn with_private_history(self, peer: &str, messages: Vec<Message>) -> Self {
        self.private_history
            .lock()
            .unwrap()
            .insert(peer.to_string(), messages);
        self
    }

    /// Force every call to `method` to fail with a 500.
    pub fn failing_on(self, method: &'static str) -> Self {
        self.fail.lock().unwrap().insert(method);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(method))
            .count()
    }

    fn record(&self, method: &'static str, arg: &str) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(format!("{method}:{arg}"));
        if self.fail.lock().unwrap().contains(method) {
            return Err(ApiError::Status {
                code: 500,
                message: "forced failure".to_string(),
            });
        }
        Ok(())
    }
}

impl ChatApi for FakeApi {
    fn conversations(&self) -> Result<Vec<String>, ApiError> {
        self.record("conversations", "")?;
        Ok(self.friends.lock().unwrap().clone())
    }

    fn all_groups(&self) -> Result<Vec<GroupSummary>, ApiError> {
        self.record("all_groups", "")?;
        Ok(self
            .groups
            .lock()
            .unwrap()
            .values()
            .map(|detail| GroupSummary {
                group_id: detail.group_id.clone(),
                group_name: detail.group_name.clone(),
                created_by: detail.created_by.clone(),
            })
            .collect())
    }

    fn group_detail(&self, group_id: &str) -> Result<GroupDetail, ApiError> {
        self.record("group_detail", group_id)?;
        self.groups
            .lock()
            .unwrap()
            .get(group_id)
            .cloned()
            .ok_or(ApiError::Status {
                code: 404,
                message: "group not found".to_string(),
            })
    }

    fn group_messages(&self, group_id: &str) -> Result<Vec<Message>, ApiError> {
        self.record("group_messages", group_id)?;
        Ok(self
            .group_history
            .lock()
            .unwrap()
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }

    fn private_messages(&self, peer: &str) -> Result<Vec<Message>, ApiError> {
        self.record("private_messages", peer)?;
        Ok(self
            .private_history
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .unwrap_or_default())
    }

    fn join_group(&self, group_id: &str) -> Result<(), ApiError> {
        self.record("join_group", group_id)
    }

    fn leave_group(&self, group_id: &str) -> Result<(), ApiError> {
        self.record("leave_group", group_id)
    }

    fn add_member(&self, group_id: &str, user: &str) -> Result<GroupDetail, ApiError> {
        self.record("add_member", &format!("{group_id}/{user}"))?;
        let mut groups = self.groups.lock().unwrap();
        let detail = groups.get_mut(group_id).ok_or(ApiError::Status {
            code: 404,
            message: "group not found".to_string(),
        })?;
        detail.members.push(user.to_string());
        Ok(detail.clone())
    }

    fn remove_member(&self, group_id: &str, user: &str) -> Result<(), ApiError> {
        self.record("remove_member", &format!("{group_id}/{user}"))?;
        if let Some(detail) = self.groups.lock().unwrap().get_mut(group_id) {
            detail.members.retain(|member| member != user);
        }
        Ok(())
    }

    fn create_group(&self, name: &str, _description: Option<&str>) -> Result<(), ApiError> {
        self.record("create_group", name)
    }

    fn delete_group(&self, group_id: &str) -> Result<(), ApiError> {
        self.record("delete_group", group_id)
    }

    fn mark_read(&self, peer: &str) -> Result<(), ApiError> {
        self.record("mark_read", peer)
    }
}

pub fn group_message(id: &str, sender: &str, group: &str, text: &str, at: u64) -> Message {
    Message {
        id: id.to_string(),
        sender: sender.to_string(),
        recipient: None,
        group_id: Some(group.to_string()),
        text: text.to_string(),
        sent_at: at,
        delivery: DeliveryState::Confirmed,
    }
}

pub fn private_message(id: &str, sender: &str, receiver: &str, text: &str, at: u64) -> Message {
    Message {
        id: id.to_string(),
        sender: sender.to_string(),
        recipient: Some(receiver.to_string()),
        group_id: None,
        text: text.to_string(),
        sent_at: at,
        delivery: DeliveryState::Confirmed,
    }
}
