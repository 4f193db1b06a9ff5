//! The chat engine: a single-task actor owning all session state.
//!
//! Everything mutable (transport, registry, store, coordinator, session
//! state) lives inside [`ChatEngine`] and is touched only from its `run`
//! loop, so no locks are needed and every interleaving of commands, push
//! frames, and fetch results is a plain ordering of events on one queue.
//!
//! REST calls are blocking and run on `spawn_blocking`; their results come
//! back as [`EngineEvent`]s tagged with the transition epoch they were
//! started under, which is how results for an abandoned selection get
//! discarded. Push handlers registered with the transport never touch the
//! engine directly either: they forward payloads back onto the same event
//! queue, preserving arrival order.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

use crate::api::{ApiError, ChatApi, GroupDetail, GroupSummary};
use crate::coordinator::{SelectionCoordinator, StepOutcome};
use crate::hlog;
use crate::logging;
use crate::registry::SubscriptionRegistry;
use crate::router::{MessageRouter, RouteDecision};
use crate::store::{ConversationStore, ReconcileOutcome};
use crate::transport::{
    PushWire, TransportSession, WireEvent, GROUP_DESTINATION, PRIVATE_DESTINATION,
};
use crate::types::{
    now_millis, ConnectionStatus, ConversationRef, DeliveryState, MembershipSnapshot, Message,
    SessionState,
};

const NOTICE_CAPACITY: usize = 256;

/// Requests accepted by the engine.
#[derive(Debug, Clone)]
pub enum Command {
    Connect,
    Disconnect,
    Select(ConversationRef),
    ClearSelection,
    SendText(String),
    RefreshRoster,
    JoinGroup(String),
    LeaveGroup(String),
    AddMember { group_id: String, user: String },
    RemoveMember { group_id: String, user: String },
    CreateGroup { name: String, description: Option<String> },
    DeleteGroup(String),
}

/// Internal events the run loop applies in arrival order. Fetch results
/// tied to a selection carry the epoch they were started under.
#[derive(Debug)]
pub enum EngineEvent {
    Wire(WireEvent),
    /// A push payload forwarded by a channel handler.
    Push(Value),
    Status(ConnectionStatus),
    MembershipFetched {
        epoch: u64,
        result: Result<GroupDetail, ApiError>,
    },
    HistoryFetched {
        epoch: u64,
        result: Result<Vec<Message>, ApiError>,
    },
    RosterFetched {
        result: Result<(Vec<String>, Vec<GroupSummary>), ApiError>,
    },
    /// Fresh membership for a group outside a selection transition.
    MembershipRefreshed {
        group_id: String,
        result: Result<GroupDetail, ApiError>,
    },
    /// Outcome of a fire-and-forget group mutation.
    GroupMutated {
        action: &'static str,
        group_id: String,
        result: Result<(), ApiError>,
    },
}

/// Facts broadcast to observers (the CLI front end, tests).
#[derive(Debug, Clone)]
pub enum Notice {
    Connection(ConnectionStatus),
    ConnectionFailed { reason: String },
    SelectionChanged { active: Option<ConversationRef> },
    SelectionFailed { target: ConversationRef, reason: String },
    TimelineReplaced { messages: Vec<Message> },
    MessageAppended(Message),
    MessageConfirmed { local_id: String, message: Message },
    MembershipUpdated(MembershipSnapshot),
    RosterUpdated { friends: Vec<String>, groups: Vec<GroupSummary> },
    RosterFailed { reason: String },
    SendFailed { local_id: Option<String>, reason: String },
    GroupActionFailed { action: &'static str, reason: String },
}

/// Cheap handle for talking to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    notices: broadcast::Sender<Notice>,
}

impl EngineHandle {
    /// Queue a command. Returns false once the engine has shut down.
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }
}

pub struct ChatEngine<W: PushWire, A: ChatApi + 'static> {
    user: String,
    credential: String,
    api: Arc<A>,
    transport: TransportSession<W>,
    registry: SubscriptionRegistry,
    router: MessageRouter,
    store: ConversationStore,
    coordinator: SelectionCoordinator,
    state: SessionState,
    pending_deep_link: Option<String>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    notices: broadcast::Sender<Notice>,
}

impl<W: PushWire, A: ChatApi + 'static> ChatEngine<W, A> {
    pub fn new(
        user: impl Into<String>,
        credential: impl Into<String>,
        wire: W,
        api: A,
        deep_link: Option<String>,
    ) -> (Self, EngineHandle) {
        let user = user.into();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        let status_tx = events_tx.clone();
        let transport = TransportSession::new(
            wire,
            Box::new(move |status| {
                let _ = status_tx.send(EngineEvent::Status(status));
            }),
        );

        let handle = EngineHandle {
            commands: commands_tx,
            notices: notices.clone(),
        };
        let engine = Self {
            router: MessageRouter::new(user.clone()),
            user,
            credential: credential.into(),
            api: Arc::new(api),
            transport,
            registry: SubscriptionRegistry::new(),
            store: ConversationStore::new(),
            coordinator: SelectionCoordinator::new(),
            state: SessionState::new(),
            pending_deep_link: deep_link,
            commands: commands_rx,
            events_tx,
            events_rx,
            notices,
        };
        (engine, handle)
    }

    /// Drive the engine until every command handle is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.apply(event),
            }
        }
        self.transport.disconnect();
        hlog!("engine: stopped");
    }

    // Test seam: the scenario tests drive commands and events by hand to
    // pin down interleavings the run loop would pick nondeterministically.
    pub fn session(&self) -> &SessionState {
        &self.state
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn active(&self) -> Option<&ConversationRef> {
        self.coordinator.active()
    }

    pub async fn recv_event(&mut self) -> Option<EngineEvent> {
        self.events_rx.recv().await
    }

    pub async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect().await,
            Command::Disconnect => self.disconnect(),
            Command::Select(target) => self.start_select(target),
            Command::ClearSelection => self.clear_selection(),
            Command::SendText(text) => self.send_text(text),
            Command::RefreshRoster => self.spawn_roster_fetch(),
            Command::JoinGroup(group_id) => {
                let id = group_id.clone();
                self.spawn_group_action("join", group_id, move |api| api.join_group(&id));
            }
            Command::LeaveGroup(group_id) => {
                let id = group_id.clone();
                self.spawn_group_action("leave", group_id, move |api| api.leave_group(&id));
            }
            Command::AddMember { group_id, user } => self.spawn_add_member(group_id, user),
            Command::RemoveMember { group_id, user } => {
                let id = group_id.clone();
                self.spawn_group_action("remove-member", group_id, move |api| {
                    api.remove_member(&id, &user)
                });
            }
            Command::CreateGroup { name, description } => {
                let group_name = name.clone();
                self.spawn_group_action("create", name, move |api| {
                    api.create_group(&group_name, description.as_deref())
                });
            }
            Command::DeleteGroup(group_id) => {
                let id = group_id.clone();
                self.spawn_group_action("delete", group_id, move |api| api.delete_group(&id));
            }
        }
    }

    pub fn apply(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Wire(WireEvent::Frame { channel, payload }) => {
                if !self.transport.dispatch(&channel, payload) {
                    hlog!("engine: late frame on {} ignored", logging::chat_id(&channel));
                }
            }
            EngineEvent::Wire(WireEvent::Closed { reason }) => self.connection_lost(&reason),
            EngineEvent::Push(payload) => self.handle_push(payload),
            EngineEvent::Status(status) => {
                self.state.connection = status;
                self.notify(Notice::Connection(status));
            }
            EngineEvent::MembershipFetched { epoch, result } => {
                self.membership_fetched(epoch, result)
            }
            EngineEvent::HistoryFetched { epoch, result } => self.history_fetched(epoch, result),
            EngineEvent::RosterFetched { result } => self.roster_fetched(result),
            EngineEvent::MembershipRefreshed { group_id, result } => {
                self.membership_refreshed(&group_id, result)
            }
            EngineEvent::GroupMutated {
                action,
                group_id,
                result,
            } => self.group_mutated(action, &group_id, result),
        }
    }

    async fn connect(&mut self) {
        if self.transport.is_connected() {
            return;
        }
        let (wire_tx, mut wire_rx) = mpsc::unbounded_channel();
        let forward = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = wire_rx.recv().await {
                if forward.send(EngineEvent::Wire(event)).is_err() {
                    break;
                }
            }
        });

        let push_tx = self.events_tx.clone();
        let personal_handler = Box::new(move |payload: Value| {
            let _ = push_tx.send(EngineEvent::Push(payload));
        });

        match self
            .transport
            .connect(&self.credential, wire_tx, personal_handler)
            .await
        {
            Ok(()) => self.spawn_roster_fetch(),
            Err(error) => {
                hlog!("engine: connect failed: {error}");
                self.notify(Notice::ConnectionFailed {
                    reason: error.to_string(),
                });
            }
        }
    }

    fn disconnect(&mut self) {
        self.transport.disconnect();
        self.registry.reset(&mut self.state);
        self.coordinator.clear(&mut self.state);
        self.store.clear();
        self.notify(Notice::SelectionChanged { active: None });
        self.check_invariant();
    }

    /// The wire died under us. Selection cannot survive the connection: the
    /// group subscription is gone, so an active group would violate the
    /// channel invariant. The session stays down until a new Connect.
    fn connection_lost(&mut self, reason: &str) {
        self.transport.handle_closed(reason);
        self.registry.reset(&mut self.state);
        self.coordinator.clear(&mut self.state);
        self.store.clear();
        self.notify(Notice::SelectionChanged { active: None });
        self.check_invariant();
    }

    fn start_select(&mut self, target: ConversationRef) {
        if !self.transport.is_connected() {
            self.notify(Notice::SelectionFailed {
                target,
                reason: "not connected".to_string(),
            });
            return;
        }
        let Some(ticket) = self.coordinator.begin_select(&mut self.state, target) else {
            return;
        };
        self.store.clear();
        // Observers stop rendering the previous conversation right away
        // instead of waiting for the new history to land.
        self.notify(Notice::TimelineReplaced { messages: vec![] });

        if ticket.target.is_group() {
            let push_tx = self.events_tx.clone();
            let handler = Box::new(move |payload: Value| {
                let _ = push_tx.send(EngineEvent::Push(payload));
            });
            if let Err(error) = self.registry.activate_group(
                &mut self.transport,
                &mut self.state,
                &ticket.target.id,
                handler,
            ) {
                if self.coordinator.fail(&mut self.state, ticket.epoch) {
                    self.registry.reset(&mut self.state);
                    self.notify(Notice::SelectionFailed {
                        target: ticket.target,
                        reason: error.to_string(),
                    });
                }
                self.check_invariant();
                return;
            }
        } else {
            self.registry
                .deactivate_group(&mut self.transport, &mut self.state);
        }
        self.check_invariant();

        if ticket.needs_membership {
            self.spawn_membership_fetch(ticket.epoch, ticket.target.id.clone());
        } else {
            self.spawn_history_fetch(ticket.epoch, ticket.target);
        }
    }

    fn clear_selection(&mut self) {
        self.coordinator.clear(&mut self.state);
        self.registry
            .deactivate_group(&mut self.transport, &mut self.state);
        self.store.clear();
        self.notify(Notice::SelectionChanged { active: None });
        self.check_invariant();
    }

    fn send_text(&mut self, text: String) {
        let Some(target) = self.coordinator.active().cloned() else {
            self.notify(Notice::SendFailed {
                local_id: None,
                reason: "no active conversation".to_string(),
            });
            return;
        };
        if target.is_group() {
            let is_member = self
                .store
                .membership()
                .map(|snapshot| snapshot.contains(&self.user))
                .unwrap_or(false);
            if !is_member {
                self.notify(Notice::SendFailed {
                    local_id: None,
                    reason: "not a member of this group".to_string(),
                });
                return;
            }
        }

        let local_id = format!("temp-{}-{:04x}", now_millis(), rand::random::<u16>());
        let message = Message {
            id: local_id.clone(),
            sender: self.user.clone(),
            recipient: (!target.is_group()).then(|| target.id.clone()),
            group_id: target.is_group().then(|| target.id.clone()),
            text: text.clone(),
            sent_at: now_millis(),
            delivery: DeliveryState::Pending,
        };
        self.store.append_optimistic(message.clone());
        self.notify(Notice::MessageAppended(message));

        let (destination, payload) = if target.is_group() {
            (
                GROUP_DESTINATION,
                json!({ "senderId": self.user, "groupId": target.id, "messageText": text }),
            )
        } else {
            (
                PRIVATE_DESTINATION,
                json!({ "senderId": self.user, "receiverId": target.id, "messageText": text }),
            )
        };
        if let Err(error) = self.transport.send(destination, &payload) {
            hlog!("engine: send of {local_id} failed: {error}");
            // The optimistic entry stays pending; the user decides whether
            // to retry after reconnecting.
            self.notify(Notice::SendFailed {
                local_id: Some(local_id),
                reason: error.to_string(),
            });
        }
    }

    fn handle_push(&mut self, payload: Value) {
        let message = match self.router.classify(payload) {
            Ok(message) => message,
            Err(reason) => {
                hlog!("engine: push dropped: {reason}");
                return;
            }
        };
        match self.router.route(self.state.active.as_ref(), message) {
            RouteDecision::DeliverPrivate {
                message,
                mark_read_peer,
            } => {
                if self.store.append_confirmed(message.clone()) {
                    self.notify(Notice::MessageAppended(message));
                }
                self.spawn_mark_read(mark_read_peer);
            }
            RouteDecision::DeliverGroup { message } => {
                if self.store.append_confirmed(message.clone()) {
                    self.notify(Notice::MessageAppended(message));
                }
            }
            RouteDecision::SelfEcho { message } => match self.store.reconcile(message.clone()) {
                ReconcileOutcome::Matched { local_id } => {
                    self.notify(Notice::MessageConfirmed { local_id, message });
                }
                ReconcileOutcome::Appended => self.notify(Notice::MessageAppended(message)),
                ReconcileOutcome::Duplicate => {}
            },
            RouteDecision::Drop { reason } => {
                hlog!("engine: push dropped: {reason}");
            }
        }
    }

    fn membership_fetched(&mut self, epoch: u64, result: Result<GroupDetail, ApiError>) {
        match result {
            Ok(detail) => {
                if self.coordinator.membership_loaded(epoch) == StepOutcome::Stale {
                    hlog!(
                        "engine: stale membership for {} discarded",
                        logging::chat_id(&detail.group_id)
                    );
                    return;
                }
                let snapshot = membership_snapshot(detail);
                let is_member = snapshot.contains(&self.user);
                let group_id = snapshot.group_id.clone();
                self.store.set_membership(snapshot.clone());
                self.notify(Notice::MembershipUpdated(snapshot));

                if is_member {
                    let target = ConversationRef::group(group_id, String::new());
                    self.spawn_history_fetch(epoch, target);
                } else {
                    // Non-members can look at the group but get no history
                    // and no send permission.
                    hlog!(
                        "engine: not a member of {}, skipping history",
                        logging::chat_id(&group_id)
                    );
                    if let StepOutcome::Completed(target) = self.coordinator.history_skipped(epoch)
                    {
                        // Pushes may have raced in during the transition.
                        self.notify(Notice::TimelineReplaced {
                            messages: self.store.timeline().to_vec(),
                        });
                        self.notify(Notice::SelectionChanged {
                            active: Some(target),
                        });
                    }
                }
            }
            Err(error) => self.selection_fetch_failed(epoch, error),
        }
    }

    fn history_fetched(&mut self, epoch: u64, result: Result<Vec<Message>, ApiError>) {
        match result {
            Ok(messages) => match self.coordinator.history_loaded(epoch) {
                StepOutcome::Stale => {
                    hlog!("engine: stale history discarded");
                }
                StepOutcome::Completed(target) => {
                    self.store.load_history(messages);
                    self.notify(Notice::TimelineReplaced {
                        messages: self.store.timeline().to_vec(),
                    });
                    self.notify(Notice::SelectionChanged {
                        active: Some(target.clone()),
                    });
                    if !target.is_group() {
                        // Opening the thread reads it.
                        self.spawn_mark_read(target.id);
                    }
                }
                StepOutcome::Progress => {}
            },
            Err(error) => self.selection_fetch_failed(epoch, error),
        }
    }

    /// A fetch belonging to the current transition failed: abort cleanly to
    /// Idle rather than leave a half-selected conversation.
    fn selection_fetch_failed(&mut self, epoch: u64, error: ApiError) {
        let target = self.state.active.clone();
        if !self.coordinator.fail(&mut self.state, epoch) {
            return;
        }
        self.registry
            .deactivate_group(&mut self.transport, &mut self.state);
        self.store.clear();
        if let Some(target) = target {
            hlog!("engine: selection of {target} failed: {error}");
            self.notify(Notice::SelectionFailed {
                target,
                reason: error.to_string(),
            });
        }
        self.notify(Notice::SelectionChanged { active: None });
        self.check_invariant();
    }

    fn roster_fetched(&mut self, result: Result<(Vec<String>, Vec<GroupSummary>), ApiError>) {
        match result {
            Ok((friends, groups)) => {
                hlog!(
                    "engine: roster loaded: {} conversations, {} groups",
                    friends.len(),
                    groups.len()
                );
                if let Some(link) = self.pending_deep_link.take() {
                    self.follow_deep_link(&link, &friends, &groups);
                }
                self.notify(Notice::RosterUpdated { friends, groups });
            }
            Err(error) => {
                hlog!("engine: roster fetch failed: {error}");
                self.notify(Notice::RosterFailed {
                    reason: error.to_string(),
                });
            }
        }
    }

    /// `link` is either a bare peer username or `group:<id>`. Unknown
    /// targets are logged and ignored rather than half-selected.
    fn follow_deep_link(&mut self, link: &str, friends: &[String], groups: &[GroupSummary]) {
        let target = match link.strip_prefix("group:") {
            Some(group_id) => match groups.iter().find(|g| g.group_id == group_id) {
                Some(group) => ConversationRef::group(&group.group_id, &group.group_name),
                None => {
                    hlog!("engine: deep link to unknown group {}", logging::chat_id(group_id));
                    return;
                }
            },
            None => {
                if !friends.iter().any(|friend| friend == link) {
                    hlog!("engine: deep link to unknown peer {}", logging::user_id(link));
                    return;
                }
                ConversationRef::private(link)
            }
        };
        self.start_select(target);
    }

    fn membership_refreshed(&mut self, group_id: &str, result: Result<GroupDetail, ApiError>) {
        match result {
            Ok(detail) => {
                if self.registry.active_group() != Some(group_id) {
                    return;
                }
                let snapshot = membership_snapshot(detail);
                self.store.set_membership(snapshot.clone());
                self.notify(Notice::MembershipUpdated(snapshot));
            }
            Err(error) => {
                hlog!(
                    "engine: membership refresh for {} failed: {error}",
                    logging::chat_id(group_id)
                );
            }
        }
    }

    fn group_mutated(&mut self, action: &'static str, group_id: &str, result: Result<(), ApiError>) {
        match result {
            Ok(()) => {
                hlog!("engine: {action} on {} done", logging::chat_id(group_id));
                let active_here = self.registry.active_group() == Some(group_id);
                match action {
                    "leave" | "delete" if active_here => self.clear_selection(),
                    "join" if active_here => self.spawn_membership_refresh(group_id.to_string()),
                    _ => {}
                }
                self.spawn_roster_fetch();
            }
            Err(error) => {
                hlog!("engine: {action} on {} failed: {error}", logging::chat_id(group_id));
                self.notify(Notice::GroupActionFailed {
                    action,
                    reason: error.to_string(),
                });
            }
        }
    }

    fn spawn_roster_fetch(&self) {
        let api = Arc::clone(&self.api);
        let events = self.events_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = api
                .conversations()
                .and_then(|friends| api.all_groups().map(|groups| (friends, groups)));
            let _ = events.send(EngineEvent::RosterFetched { result });
        });
    }

    fn spawn_membership_fetch(&self, epoch: u64, group_id: String) {
        let api = Arc::clone(&self.api);
        let events = self.events_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = api.group_detail(&group_id);
            let _ = events.send(EngineEvent::MembershipFetched { epoch, result });
        });
    }

    fn spawn_history_fetch(&self, epoch: u64, target: ConversationRef) {
        let api = Arc::clone(&self.api);
        let events = self.events_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = if target.is_group() {
                api.group_messages(&target.id)
            } else {
                api.private_messages(&target.id)
            };
            let _ = events.send(EngineEvent::HistoryFetched { epoch, result });
        });
    }

    fn spawn_membership_refresh(&self, group_id: String) {
        let api = Arc::clone(&self.api);
        let events = self.events_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = api.group_detail(&group_id);
            let _ = events.send(EngineEvent::MembershipRefreshed { group_id, result });
        });
    }

    /// Best-effort: a failed mark-read only costs an unread badge elsewhere.
    fn spawn_mark_read(&self, peer: String) {
        let api = Arc::clone(&self.api);
        tokio::task::spawn_blocking(move || {
            if let Err(error) = api.mark_read(&peer) {
                hlog!("engine: mark-read for {} failed: {error}", logging::user_id(&peer));
            }
        });
    }

    fn spawn_group_action<F>(&self, action: &'static str, group_id: String, op: F)
    where
        F: FnOnce(&A) -> Result<(), ApiError> + Send + 'static,
    {
        let api = Arc::clone(&self.api);
        let events = self.events_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = op(&api);
            let _ = events.send(EngineEvent::GroupMutated {
                action,
                group_id,
                result,
            });
        });
    }

    fn spawn_add_member(&self, group_id: String, user: String) {
        let api = Arc::clone(&self.api);
        let events = self.events_tx.clone();
        tokio::task::spawn_blocking(move || {
            // add_member returns the refreshed record, saving a round trip.
            match api.add_member(&group_id, &user) {
                Ok(detail) => {
                    let _ = events.send(EngineEvent::MembershipRefreshed {
                        group_id,
                        result: Ok(detail),
                    });
                }
                Err(error) => {
                    let _ = events.send(EngineEvent::GroupMutated {
                        action: "add-member",
                        group_id,
                        result: Err(error),
                    });
                }
            }
        });
    }

    fn notify(&self, notice: Notice) {
        // Err here just means nobody is listening right now.
        let _ = self.notices.send(notice);
    }

    fn check_invariant(&self) {
        if !self.state.channel_invariant_holds() {
            hlog!("engine: group channel out of step with active conversation");
            debug_assert!(false, "group channel out of step with active conversation");
        }
    }
}

fn membership_snapshot(detail: GroupDetail) -> MembershipSnapshot {
    MembershipSnapshot {
        group_id: detail.group_id,
        members: detail.members.into_iter().collect(),
        created_by: detail.created_by,
    }
}
