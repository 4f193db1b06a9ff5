//! Conversation selection: transitions, stale-result suppression, and the
//! single-group-channel rule.
//!
//! These tests drive the engine by hand (commands in, events applied in a
//! chosen order) to pin down interleavings that the run loop would schedule
//! nondeterministically.

mod common;

use common::{FakeApi, InMemoryWire, WireAction};
use serde_json::json;
use huddle::api::{GroupDetail, GroupSummary};
use huddle::engine::{ChatEngine, Command, EngineEvent, EngineHandle, Notice};
use huddle::transport::group_channel;
use huddle::types::ConversationRef;

type TestEngine = ChatEngine<InMemoryWire, FakeApi>;

async fn connected_engine(
    api: FakeApi,
    wire: InMemoryWire,
    deep_link: Option<&str>,
) -> (TestEngine, EngineHandle) {
    let (mut engine, handle) =
        ChatEngine::new("alice", "token", wire, api, deep_link.map(str::to_string));
    engine.handle_command(Command::Connect).await;
    // Connect queues exactly two status events before anything else.
    for _ in 0..2 {
        let event = engine.recv_event().await.expect("status event");
        engine.apply(event);
    }
    (engine, handle)
}

/// Apply queued events until `id` is the active conversation.
async fn run_until_active(engine: &mut TestEngine, id: &str) {
    loop {
        if engine.active().map(|active| active.id.as_str()) == Some(id) {
            return;
        }
        let event = engine.recv_event().await.expect("event");
        engine.apply(event);
    }
}

fn detail(group_id: &str, members: &[&str]) -> GroupDetail {
    GroupDetail {
        group_id: group_id.to_string(),
        group_name: group_id.to_string(),
        created_by: members.first().unwrap_or(&"admin").to_string(),
        members: members.iter().map(|s| s.to_string()).collect(),
        description: None,
    }
}

#[tokio::test]
async fn late_results_from_superseded_selection_are_discarded() {
    let api = FakeApi::new()
        .with_group("g1", "One", &["alice", "bob"])
        .with_group("g2", "Two", &["alice", "bob"]);
    let wire = InMemoryWire::new();
    let (mut engine, _handle) = connected_engine(api, wire, None).await;

    engine
        .handle_command(Command::Select(ConversationRef::group("g1", "One")))
        .await;
    engine
        .handle_command(Command::Select(ConversationRef::group("g2", "Two")))
        .await;

    // Results for the first selection (epoch 1) arrive after the second
    // (epoch 2) superseded it. They must change nothing.
    engine.apply(EngineEvent::MembershipFetched {
        epoch: 1,
        result: Ok(detail("g1", &["alice", "bob"])),
    });
    assert!(engine.store().membership().is_none());
    engine.apply(EngineEvent::HistoryFetched {
        epoch: 1,
        result: Ok(vec![common::group_message("m1", "bob", "g1", "old", 100)]),
    });
    assert!(engine.store().timeline().is_empty());
    assert!(engine.active().is_none());

    engine.apply(EngineEvent::MembershipFetched {
        epoch: 2,
        result: Ok(detail("g2", &["alice", "bob"])),
    });
    engine.apply(EngineEvent::HistoryFetched {
        epoch: 2,
        result: Ok(vec![common::group_message("m2", "bob", "g2", "new", 200)]),
    });

    let active = engine.active().expect("active conversation");
    assert_eq!(active.id, "g2");
    assert_eq!(engine.store().timeline().len(), 1);
    assert_eq!(engine.store().timeline()[0].id, "m2");
    assert_eq!(
        engine.session().subscribed_group_channel.as_deref(),
        Some("g2")
    );
    assert!(engine.session().channel_invariant_holds());
}

#[tokio::test]
async fn reselecting_the_active_conversation_fetches_nothing() {
    let api = FakeApi::new()
        .with_private_history("bob", vec![common::private_message("m1", "bob", "alice", "hi", 100)]);
    let wire = InMemoryWire::new();
    let (mut engine, _handle) = connected_engine(api, wire, None).await;

    engine
        .handle_command(Command::Select(ConversationRef::private("bob")))
        .await;
    run_until_active(&mut engine, "bob").await;
    assert_eq!(engine.api().calls_to("private_messages"), 1);
    assert_eq!(engine.store().timeline().len(), 1);

    engine
        .handle_command(Command::Select(ConversationRef::private("bob")))
        .await;

    // No new transition, no refetch, timeline intact.
    assert_eq!(engine.active().map(|a| a.id.clone()), Some("bob".to_string()));
    assert_eq!(engine.api().calls_to("private_messages"), 1);
    assert_eq!(engine.store().timeline().len(), 1);
}

#[tokio::test]
async fn membership_fetch_failure_aborts_the_selection() {
    let api = FakeApi::new()
        .with_group("g1", "One", &["alice"])
        .failing_on("group_detail");
    let wire = InMemoryWire::new();
    let (mut engine, handle) = connected_engine(api, wire.clone(), None).await;
    let mut notices = handle.subscribe();

    engine
        .handle_command(Command::Select(ConversationRef::group("g1", "One")))
        .await;
    loop {
        let event = engine.recv_event().await.expect("event");
        let done = matches!(event, EngineEvent::MembershipFetched { .. });
        engine.apply(event);
        if done {
            break;
        }
    }

    // Clean abort: no active conversation, no group channel, nothing cached.
    assert!(engine.active().is_none());
    assert!(engine.session().active.is_none());
    assert!(engine.session().subscribed_group_channel.is_none());
    assert!(engine.store().timeline().is_empty());
    assert!(engine.store().membership().is_none());
    assert!(engine.session().channel_invariant_holds());
    assert!(wire
        .actions()
        .contains(&WireAction::Unsubscribe(group_channel("g1"))));

    let mut saw_failure = false;
    while let Ok(notice) = notices.try_recv() {
        if matches!(notice, Notice::SelectionFailed { .. }) {
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

#[tokio::test]
async fn non_member_selection_completes_with_empty_timeline() {
    let api = FakeApi::new().with_group("g1", "One", &["bob", "carol"]);
    let wire = InMemoryWire::new();
    let (mut engine, _handle) = connected_engine(api, wire, None).await;

    engine
        .handle_command(Command::Select(ConversationRef::group("g1", "One")))
        .await;
    run_until_active(&mut engine, "g1").await;

    assert!(engine.store().timeline().is_empty());
    assert_eq!(engine.api().calls_to("group_messages"), 0);
    let membership = engine.store().membership().expect("membership");
    assert!(!membership.contains("alice"));
}

#[tokio::test]
async fn group_swaps_keep_at_most_one_group_channel() {
    let api = FakeApi::new()
        .with_group("g1", "One", &["alice"])
        .with_group("g2", "Two", &["alice"]);
    let wire = InMemoryWire::new();
    let (mut engine, _handle) = connected_engine(api, wire.clone(), None).await;

    engine
        .handle_command(Command::Select(ConversationRef::group("g1", "One")))
        .await;
    run_until_active(&mut engine, "g1").await;
    engine
        .handle_command(Command::Select(ConversationRef::group("g2", "Two")))
        .await;
    run_until_active(&mut engine, "g2").await;

    // The new channel comes up before the old one is released.
    let actions = wire.actions();
    let sub_g2 = actions
        .iter()
        .position(|a| *a == WireAction::Subscribe(group_channel("g2")))
        .expect("g2 subscribed");
    let unsub_g1 = actions
        .iter()
        .position(|a| *a == WireAction::Unsubscribe(group_channel("g1")))
        .expect("g1 released");
    assert!(sub_g2 < unsub_g1);
    assert_eq!(
        engine.session().subscribed_group_channel.as_deref(),
        Some("g2")
    );

    engine
        .handle_command(Command::Select(ConversationRef::private("bob")))
        .await;
    assert!(engine.session().subscribed_group_channel.is_none());
    assert!(wire
        .actions()
        .contains(&WireAction::Unsubscribe(group_channel("g2"))));
    assert!(engine.session().channel_invariant_holds());
}

#[tokio::test]
async fn leaving_the_active_group_clears_the_selection() {
    let api = FakeApi::new().with_group("g1", "One", &["alice"]);
    let wire = InMemoryWire::new();
    let (mut engine, _handle) = connected_engine(api, wire, None).await;

    engine
        .handle_command(Command::Select(ConversationRef::group("g1", "One")))
        .await;
    run_until_active(&mut engine, "g1").await;

    engine.apply(EngineEvent::GroupMutated {
        action: "leave",
        group_id: "g1".to_string(),
        result: Ok(()),
    });

    assert!(engine.active().is_none());
    assert!(engine.session().subscribed_group_channel.is_none());
    assert!(engine.store().timeline().is_empty());
}

#[tokio::test]
async fn starting_a_transition_blanks_the_timeline_for_observers() {
    let api = FakeApi::new()
        .with_private_history("bob", vec![common::private_message("m1", "bob", "alice", "hi", 100)])
        .with_group("g1", "One", &["alice"]);
    let wire = InMemoryWire::new();
    let (mut engine, handle) = connected_engine(api, wire, None).await;
    let mut notices = handle.subscribe();

    engine
        .handle_command(Command::Select(ConversationRef::private("bob")))
        .await;
    run_until_active(&mut engine, "bob").await;
    assert_eq!(engine.store().timeline().len(), 1);
    while notices.try_recv().is_ok() {}

    engine
        .handle_command(Command::Select(ConversationRef::group("g1", "One")))
        .await;

    // The old conversation's messages are gone from the moment the
    // transition starts, not when the new history lands.
    assert!(engine.store().timeline().is_empty());
    let notice = notices.try_recv().expect("notice at transition start");
    match notice {
        Notice::TimelineReplaced { messages } => assert!(messages.is_empty()),
        other => panic!("unexpected notice: {other:?}"),
    }
}

#[tokio::test]
async fn pushes_racing_a_non_member_selection_stay_visible() {
    let api = FakeApi::new().with_group("g1", "One", &["bob", "carol"]);
    let wire = InMemoryWire::new();
    let (mut engine, handle) = connected_engine(api, wire, None).await;
    let mut notices = handle.subscribe();

    engine
        .handle_command(Command::Select(ConversationRef::group("g1", "One")))
        .await;
    // A group push lands on the fresh channel before membership comes back.
    engine.apply(EngineEvent::Push(json!({
        "id": "m1",
        "senderId": "bob",
        "groupId": "g1",
        "messageText": "hi",
        "timestamp": 100u64,
    })));
    run_until_active(&mut engine, "g1").await;

    // No history for non-members, but the raced push stays and the final
    // timeline notice reports what the store actually holds.
    assert_eq!(engine.store().timeline().len(), 1);
    assert_eq!(engine.store().timeline()[0].id, "m1");
    let mut replaced = None;
    while let Ok(notice) = notices.try_recv() {
        if let Notice::TimelineReplaced { messages } = notice {
            replaced = Some(messages);
        }
    }
    let messages = replaced.expect("timeline notice");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "m1");
}

#[tokio::test]
async fn deep_link_selects_after_roster_load() {
    let api = FakeApi::new().with_group("g1", "One", &["alice"]);
    let wire = InMemoryWire::new();
    let (mut engine, _handle) = connected_engine(api, wire.clone(), Some("group:g1")).await;

    engine.apply(EngineEvent::RosterFetched {
        result: Ok((
            vec![],
            vec![GroupSummary {
                group_id: "g1".to_string(),
                group_name: "One".to_string(),
                created_by: "alice".to_string(),
            }],
        )),
    });

    // Selection started: the group channel is up and membership is on its way.
    assert_eq!(
        engine.session().subscribed_group_channel.as_deref(),
        Some("g1")
    );
    assert_eq!(
        engine.session().active.as_ref().map(|a| a.id.clone()),
        Some("g1".to_string())
    );
    run_until_active(&mut engine, "g1").await;
}
