//! Integration tests for the live projection: an in-memory store, a
//! started coordinator and a gateway, exercised through the published
//! `ChatState`.

use parley_core::{Attachment, AttachmentKind, ConversationId, Url, User, UserId};
use parley_sync::store::CONVERSATIONS;
use parley_sync::{
    ChatState, DraftMessage, FieldValue, Fields, GatewayError, MemoryStore, MutationGateway,
    QueryKind, RemoteStore, StoreError, SubscriptionState, SyncConfig, SyncCoordinator,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    store: Arc<MemoryStore>,
    coordinator: Arc<SyncCoordinator>,
    gateway: MutationGateway,
    rx: watch::Receiver<ChatState>,
}

async fn put_user(store: &MemoryStore, id: &str, nickname: &str) {
    let fields = Fields::from([
        ("nickname".to_string(), FieldValue::Set(json!(nickname))),
        ("deviceId".to_string(), FieldValue::Set(json!(format!("device-{id}")))),
    ]);
    store.write("users", Some(id), fields).await.unwrap();
}

/// Store with users U1 (actor), U2 and U3; coordinator started as U1.
async fn start_harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    put_user(&store, "U1", "U1").await;
    put_user(&store, "U2", "U2").await;
    put_user(&store, "U3", "U3").await;

    let coordinator = Arc::new(SyncCoordinator::new(
        store.clone(),
        User::current("U1", "U1"),
        SyncConfig::for_testing(),
    ));
    let mut rx = coordinator.subscribe();
    coordinator.start().await.unwrap();
    wait_for(&mut rx, |s| s.all_users.len() == 3).await;

    let gateway = MutationGateway::new(coordinator.clone());
    Harness {
        store,
        coordinator,
        gateway,
        rx,
    }
}

async fn wait_for(
    rx: &mut watch::Receiver<ChatState>,
    predicate: impl FnMut(&ChatState) -> bool,
) -> ChatState {
    timeout(WAIT, rx.wait_for(predicate))
        .await
        .expect("Timed out waiting for projection")
        .expect("Coordinator dropped")
        .clone()
}

async fn wait_state(coordinator: &SyncCoordinator, kind: QueryKind, expected: SubscriptionState) {
    timeout(WAIT, async {
        while coordinator.state(kind).await != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Timed out waiting for subscription state");
}

fn ids(users: &[User]) -> Vec<&str> {
    users.iter().map(|u| u.id.as_str()).collect()
}

async fn create_with_u2(h: &mut Harness) -> ConversationId {
    let id = h
        .gateway
        .create_conversation(&["U2".into()], "", None)
        .await
        .unwrap();
    let wanted = id.clone();
    wait_for(&mut h.rx, move |s| s.conversation(&wanted).is_some()).await;
    id
}

#[tokio::test]
async fn test_exclusion_invariant() {
    let mut h = start_harness().await;

    let state = wait_for(&mut h.rx, |s| s.users.len() == 2).await;

    assert!(state.users.iter().all(|u| u.id.as_str() != "U1"));
    assert_eq!(state.all_users.iter().filter(|u| u.id.as_str() == "U1").count(), 1);
    assert_eq!(state.all_users.iter().filter(|u| u.is_current_user).count(), 1);
    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_creation_projects_empty_conversation() {
    let mut h = start_harness().await;

    let id = create_with_u2(&mut h).await;

    let state = h.coordinator.snapshot();
    let conv = state.conversation(&id).unwrap();
    assert_eq!(ids(&conv.users), vec!["U1", "U2"]);
    assert_eq!(
        conv.users_unread_count_info,
        BTreeMap::from([(UserId::from("U1"), 0), (UserId::from("U2"), 0)])
    );
    assert!(conv.latest_message.is_none());
    assert!(!conv.is_group);
    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_create_reuses_direct_conversation() {
    let mut h = start_harness().await;
    let first = create_with_u2(&mut h).await;

    let second = h
        .gateway
        .create_conversation(&["U2".into()], "", None)
        .await
        .unwrap();

    assert_eq!(first, second);
    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_image_message_summary() {
    let mut h = start_harness().await;
    let id = create_with_u2(&mut h).await;

    // The message comes from U2, written straight to the store as their
    // client would.
    let latest = json!({
        "userId": "U2",
        "createdAt": 1_700_000_000_000i64,
        "text": "",
        "attachments": [{ "id": "a1", "url": "https://cdn.test/cat.jpg", "type": "image" }],
    });
    h.store
        .write(
            CONVERSATIONS,
            Some(id.as_str()),
            Fields::from([("latestMessage".to_string(), FieldValue::Set(latest))]),
        )
        .await
        .unwrap();

    let wanted = id.clone();
    let state = wait_for(&mut h.rx, move |s| {
        s.conversation(&wanted).is_some_and(|c| c.latest_message.is_some())
    })
    .await;

    let summary = state.conversation(&id).unwrap().latest_message.clone().unwrap();
    assert_eq!(summary.sender_name, "U2");
    assert_eq!(summary.text, None);
    assert_eq!(summary.subtext.as_deref(), Some("Image"));
    assert_eq!(summary.display_text(), "no text");
    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_sender_has_no_summary() {
    let mut h = start_harness().await;
    let id = create_with_u2(&mut h).await;

    let latest = json!({ "userId": "stranger", "createdAt": 5, "text": "hi" });
    h.store
        .write(
            CONVERSATIONS,
            Some(id.as_str()),
            Fields::from([
                ("latestMessage".to_string(), FieldValue::Set(latest)),
                ("title".to_string(), FieldValue::Set(json!("marker"))),
            ]),
        )
        .await
        .unwrap();

    let wanted = id.clone();
    let state = wait_for(&mut h.rx, move |s| {
        s.conversation(&wanted).is_some_and(|c| c.title == "marker")
    })
    .await;

    assert!(state.conversation(&id).unwrap().latest_message.is_none());
    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_send_message_updates_summary_and_unread() {
    let mut h = start_harness().await;
    let id = h
        .gateway
        .create_conversation(&["U2".into(), "U3".into()], "Trio", None)
        .await
        .unwrap();
    let wanted = id.clone();
    wait_for(&mut h.rx, move |s| s.conversation(&wanted).is_some()).await;

    let url = Url::parse("https://cdn.test/clip.mp4").unwrap();
    let draft = DraftMessage::text("watch this").with_attachment(Attachment {
        id: "v1".into(),
        kind: AttachmentKind::Video,
        url: url.clone(),
        thumbnail_url: url,
    });
    h.gateway.send_message(&id, draft).await.unwrap();

    let wanted = id.clone();
    let state = wait_for(&mut h.rx, move |s| {
        s.conversation(&wanted).is_some_and(|c| c.latest_message.is_some())
    })
    .await;

    let conv = state.conversation(&id).unwrap();
    let summary = conv.latest_message.as_ref().unwrap();
    assert_eq!(summary.sender_name, "U1");
    assert_eq!(summary.text.as_deref(), Some("watch this"));
    assert_eq!(summary.subtext.as_deref(), Some("Video"));
    assert_eq!(conv.unread_count(&"U1".into()), 0);
    assert_eq!(conv.unread_count(&"U2".into()), 1);
    assert_eq!(conv.unread_count(&"U3".into()), 1);

    let messages = h.gateway.load_messages(&id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].user_id.as_str(), "U1");
    assert_eq!(messages[0].attachments[0].kind, AttachmentKind::Video);
    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_writes_right_after_create() {
    let mut h = start_harness().await;
    let id = h
        .gateway
        .create_conversation(&["U2".into(), "U9".into()], "Fresh", None)
        .await
        .unwrap();

    h.gateway.send_message(&id, DraftMessage::text("first")).await.unwrap();
    h.gateway.mark_read(&id).await.unwrap();

    let wanted = id.clone();
    let state = wait_for(&mut h.rx, move |s| {
        s.conversation(&wanted).is_some_and(|c| c.latest_message.is_some())
    })
    .await;
    let conv = state.conversation(&id).unwrap();
    assert_eq!(conv.unread_count(&"U2".into()), 1);
    assert_eq!(conv.unread_count(&"U1".into()), 0);

    // U9 had no profile when the message was sent but was still counted
    put_user(&h.store, "U9", "Nina").await;
    let wanted = id.clone();
    let state = wait_for(&mut h.rx, move |s| {
        s.conversation(&wanted).is_some_and(|c| c.users.len() == 3)
    })
    .await;
    assert_eq!(state.conversation(&id).unwrap().unread_count(&"U9".into()), 1);
    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mark_read_resets_actor_count() {
    let mut h = start_harness().await;
    let id = create_with_u2(&mut h).await;
    h.store
        .write(
            CONVERSATIONS,
            Some(id.as_str()),
            Fields::from([(
                "usersUnreadCountInfo".to_string(),
                FieldValue::Set(json!({ "U1": 3, "U2": 0 })),
            )]),
        )
        .await
        .unwrap();
    let wanted = id.clone();
    wait_for(&mut h.rx, move |s| {
        s.conversation(&wanted).is_some_and(|c| c.unread_count(&"U1".into()) == 3)
    })
    .await;

    h.gateway.mark_read(&id).await.unwrap();

    let wanted = id.clone();
    let state = wait_for(&mut h.rx, move |s| {
        s.conversation(&wanted).is_some_and(|c| c.unread_count(&"U1".into()) == 0)
    })
    .await;
    assert_eq!(
        state.conversation(&id).unwrap().users_unread_count_info,
        BTreeMap::from([(UserId::from("U1"), 0), (UserId::from("U2"), 0)])
    );
    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_user_rename_cascades_into_conversations() {
    let mut h = start_harness().await;
    let id = create_with_u2(&mut h).await;

    put_user(&h.store, "U2", "Bobby").await;

    let wanted = id.clone();
    let state = wait_for(&mut h.rx, move |s| {
        s.conversation(&wanted).is_some_and(|c| c.display_title() == "Bobby")
    })
    .await;
    assert!(state.users.iter().any(|u| u.name == "Bobby"));
    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_new_user_resolves_pending_participant() {
    let mut h = start_harness().await;
    let id = h
        .gateway
        .create_conversation(&["U2".into(), "U9".into()], "Later", None)
        .await
        .unwrap();
    let wanted = id.clone();
    let state = wait_for(&mut h.rx, move |s| s.conversation(&wanted).is_some()).await;
    assert_eq!(state.conversation(&id).unwrap().users.len(), 2);

    put_user(&h.store, "U9", "Nina").await;

    let wanted = id.clone();
    let state = wait_for(&mut h.rx, move |s| {
        s.conversation(&wanted).is_some_and(|c| c.users.len() == 3)
    })
    .await;
    assert_eq!(state.conversation(&id).unwrap().users_unread_count_info.len(), 3);
    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_write_leaves_projection_untouched() {
    let mut h = start_harness().await;
    let id = create_with_u2(&mut h).await;
    let before = h.coordinator.snapshot();

    h.store.set_fail_writes(true);
    let sent = h.gateway.send_message(&id, DraftMessage::text("lost")).await;
    let read = h.gateway.mark_read(&id).await;
    let deleted = h.gateway.delete_conversation(&id).await;

    assert!(matches!(sent, Err(GatewayError::Store(StoreError::Transport(_)))));
    assert!(matches!(read, Err(GatewayError::Store(StoreError::Transport(_)))));
    assert!(matches!(deleted, Err(GatewayError::Store(StoreError::Transport(_)))));

    let after = h.coordinator.snapshot();
    assert_eq!(*after.conversations, *before.conversations);
    assert!(after.conversation(&id).unwrap().latest_message.is_none());
    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delete_refreshes_without_waiting_for_push() {
    let mut h = start_harness().await;
    let id = create_with_u2(&mut h).await;

    h.gateway.delete_conversation(&id).await.unwrap();

    // Refresh completes before delete returns
    assert!(h.coordinator.snapshot().conversation(&id).is_none());
    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_error_event_keeps_prior_projection() {
    let mut h = start_harness().await;
    let id = create_with_u2(&mut h).await;
    let before = h.coordinator.snapshot();

    h.store
        .push_error(CONVERSATIONS, StoreError::Transport("listener reset".into()))
        .await;
    wait_state(&h.coordinator, QueryKind::Conversations, SubscriptionState::Error).await;

    let during = h.coordinator.snapshot();
    assert_eq!(*during.conversations, *before.conversations);

    // The next good snapshot recovers the subscription
    h.store
        .write(
            CONVERSATIONS,
            Some(id.as_str()),
            Fields::from([("title".to_string(), FieldValue::Set(json!("again")))]),
        )
        .await
        .unwrap();
    wait_state(&h.coordinator, QueryKind::Conversations, SubscriptionState::Active).await;
    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_conversation_dropped_from_batch() {
    let mut h = start_harness().await;
    create_with_u2(&mut h).await;
    h.store
        .write(
            CONVERSATIONS,
            Some("broken"),
            Fields::from([
                ("users".to_string(), FieldValue::Set(json!(["U1", "U3"]))),
                ("isGroup".to_string(), FieldValue::Set(json!("nope"))),
            ]),
        )
        .await
        .unwrap();
    h.gateway
        .create_conversation(&["U3".into()], "", None)
        .await
        .unwrap();

    let state = wait_for(&mut h.rx, |s| s.conversations.len() == 2).await;

    assert!(state.conversations.iter().all(|c| c.id.as_str() != "broken"));
    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_sends_all_counted() {
    let mut h = start_harness().await;
    let id = create_with_u2(&mut h).await;
    let gateway = Arc::new(h.gateway);

    let sends: Vec<_> = (0..10)
        .map(|i| {
            let gateway = gateway.clone();
            let id = id.clone();
            tokio::spawn(async move { gateway.send_message(&id, DraftMessage::text(format!("m{i}"))).await })
        })
        .collect();
    for send in sends {
        send.await.unwrap().unwrap();
    }

    let wanted = id.clone();
    let state = wait_for(&mut h.rx, move |s| {
        s.conversation(&wanted).is_some_and(|c| c.unread_count(&"U2".into()) == 10)
    })
    .await;
    assert_eq!(state.conversation(&id).unwrap().unread_count(&"U1".into()), 0);
    assert_eq!(gateway.load_messages(&id).await.unwrap().len(), 10);
    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ordering_follows_latest_message() {
    let mut h = start_harness().await;
    let older = create_with_u2(&mut h).await;
    let newer = h
        .gateway
        .create_conversation(&["U3".into()], "", None)
        .await
        .unwrap();
    let quiet = h
        .gateway
        .create_conversation(&["U2".into(), "U3".into()], "Quiet", None)
        .await
        .unwrap();
    wait_for(&mut h.rx, |s| s.conversations.len() == 3).await;

    for (id, ts) in [(&older, 100), (&newer, 200)] {
        let latest = json!({ "userId": "U2", "createdAt": ts, "text": "x" });
        h.store
            .write(
                CONVERSATIONS,
                Some(id.as_str()),
                Fields::from([("latestMessage".to_string(), FieldValue::Set(latest))]),
            )
            .await
            .unwrap();
    }

    let state = wait_for(&mut h.rx, |s| {
        s.conversations.iter().filter(|c| c.latest_message.is_some()).count() == 2
    })
    .await;
    let order: Vec<&ConversationId> = state.conversations.iter().map(|c| &c.id).collect();
    assert_eq!(order, vec![&newer, &older, &quiet]);
    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_refresh_timeout_is_reported() {
    let h = start_harness().await;
    h.store.set_latency(SyncConfig::for_testing().remote_timeout * 2);

    let result = h.coordinator.refresh_conversations().await;

    assert!(matches!(
        result,
        Err(parley_sync::SyncError::Store(StoreError::Timeout(_)))
    ));
    assert_eq!(
        h.coordinator.state(QueryKind::Conversations).await,
        SubscriptionState::Error
    );

    h.store.set_latency(Duration::ZERO);
    h.coordinator.refresh_conversations().await.unwrap();
    assert_eq!(
        h.coordinator.state(QueryKind::Conversations).await,
        SubscriptionState::Active
    );
    h.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_store_query_matches_projection() {
    let mut h = start_harness().await;
    create_with_u2(&mut h).await;

    let batch = h
        .store
        .query(&parley_sync::Query::conversations_of(&"U1".into()))
        .await
        .unwrap();

    assert_eq!(batch.len(), h.coordinator.snapshot().conversations.len());
    h.coordinator.shutdown().await.unwrap();
}
