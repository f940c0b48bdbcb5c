// End-to-end behaviour of sessions sharing one in-memory hub
// Time is paused, so debounce and retry timers advance deterministically

use async_trait::async_trait;
use engine::{
    BroadcastTransport, ChangeOrigin, Collaborators, DurableStore, MemoryHub, SaveState,
    SessionConfig, StoreError, SyncConfig, SyncSession,
};
use protocol::{BroadcastMessage, ClientId, Document, SessionKey};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

const ROOM: &str = "ROOM42";

fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {}", other),
    }
}

fn config(name: &str) -> SessionConfig {
    SessionConfig::new(ROOM)
        .with_display_name(name)
        .with_initial_document(doc(json!({"counter": 1, "items": []})))
}

async fn join(hub: &MemoryHub, name: &str) -> SyncSession {
    SyncSession::join(config(name), Collaborators::in_memory(hub)).await
}

// Let every spawned task run; paused time makes this instant
async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

fn remote(sender: ClientId, timestamp: i64, updates: Value) -> BroadcastMessage {
    BroadcastMessage {
        sender_id: sender,
        timestamp,
        field_updates: doc(updates),
    }
}

#[tokio::test(start_paused = true)]
async fn local_mutation_reaches_peer_and_store() {
    let hub = MemoryHub::new();
    let session = SessionKey::new(ROOM);
    let a = join(&hub, "A").await;
    let b = join(&hub, "B").await;

    // A third subscriber sees exactly what goes on the wire
    let observer = ClientId::new();
    let mut wire = BroadcastTransport::subscribe(&hub, &session, observer)
        .await
        .unwrap();

    let changes = a.mutate(doc(json!({"counter": 3})));
    assert_eq!(changes.len(), 1);
    assert_eq!(a.get("counter"), Some(json!(3)));
    assert!(a.is_dirty("counter"));

    settle().await;
    let sent = wire.try_recv().unwrap();
    assert_eq!(sent.sender_id, a.client_id());
    assert_eq!(sent.field_updates, doc(json!({"counter": 3})));
    assert_eq!(b.get("counter"), Some(json!(3)));

    // Nothing durable until the debounce elapses
    assert_eq!(hub.upsert_count(&session), 0);
    sleep(Duration::from_millis(400)).await;

    assert_eq!(hub.stored(&session), Some(doc(json!({"counter": 3, "items": []}))));
    assert!(a.dirty_fields().is_empty());
    assert_eq!(a.save_state(), SaveState::Saved);
    assert_eq!(hub.upsert_count(&session), 1);
}

#[tokio::test(start_paused = true)]
async fn dirty_field_survives_remote_update_until_flushed() {
    let hub = MemoryHub::new();
    let session = SessionKey::new(ROOM);
    let a = join(&hub, "A").await;
    let b = ClientId::new();

    a.mutate(doc(json!({"items": ["x"]})));

    hub.publish(&session, remote(b, 1, json!({"items": ["y"]})))
        .await
        .unwrap();
    settle().await;
    assert_eq!(a.get("items"), Some(json!(["x"])));

    sleep(Duration::from_millis(400)).await;
    assert!(!a.is_dirty("items"));

    hub.publish(&session, remote(b, 2, json!({"items": ["y", "z"]})))
        .await
        .unwrap();
    settle().await;
    assert_eq!(a.get("items"), Some(json!(["y", "z"])));
}

#[tokio::test(start_paused = true)]
async fn edits_inside_the_window_coalesce_into_one_flush() {
    let hub = MemoryHub::new();
    let session = SessionKey::new(ROOM);
    let a = join(&hub, "A").await;

    a.set("alpha", json!(1));
    sleep(Duration::from_millis(100)).await;
    a.set("beta", json!(2));
    sleep(Duration::from_millis(100)).await;
    a.set("alpha", json!(3));

    // Each mutation re-armed the timer
    sleep(Duration::from_millis(250)).await;
    assert_eq!(hub.upsert_count(&session), 0);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.upsert_count(&session), 1);

    let stored = hub.stored(&session).unwrap();
    assert_eq!(stored.get("alpha"), Some(&json!(3)));
    assert_eq!(stored.get("beta"), Some(&json!(2)));
}

#[tokio::test(start_paused = true)]
async fn identical_value_is_not_a_write() {
    let hub = MemoryHub::new();
    let session = SessionKey::new(ROOM);
    let a = join(&hub, "A").await;
    let mut wire = BroadcastTransport::subscribe(&hub, &session, ClientId::new())
        .await
        .unwrap();

    let changes = a.set("items", json!([]));

    assert!(changes.is_empty());
    assert!(!a.is_dirty("items"));
    sleep(Duration::from_millis(400)).await;
    assert!(wire.try_recv().is_err());
    assert_eq!(hub.upsert_count(&session), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_flush_keeps_fields_dirty_and_retries() {
    let hub = MemoryHub::new();
    let session = SessionKey::new(ROOM);
    let a = join(&hub, "A").await;
    let mut events = a.subscribe();
    hub.fail_next_upserts(1);

    a.set("journal", json!("first entry"));
    sleep(Duration::from_millis(310)).await;

    assert!(a.is_dirty("journal"));
    assert!(a.last_error().is_some());
    assert_eq!(hub.upsert_count(&session), 0);

    // Still protected while unconfirmed
    hub.publish(&session, remote(ClientId::new(), 5, json!({"journal": "theirs"})))
        .await
        .unwrap();
    settle().await;
    assert_eq!(a.get("journal"), Some(json!("first entry")));

    // First retry waits one backoff step
    sleep(Duration::from_millis(200)).await;
    assert_eq!(hub.upsert_count(&session), 1);
    assert!(!a.is_dirty("journal"));
    assert!(a.last_error().is_none());

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if let engine::SessionEvent::Error(_) = event {
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_leave_edits_pending() {
    let hub = MemoryHub::new();
    let session = SessionKey::new(ROOM);
    let sync = SyncConfig {
        max_retries: 1,
        ..SyncConfig::default()
    };
    let a = SyncSession::join(config("A").with_sync(sync), Collaborators::in_memory(&hub)).await;
    hub.fail_next_upserts(2);

    a.set("counter", json!(2));
    sleep(Duration::from_millis(300 + 200 + 50)).await;

    assert_eq!(a.save_state(), SaveState::OfflinePending);
    assert!(a.is_dirty("counter"));

    // The next mutation starts a fresh cycle
    a.set("counter", json!(4));
    sleep(Duration::from_millis(350)).await;
    assert_eq!(hub.stored(&session).unwrap().get("counter"), Some(&json!(4)));
    assert!(!a.is_dirty("counter"));
}

#[tokio::test(start_paused = true)]
async fn durable_catch_up_applies_to_clean_fields() {
    let hub = MemoryHub::new();
    let session = SessionKey::new(ROOM);
    let a = join(&hub, "A").await;
    a.set("journal", json!("mine"));

    // Another writer whose broadcast never reached us
    hub.upsert(&session, &doc(json!({"counter": 9, "items": [], "journal": "old"})))
        .await
        .unwrap();
    settle().await;

    assert_eq!(a.get("counter"), Some(json!(9)));
    assert_eq!(a.get("journal"), Some(json!("mine")));
}

#[tokio::test(start_paused = true)]
async fn late_joiner_loads_the_stored_document() {
    let hub = MemoryHub::new();
    let a = join(&hub, "A").await;
    a.set("counter", json!(7));
    sleep(Duration::from_millis(400)).await;

    let c = join(&hub, "C").await;
    assert_eq!(c.get("counter"), Some(json!(7)));
    assert!(c.dirty_fields().is_empty());
}

#[tokio::test(start_paused = true)]
async fn leave_flushes_pending_edits() {
    let hub = MemoryHub::new();
    let session = SessionKey::new(ROOM);
    let a = join(&hub, "A").await;

    a.set("counter", json!(5));
    a.leave().await.unwrap();

    assert_eq!(hub.upsert_count(&session), 1);
    assert_eq!(hub.stored(&session).unwrap().get("counter"), Some(&json!(5)));
    assert_eq!(hub.member_count(&session), 0);
}

#[tokio::test(start_paused = true)]
async fn change_handler_sees_remote_updates() {
    let hub = MemoryHub::new();
    let a = join(&hub, "A").await;
    let b = join(&hub, "B").await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    a.on_document_change(move |change| {
        sink.lock().unwrap().push(change.origin.clone());
    });

    b.set("counter", json!(2));
    settle().await;

    let seen = seen.lock().unwrap();
    assert_eq!(*seen, vec![ChangeOrigin::Broadcast(b.client_id())]);
}

// Store whose upserts take a while, and whose select can be made to fail
struct SlowStore {
    hub: MemoryHub,
    delay: Duration,
    fail_select: bool,
}

#[async_trait]
impl DurableStore for SlowStore {
    async fn select(&self, session: &SessionKey) -> Result<Option<Document>, StoreError> {
        if self.fail_select {
            return Err(StoreError::Backend("select refused".to_string()));
        }
        self.hub.select(session).await
    }

    async fn upsert(&self, session: &SessionKey, document: &Document) -> Result<(), StoreError> {
        sleep(self.delay).await;
        self.hub.upsert(session, document).await
    }

    async fn watch(
        &self,
        session: &SessionKey,
    ) -> Result<mpsc::UnboundedReceiver<Document>, StoreError> {
        self.hub.watch(session).await
    }
}

fn slow(hub: &MemoryHub, fail_select: bool) -> Collaborators {
    let shared = Arc::new(hub.clone());
    Collaborators::new(
        Arc::new(SlowStore {
            hub: hub.clone(),
            delay: Duration::from_millis(100),
            fail_select,
        }),
        shared.clone(),
        shared,
    )
}

#[tokio::test(start_paused = true)]
async fn edit_during_in_flight_flush_stays_dirty() {
    let hub = MemoryHub::new();
    let session = SessionKey::new(ROOM);
    let a = SyncSession::join(config("A"), slow(&hub, false)).await;

    a.set("counter", json!(2));
    a.set("items", json!(["x"]));
    // Flush starts at 300ms and takes 100ms
    sleep(Duration::from_millis(320)).await;
    a.set("counter", json!(3));
    sleep(Duration::from_millis(100)).await;

    assert_eq!(hub.upsert_count(&session), 1);
    assert!(!a.is_dirty("items"));
    assert!(a.is_dirty("counter"));

    sleep(Duration::from_millis(500)).await;
    assert_eq!(hub.stored(&session).unwrap().get("counter"), Some(&json!(3)));
    assert!(a.dirty_fields().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_load_falls_back_to_initial_document() {
    let hub = MemoryHub::new();
    hub.seed(&SessionKey::new(ROOM), doc(json!({"counter": 50})));

    let a = SyncSession::join(config("A"), slow(&hub, true)).await;

    assert_eq!(a.get_document(), doc(json!({"counter": 1, "items": []})));
    assert!(a.last_error().is_some());
}
