// Soft locks and view tracking between sessions on one hub

use engine::{Collaborators, MemoryHub, SessionConfig, SyncSession};
use protocol::SessionKey;
use std::time::Duration;
use tokio::time::sleep;
use tokio_test::assert_ok;

const ROOM: &str = "TABLE7";

async fn join(hub: &MemoryHub, name: &str) -> SyncSession {
    let config = SessionConfig::new(ROOM).with_display_name(name);
    SyncSession::join(config, Collaborators::in_memory(hub)).await
}

async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn editing_locks_field_for_others() {
    let hub = MemoryHub::new();
    let a = join(&hub, "Ash").await;
    let b = join(&hub, "Birch").await;

    b.begin_editing("journal").await;
    settle().await;

    assert!(a.is_field_locked("journal"));
    assert!(!b.is_field_locked("journal"));
    let editor = a.get_field_editor("journal").unwrap();
    assert_eq!(editor.client_id, b.client_id());
    assert_eq!(editor.display_name, "Birch");

    b.stop_editing("journal").await;
    settle().await;
    assert!(!a.is_field_locked("journal"));
}

#[tokio::test(start_paused = true)]
async fn locks_are_advisory() {
    let hub = MemoryHub::new();
    let a = join(&hub, "Ash").await;
    let b = join(&hub, "Birch").await;

    b.begin_editing("journal").await;
    settle().await;

    let changes = a.set("journal", serde_json::json!("written anyway"));
    assert_eq!(changes.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn leaving_releases_locks() {
    let hub = MemoryHub::new();
    let a = join(&hub, "Ash").await;
    let b = join(&hub, "Birch").await;

    b.begin_editing("items").await;
    settle().await;
    assert!(a.is_field_locked("items"));

    assert_ok!(b.leave().await);
    settle().await;

    assert!(!a.is_field_locked("items"));
    assert_eq!(a.presence().online_users().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn lost_connection_releases_locks() {
    let hub = MemoryHub::new();
    let a = join(&hub, "Ash").await;
    let b = join(&hub, "Birch").await;

    b.begin_editing("items").await;
    settle().await;

    hub.disconnect(&SessionKey::new(ROOM), b.client_id());
    settle().await;

    assert!(a.get_field_editor("items").is_none());
}

#[tokio::test(start_paused = true)]
async fn dropped_session_releases_locks() {
    let hub = MemoryHub::new();
    let a = join(&hub, "Ash").await;
    let b = join(&hub, "Birch").await;

    b.begin_editing("journal").await;
    settle().await;
    assert!(a.is_field_locked("journal"));

    // No leave: the session just goes away
    drop(b);
    settle().await;

    a.update_current_view("map").await;
    settle().await;

    assert!(!a.is_field_locked("journal"));
    assert_eq!(a.presence().online_users().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn view_changes_are_visible() {
    let hub = MemoryHub::new();
    let a = join(&hub, "Ash").await;
    let b = join(&hub, "Birch").await;
    settle().await;

    // Everyone starts on the default view
    assert_eq!(a.presence().users_in_view("dashboard").len(), 1);

    b.update_current_view("combat").await;
    settle().await;

    assert!(a.presence().users_in_view("dashboard").is_empty());
    let in_combat = a.presence().users_in_view("combat");
    assert_eq!(in_combat.len(), 1);
    assert_eq!(in_combat[0].display_name, "Birch");
}
