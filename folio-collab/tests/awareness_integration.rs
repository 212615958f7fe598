//! Presence over a real relay: cursors travel between clients, never touch
//! the document, reach late joiners, survive idle sweeps while their owner
//! is connected, and disappear when their owner leaves.

mod common;

use common::*;
use folio_collab::{AwarenessConfig, EditorAdapter};
use tokio::time::{sleep, Duration};

#[tokio::test]
async fn test_selection_reaches_other_editor() {
    let relay = start_relay().await;
    let alice = client(&relay, "alice").await;
    let bob = client(&relay, "bob").await;
    let room = summary_table();

    let a = EditorAdapter::new(alice.open(&room), "<p>Shared text</p>", |_| {}).unwrap();
    let b = EditorAdapter::new(bob.open(&room), "", |_| {}).unwrap();
    members(&relay, &room, 2).await;

    a.set_selection(2, 6);
    a.flush();

    eventually("bob to see alice's selection", || {
        b.remote_cursors()
            .iter()
            .any(|c| c.user_name == "alice" && (c.anchor, c.head) == (2, 6))
    })
    .await;

    let cursor = b
        .remote_cursors()
        .into_iter()
        .find(|c| c.user_name == "alice")
        .unwrap();
    assert_eq!(cursor.color, folio_collab::color_for(cursor.client_id));
}

#[tokio::test]
async fn test_awareness_is_never_merged_into_document() {
    let relay = start_relay().await;
    let alice = client(&relay, "alice").await;
    let bob = client(&relay, "bob").await;
    let room = summary_table();

    let a = EditorAdapter::new(alice.open(&room), "<p>Body</p>", |_| {}).unwrap();
    let b = EditorAdapter::new(bob.open(&room), "", |_| {}).unwrap();
    members(&relay, &room, 2).await;
    eventually("document to sync", || b.html() == "<p>Body</p>").await;
    let before = b.session().replica().state_vector();

    a.set_user_name("Alice A.");
    a.set_selection(1, 1);
    a.flush();

    eventually("bob to see the renamed cursor", || {
        b.remote_cursors().iter().any(|c| c.user_name == "Alice A.")
    })
    .await;
    assert_eq!(b.session().replica().state_vector(), before);
    assert_eq!(b.html(), "<p>Body</p>");
    assert_eq!(a.html(), "<p>Body</p>");
}

#[tokio::test]
async fn test_closing_room_removes_presence() {
    let relay = start_relay().await;
    let alice = client(&relay, "alice").await;
    let bob = client(&relay, "bob").await;
    let room = summary_table();

    let a = EditorAdapter::new(alice.open(&room), "", |_| {}).unwrap();
    let b = EditorAdapter::new(bob.open(&room), "", |_| {}).unwrap();
    members(&relay, &room, 2).await;

    a.set_selection(0, 0);
    a.flush();
    eventually("alice's cursor at bob", || b.remote_cursors().len() == 1).await;

    assert!(alice.close(&room));

    eventually("alice's cursor to disappear", || {
        b.session().awareness(|store| store.remote_count()) == 0
    })
    .await;
    assert!(b.remote_cursors().is_empty());
}

#[tokio::test]
async fn test_late_joiner_sees_existing_cursor() {
    let relay = start_relay().await;
    let alice = client(&relay, "alice").await;
    let room = summary_table();

    let a = EditorAdapter::new(alice.open(&room), "<p>Shared text</p>", |_| {}).unwrap();
    members(&relay, &room, 1).await;
    a.set_selection(3, 7);
    a.flush();

    // Alice stays still from here on, so bob can only learn of the cursor
    // from the reply to bob's own arrival.
    let bob = client(&relay, "bob").await;
    let b = EditorAdapter::new(bob.open(&room), "", |_| {}).unwrap();

    eventually("bob to see alice's existing selection", || {
        b.remote_cursors()
            .iter()
            .any(|c| c.user_name == "alice" && (c.anchor, c.head) == (3, 7))
    })
    .await;
    eventually("alice to see bob", || a.session().awareness(|s| s.remote_count()) == 1).await;
}

#[tokio::test]
async fn test_still_peer_survives_idle_sweep() {
    let relay = start_relay().await;
    let config = AwarenessConfig {
        idle_timeout: Duration::from_millis(400),
        renew_interval: Duration::from_millis(100),
        ..AwarenessConfig::default()
    };
    let alice = client_with_awareness(&relay, "alice", config).await;
    let bob = client_with_awareness(&relay, "bob", config).await;
    let room = summary_table();

    let a = EditorAdapter::new(alice.open(&room), "<p>Body</p>", |_| {}).unwrap();
    let b = EditorAdapter::new(bob.open(&room), "", |_| {}).unwrap();
    members(&relay, &room, 2).await;

    a.set_selection(1, 1);
    a.flush();
    eventually("bob to see alice's caret", || b.remote_cursors().len() == 1).await;

    // Several idle timeouts pass without a selection change on either side.
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(bob.sweep_idle_awareness(), 0);
    assert_eq!(b.remote_cursors().len(), 1);
    assert_eq!(a.session().awareness(|s| s.remote_count()), 1);
}
