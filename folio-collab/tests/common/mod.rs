//! Shared fixtures: a relay on a free port and clients connected to it.

#![allow(dead_code)]

use std::sync::Arc;

use folio_collab::{
    AwarenessConfig, ConnectionState, Credentials, RelayConfig, RelayHandle, RelayServer, RoomId, RoomSessionManager,
    TransportBridge, TransportConfig, TreeMutation,
};
use tokio::time::{sleep, timeout, Duration};

pub const TOKEN: &str = "secret";

/// Start a relay on a free port that requires [`TOKEN`].
pub async fn start_relay() -> RelayHandle {
    let config = RelayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        auth_token: Some(TOKEN.to_string()),
        broadcast_capacity: 64,
        connection_buffer: 64,
    };
    RelayServer::new(config).bind().await.expect("relay should bind")
}

/// Short delays and plenty of attempts, so a test can keep a client in
/// `Reconnecting` for a while and still see it come back.
pub fn fast_config(url: String) -> TransportConfig {
    TransportConfig {
        reconnect_attempts: 500,
        reconnect_delay: Duration::from_millis(20),
        backoff_factor: 1,
        max_reconnect_delay: Duration::from_millis(20),
        connect_timeout: Duration::from_secs(2),
        ..TransportConfig::new(url)
    }
}

pub fn bridge(relay: &RelayHandle, user: &str, token: &str) -> Arc<TransportBridge> {
    TransportBridge::new(fast_config(relay.url()), Credentials::new(user, token))
}

/// A connected client with its session manager.
pub async fn client(relay: &RelayHandle, user: &str) -> RoomSessionManager {
    let bridge = bridge(relay, user, TOKEN);
    bridge.connect().await.expect("client should connect");
    RoomSessionManager::new(bridge)
}

/// A connected client whose awareness uses `config`.
pub async fn client_with_awareness(
    relay: &RelayHandle,
    user: &str,
    config: AwarenessConfig,
) -> RoomSessionManager {
    let bridge = bridge(relay, user, TOKEN);
    bridge.connect().await.expect("client should connect");
    RoomSessionManager::with_awareness_config(bridge, config)
}

pub fn summary_table() -> RoomId {
    RoomId::for_section("doc123", "summary_table").expect("valid room")
}

/// Mutations creating `<p>{text}</p>` as the first block.
pub fn paragraph(text: &str) -> Vec<TreeMutation> {
    vec![
        TreeMutation::InsertElement {
            parent: vec![],
            index: 0,
            tag: "p".into(),
        },
        TreeMutation::InsertText {
            parent: vec![0],
            index: 0,
            text: text.into(),
            marks: vec![],
        },
    ]
}

/// Insert `insert` at byte `index` of the first block's text run.
pub fn type_into_first(index: u32, insert: &str) -> Vec<TreeMutation> {
    vec![TreeMutation::EditText {
        text: vec![0, 0],
        index,
        insert: insert.into(),
        marks: vec![],
    }]
}

/// Poll `check` until it holds, failing the test after ten seconds.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let waited = timeout(Duration::from_secs(10), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

pub async fn members(relay: &RelayHandle, room: &RoomId, count: usize) {
    let waited = timeout(Duration::from_secs(10), async {
        while relay.room_members(room).await.len() < count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {count} members in {room}");
}

pub async fn state(bridge: &TransportBridge, wanted: fn(ConnectionState) -> bool) {
    let mut states = bridge.watch_state();
    let waited = timeout(Duration::from_secs(10), async {
        loop {
            if wanted(*states.borrow_and_update()) {
                return;
            }
            if states.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for connection state, last {:?}", bridge.state());
}
