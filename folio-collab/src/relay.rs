//! Reference WebSocket relay with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── forwarder(room X) ──► Client B
//!             ├── RoomManager ── BroadcastGroup(room X)
//! Client B ──┘        │             └── forwarder(room X) ──► Client A (own frames skipped)
//!                     └── BroadcastGroup(room Y) ── ...
//! ```
//!
//! The relay holds no document state. It forwards `doc-update`,
//! `awareness-update` and `sync-request` frames to every other member of
//! the room they name; catching up is negotiated between the clients with
//! the sync handshake. One connection may be a member of many rooms.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomManager};
use crate::config::RelayConfig;
use crate::error::TransportError;
use crate::protocol::WireMessage;
use crate::room::RoomId;

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Upgrades refused for bad credentials or while not admitting.
    pub rejected_handshakes: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    /// Frames that did not decode or named a room the sender is not in.
    pub dropped_frames: u64,
    pub active_rooms: usize,
}

struct Connection {
    /// Set by the first `join-room`.
    user_id: Option<String>,
    kick: Arc<Notify>,
}

/// State shared by the accept loop, every connection task and the handle.
struct Shared {
    config: RelayConfig,
    rooms: RoomManager,
    connections: RwLock<HashMap<Uuid, Connection>>,
    stats: RwLock<RelayStats>,
    admitting: AtomicBool,
    shutdown: Notify,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the listener and start accepting in the background.
    pub async fn bind(self) -> Result<RelayHandle, TransportError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        log::info!("Relay listening on {addr}");

        let shared = Arc::new(Shared {
            rooms: RoomManager::new(self.config.broadcast_capacity),
            config: self.config,
            connections: RwLock::new(HashMap::new()),
            stats: RwLock::new(RelayStats::default()),
            admitting: AtomicBool::new(true),
            shutdown: Notify::new(),
        });

        let task = tokio::spawn(accept_loop(listener, shared.clone()));
        Ok(RelayHandle { addr, shared, task })
    }
}

/// Control handle for a running relay.
pub struct RelayHandle {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` URL clients connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.active_rooms = self.shared.rooms.room_count().await;
        stats
    }

    /// Users currently in `room`, one entry per connection.
    pub async fn room_members(&self, room: &RoomId) -> Vec<String> {
        match self.shared.rooms.get(room).await {
            Some(group) => group.users().await,
            None => Vec::new(),
        }
    }

    /// Close every connection that joined as `user_id`. Returns how many.
    pub async fn drop_user(&self, user_id: &str) -> usize {
        let connections = self.shared.connections.read().await;
        let mut dropped = 0;
        for connection in connections.values() {
            if connection.user_id.as_deref() == Some(user_id) {
                connection.kick.notify_one();
                dropped += 1;
            }
        }
        log::info!("Dropping {dropped} connections of {user_id}");
        dropped
    }

    /// While `false`, upgrades are refused with 503 so clients keep retrying.
    pub fn set_admitting(&self, admitting: bool) {
        self.shared.admitting.store(admitting, Ordering::SeqCst);
    }

    /// Stop accepting, close every connection and wait for the accept loop.
    pub async fn shutdown(self) {
        self.shared.shutdown.notify_one();
        for connection in self.shared.connections.read().await.values() {
            connection.kick.notify_one();
        }
        if let Err(e) = self.task.await {
            log::error!("Relay accept loop failed: {e}");
        }
        log::info!("Relay on {} shut down", self.addr);
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shared.shutdown.notified() => break,
        };

        let (stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("Accept failed: {e}");
                continue;
            }
        };
        log::debug!("New TCP connection from {addr}");

        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, shared).await {
                log::debug!("Connection from {addr} ended with error: {e}");
            }
        });
    }
}

fn refuse(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Check the upgrade request before the WebSocket is established.
fn admit(shared: &Shared, request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if !shared.admitting.load(Ordering::SeqCst) {
        return Err(refuse(StatusCode::SERVICE_UNAVAILABLE, "not admitting connections"));
    }
    if let Some(token) = &shared.config.auth_token {
        let presented = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(token.as_str()) {
            return Err(refuse(StatusCode::UNAUTHORIZED, "invalid credentials"));
        }
    }
    Ok(response)
}

/// Rooms this connection has joined, with the task forwarding each room's
/// traffic into the connection's outgoing queue.
struct Memberships {
    conn_id: Uuid,
    outgoing: mpsc::Sender<Arc<Vec<u8>>>,
    forwarders: HashMap<RoomId, (Arc<BroadcastGroup>, JoinHandle<()>)>,
}

impl Memberships {
    async fn join(&mut self, rooms: &RoomManager, room: &RoomId, user_id: &str) {
        if self.forwarders.contains_key(room) {
            return;
        }
        let group = rooms.get_or_create(room).await;
        let rx = group.add_peer(self.conn_id, user_id).await;
        let forwarder = tokio::spawn(forward(
            self.conn_id,
            rx,
            self.outgoing.clone(),
            group.clone(),
        ));
        self.forwarders.insert(room.clone(), (group, forwarder));
        log::info!("{user_id} joined room {room}");
    }

    async fn leave(&mut self, rooms: &RoomManager, room: &RoomId) {
        if let Some((group, forwarder)) = self.forwarders.remove(room) {
            forwarder.abort();
            if let Some(user_id) = group.remove_peer(&self.conn_id).await {
                log::info!("{user_id} left room {room}");
            }
            rooms.remove_if_empty(room).await;
        }
    }

    async fn leave_all(&mut self, rooms: &RoomManager) {
        let joined: Vec<RoomId> = self.forwarders.keys().cloned().collect();
        for room in &joined {
            self.leave(rooms, room).await;
        }
    }

    fn group(&self, room: &RoomId) -> Option<&Arc<BroadcastGroup>> {
        self.forwarders.get(room).map(|(group, _)| group)
    }
}

/// Move one room's frames into a connection's queue, skipping the
/// connection's own frames. A slow connection holds its forwarders back;
/// frames are only lost once a room's broadcast channel overruns.
async fn forward(
    conn_id: Uuid,
    mut rx: broadcast::Receiver<crate::broadcast::RelayFrame>,
    outgoing: mpsc::Sender<Arc<Vec<u8>>>,
    group: Arc<BroadcastGroup>,
) {
    loop {
        match rx.recv().await {
            Ok(frame) if frame.origin == conn_id => {}
            Ok(frame) => {
                if outgoing.send(frame.payload).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Connection {conn_id} lagged by {n} frames");
                group.record_dropped(n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) -> Result<(), TransportError> {
    let handshake = {
        let shared = shared.clone();
        tokio_tungstenite::accept_hdr_async(stream, move |request: &Request, response: Response| {
            admit(&shared, request, response)
        })
        .await
    };
    let ws_stream = match handshake {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            shared.stats.write().await.rejected_handshakes += 1;
            log::info!("Refused connection from {addr}: {e}");
            return Err(e.into());
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let conn_id = Uuid::new_v4();
    let kick = Arc::new(Notify::new());
    shared.connections.write().await.insert(
        conn_id,
        Connection {
            user_id: None,
            kick: kick.clone(),
        },
    );
    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }
    log::info!("WebSocket connection {conn_id} established from {addr}");

    let (out_tx, mut out_rx) = mpsc::channel::<Arc<Vec<u8>>>(shared.config.connection_buffer.max(1));
    let mut memberships = Memberships {
        conn_id,
        outgoing: out_tx,
        forwarders: HashMap::new(),
    };

    let result = loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if let Some(reply) = relay_frame(&shared, &mut memberships, &data).await {
                        if let Err(e) = ws_sender.send(Message::Binary(reply.into())).await {
                            break Err(e.into());
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                        break Err(e.into());
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Connection {conn_id} closed by {addr}");
                    break Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("WebSocket error from {addr}: {e}");
                    break Err(e.into());
                }
            },

            frame = out_rx.recv() => {
                let Some(payload) = frame else { break Ok(()) };
                if let Err(e) = ws_sender.send(Message::Binary(payload.to_vec().into())).await {
                    break Err(e.into());
                }
            }

            _ = kick.notified() => {
                log::info!("Dropping connection {conn_id} from {addr}");
                let _ = ws_sender.send(Message::Close(None)).await;
                break Ok(());
            }
        }
    };

    // Cleanup: leave every room this connection was in
    memberships.leave_all(&shared.rooms).await;
    shared.connections.write().await.remove(&conn_id);
    shared.stats.write().await.active_connections -= 1;

    result
}

/// Route one inbound frame. Returns a frame to send straight back, if any.
async fn relay_frame(shared: &Shared, memberships: &mut Memberships, data: &[u8]) -> Option<Vec<u8>> {
    {
        let mut s = shared.stats.write().await;
        s.total_frames += 1;
        s.total_bytes += data.len() as u64;
    }

    let message = match WireMessage::decode(data) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("Dropping undecodable frame from {}: {e}", memberships.conn_id);
            shared.stats.write().await.dropped_frames += 1;
            return None;
        }
    };

    match message {
        WireMessage::JoinRoom { room_name, user_id } => {
            if let Some(connection) = shared.connections.write().await.get_mut(&memberships.conn_id) {
                connection.user_id.get_or_insert_with(|| user_id.clone());
            }
            memberships.join(&shared.rooms, &room_name, &user_id).await;
            None
        }
        WireMessage::LeaveRoom { room_name, .. } => {
            memberships.leave(&shared.rooms, &room_name).await;
            None
        }
        WireMessage::Ping => WireMessage::Pong.encode().ok(),
        WireMessage::Pong => None,
        room_traffic => {
            let room = room_traffic.room().filter(|_| room_traffic.is_room_traffic())?;
            match memberships.group(room) {
                Some(group) => {
                    let receivers = group.broadcast_raw(memberships.conn_id, Arc::new(data.to_vec()));
                    log::trace!(
                        "Relayed {} in {room} to {} members",
                        room_traffic.event_name(),
                        receivers.saturating_sub(1)
                    );
                }
                None => {
                    log::debug!(
                        "Dropping {} for {room}: connection {} has not joined it",
                        room_traffic.event_name(),
                        memberships.conn_id
                    );
                    shared.stats.write().await.dropped_frames += 1;
                }
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    fn local_config() -> RelayConfig {
        RelayConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..RelayConfig::default()
        }
    }

    fn room(section: &str) -> RoomId {
        RoomId::for_section("doc123", section).unwrap()
    }

    type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

    async fn raw_client(url: &str, token: Option<&str>) -> Result<Client, tokio_tungstenite::tungstenite::Error> {
        let mut request = url.into_client_request()?;
        if let Some(token) = token {
            let bearer = Credentials::new("x", token).bearer();
            request
                .headers_mut()
                .insert(AUTHORIZATION, HeaderValue::from_str(&bearer).unwrap());
        }
        tokio_tungstenite::connect_async(request).await.map(|(ws, _)| ws)
    }

    async fn send(client: &mut Client, message: &WireMessage) {
        client
            .send(Message::Binary(message.encode().unwrap().into()))
            .await
            .unwrap();
    }

    async fn recv(client: &mut Client) -> WireMessage {
        loop {
            let msg = timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for a frame")
                .unwrap()
                .unwrap();
            if let Message::Binary(data) = msg {
                return WireMessage::decode(&data).unwrap();
            }
        }
    }

    async fn wait_for_members(relay: &RelayHandle, room: &RoomId, count: usize) {
        timeout(Duration::from_secs(5), async {
            while relay.room_members(room).await.len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("members never joined");
    }

    #[tokio::test]
    async fn test_relays_to_others_not_sender() {
        let relay = RelayServer::new(local_config()).bind().await.unwrap();
        let r = room("intro");

        let mut alice = raw_client(&relay.url(), None).await.unwrap();
        let mut bob = raw_client(&relay.url(), None).await.unwrap();
        send(&mut alice, &WireMessage::join_room(&r, "alice")).await;
        send(&mut bob, &WireMessage::join_room(&r, "bob")).await;
        wait_for_members(&relay, &r, 2).await;

        send(&mut alice, &WireMessage::doc_update(&r, &[1, 2, 3])).await;
        assert_eq!(recv(&mut bob).await, WireMessage::doc_update(&r, &[1, 2, 3]));

        // Alice's next frame is the ping reply, not the update alice sent.
        send(&mut alice, &WireMessage::Ping).await;
        assert_eq!(recv(&mut alice).await, WireMessage::Pong);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_traffic_for_unjoined_room_is_dropped() {
        let relay = RelayServer::new(local_config()).bind().await.unwrap();
        let intro = room("intro");
        let outro = room("outro");

        let mut alice = raw_client(&relay.url(), None).await.unwrap();
        let mut bob = raw_client(&relay.url(), None).await.unwrap();
        send(&mut alice, &WireMessage::join_room(&intro, "alice")).await;
        send(&mut bob, &WireMessage::join_room(&intro, "bob")).await;
        wait_for_members(&relay, &intro, 2).await;

        send(&mut alice, &WireMessage::doc_update(&outro, &[7])).await;
        send(&mut alice, &WireMessage::doc_update(&intro, &[8])).await;

        assert_eq!(recv(&mut bob).await, WireMessage::doc_update(&intro, &[8]));
        assert_eq!(relay.stats().await.dropped_frames, 1);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejects_wrong_token() {
        let relay = RelayServer::new(RelayConfig {
            auth_token: Some("secret".to_string()),
            ..local_config()
        })
        .bind()
        .await
        .unwrap();

        match raw_client(&relay.url(), Some("wrong")).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::UNAUTHORIZED)
            }
            other => panic!("expected 401, got {:?}", other.map(|_| ())),
        }
        assert!(raw_client(&relay.url(), Some("secret")).await.is_ok());

        timeout(Duration::from_secs(5), async {
            while relay.stats().await.rejected_handshakes < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("rejection was never counted");
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_not_admitting_answers_503() {
        let relay = RelayServer::new(local_config()).bind().await.unwrap();
        relay.set_admitting(false);

        match raw_client(&relay.url(), None).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE)
            }
            other => panic!("expected 503, got {:?}", other.map(|_| ())),
        }

        relay.set_admitting(true);
        assert!(raw_client(&relay.url(), None).await.is_ok());
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_user_closes_connection_and_leaves_rooms() {
        let relay = RelayServer::new(local_config()).bind().await.unwrap();
        let r = room("methods");

        let mut alice = raw_client(&relay.url(), None).await.unwrap();
        send(&mut alice, &WireMessage::join_room(&r, "alice")).await;
        wait_for_members(&relay, &r, 1).await;

        assert_eq!(relay.drop_user("alice").await, 1);

        let closed = timeout(Duration::from_secs(5), async {
            loop {
                match alice.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok());

        timeout(Duration::from_secs(5), async {
            while relay.stats().await.active_rooms > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("room was never cleaned up");
        relay.shutdown().await;
    }
}
