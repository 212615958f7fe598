//! Transport bridge: one authenticated WebSocket per client, shared by every
//! room the client has open.
//!
//! Provides:
//! - Connection lifecycle (connect, bounded reconnect with backoff, close)
//! - Room membership that survives reconnects (rooms are re-joined and the
//!   room-joined hooks fire again so sessions can resynchronise)
//! - Fire-and-forget sends of document, awareness and sync frames
//! - Inbound dispatch to registered handlers, per message category
//!
//! Frames sent while the socket is down are dropped, not queued. Lost
//! document updates are recovered by the state-vector handshake that runs
//! after every (re)join. While connected, membership, sync and document
//! frames are always written; only awareness frames, which the next update
//! supersedes, are dropped when the writer falls behind.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::{Credentials, TransportConfig};
use crate::error::TransportError;
use crate::locks::{lock, read, write};
use crate::protocol::{AwarenessEntry, WireMessage};
use crate::room::RoomId;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state, observable for a passive "reconnecting" indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `connect()` has not been called yet.
    Idle,
    Connecting,
    Connected,
    /// The socket is down and attempt `attempt` is pending.
    Reconnecting { attempt: u32 },
    /// Gave up after the configured number of attempts.
    Disconnected,
    /// The server refused the credentials. Never retried.
    Rejected,
    /// Closed deliberately with [`TransportBridge::close`].
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// No further connection attempts will be made without a new `connect()`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Rejected | Self::Closed)
    }
}

/// Identifies a registered handler for [`TransportBridge::remove_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type PayloadHandler = Arc<dyn Fn(&RoomId, &[u8]) + Send + Sync>;
type AwarenessHandler = Arc<dyn Fn(&RoomId, &[AwarenessEntry]) + Send + Sync>;
type RoomHandler = Arc<dyn Fn(&RoomId) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    document: Vec<(HandlerId, PayloadHandler)>,
    awareness: Vec<(HandlerId, AwarenessHandler)>,
    sync: Vec<(HandlerId, PayloadHandler)>,
    room_joined: Vec<(HandlerId, RoomHandler)>,
}

impl Handlers {
    fn len(&self) -> usize {
        self.document.len() + self.awareness.len() + self.sync.len() + self.room_joined.len()
    }

    fn remove(&mut self, id: HandlerId) {
        self.document.retain(|(h, _)| *h != id);
        self.awareness.retain(|(h, _)| *h != id);
        self.sync.retain(|(h, _)| *h != id);
        self.room_joined.retain(|(h, _)| *h != id);
    }
}

fn handlers_of<H: Clone>(list: &[(HandlerId, H)]) -> Vec<H> {
    list.iter().map(|(_, h)| h.clone()).collect()
}

enum ConnectionEnd {
    /// The socket failed or the server went away.
    Dropped,
    /// `close()` was called.
    Closed,
}

/// Writer queues of the live socket.
struct Outgoing {
    reliable: mpsc::UnboundedSender<Vec<u8>>,
    /// Bounded by `outgoing_buffer`.
    presence: mpsc::Sender<Vec<u8>>,
}

fn is_auth_rejection(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

/// The single WebSocket connection of a client.
pub struct TransportBridge {
    config: TransportConfig,
    credentials: Credentials,
    state: watch::Sender<ConnectionState>,
    /// Writer queues of the live socket; `None` while disconnected.
    outgoing: Mutex<Option<Outgoing>>,
    rooms: Mutex<BTreeSet<RoomId>>,
    handlers: RwLock<Handlers>,
    next_handler: AtomicU64,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown: Notify,
    closed: AtomicBool,
}

impl TransportBridge {
    pub fn new(config: TransportConfig, credentials: Credentials) -> Arc<Self> {
        Arc::new(Self {
            config,
            credentials,
            state: watch::Sender::new(ConnectionState::Idle),
            outgoing: Mutex::new(None),
            rooms: Mutex::new(BTreeSet::new()),
            handlers: RwLock::new(Handlers::default()),
            next_handler: AtomicU64::new(0),
            supervisor: Mutex::new(None),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn user_id(&self) -> &str {
        &self.credentials.user_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that changes whenever the connection state does.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    // ─── Lifecycle ────────────────────────────────────────────────

    /// Establish the connection.
    ///
    /// Idempotent: the first call starts the background supervisor, later
    /// calls just wait for the outcome. Resolves once connected, or with the
    /// terminal error if the server rejects the credentials or every retry
    /// fails. After a terminal failure, calling `connect()` again starts a
    /// fresh round of attempts.
    pub async fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut state_rx = self.state.subscribe();
        {
            let mut supervisor = lock(&self.supervisor);
            let running = supervisor.as_ref().is_some_and(|h| !h.is_finished());
            if !running {
                log::info!("Connecting to {} as {}", self.config.url, self.credentials.user_id);
                self.set_state(ConnectionState::Connecting);
                let bridge = Arc::clone(self);
                *supervisor = Some(tokio::spawn(bridge.supervise()));
            }
        }

        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Rejected => return Err(TransportError::Unauthorized),
                ConnectionState::Disconnected => {
                    return Err(TransportError::RetriesExhausted {
                        attempts: self.max_attempts(),
                    })
                }
                ConnectionState::Closed => return Err(TransportError::Closed),
                ConnectionState::Idle
                | ConnectionState::Connecting
                | ConnectionState::Reconnecting { .. } => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(TransportError::Closed);
            }
        }
    }

    /// End the session deliberately. No reconnect follows.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Closing transport to {}", self.config.url);
        let running = lock(&self.supervisor).as_ref().is_some_and(|h| !h.is_finished());
        if running {
            self.shutdown.notify_one();
        } else {
            self.set_state(ConnectionState::Closed);
        }
    }

    fn max_attempts(&self) -> u32 {
        self.config.reconnect_attempts.max(1)
    }

    async fn supervise(self: Arc<Self>) {
        let mut failures: u32 = 0;

        loop {
            let attempt = tokio::select! {
                result = self.open_socket() => result,
                _ = self.shutdown.notified() => {
                    self.set_state(ConnectionState::Closed);
                    return;
                }
            };

            match attempt {
                Ok(socket) => {
                    failures = 0;
                    log::info!("Connected to {}", self.config.url);
                    match self.run_connection(socket).await {
                        ConnectionEnd::Closed => {
                            self.set_state(ConnectionState::Closed);
                            return;
                        }
                        ConnectionEnd::Dropped => {
                            log::warn!("Connection to {} lost, reconnecting", self.config.url);
                            self.set_state(ConnectionState::Reconnecting { attempt: 1 });
                        }
                    }
                }
                Err(TransportError::Unauthorized) => {
                    log::error!("{} rejected the session credentials", self.config.url);
                    self.set_state(ConnectionState::Rejected);
                    return;
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.max_attempts() {
                        log::error!(
                            "Giving up on {} after {failures} failed attempts: {e}",
                            self.config.url
                        );
                        self.set_state(ConnectionState::Disconnected);
                        return;
                    }

                    let delay = self.config.backoff_delay(failures - 1);
                    log::warn!(
                        "Connection attempt {failures} to {} failed: {e}; retrying in {delay:?}",
                        self.config.url
                    );
                    self.set_state(ConnectionState::Reconnecting { attempt: failures + 1 });

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.notified() => {
                            self.set_state(ConnectionState::Closed);
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn open_socket(&self) -> Result<Socket, TransportError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&self.credentials.bearer())
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let handshake = tokio_tungstenite::connect_async(request);
        match tokio::time::timeout(self.config.connect_timeout, handshake).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(WsError::Http(response))) if is_auth_rejection(response.status()) => {
                Err(TransportError::Unauthorized)
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn run_connection(&self, socket: Socket) -> ConnectionEnd {
        let (mut writer, mut reader) = socket.split();

        let (reliable_tx, mut reliable_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (presence_tx, mut presence_rx) =
            mpsc::channel::<Vec<u8>>(self.config.outgoing_buffer.max(1));
        *lock(&self.outgoing) = Some(Outgoing {
            reliable: reliable_tx,
            presence: presence_tx,
        });
        self.set_state(ConnectionState::Connected);
        self.rejoin_rooms();

        let mut heartbeat =
            tokio::time::interval(self.config.heartbeat_interval.max(Duration::from_millis(10)));
        heartbeat.tick().await;

        let end = loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    let _ = writer.send(Message::Close(None)).await;
                    break ConnectionEnd::Closed;
                }
                frame = reliable_rx.recv() => {
                    let Some(bytes) = frame else { break ConnectionEnd::Dropped };
                    if let Err(e) = writer.send(Message::Binary(bytes.into())).await {
                        log::warn!("WebSocket write failed: {e}");
                        break ConnectionEnd::Dropped;
                    }
                }
                Some(bytes) = presence_rx.recv() => {
                    if let Err(e) = writer.send(Message::Binary(bytes.into())).await {
                        log::warn!("WebSocket write failed: {e}");
                        break ConnectionEnd::Dropped;
                    }
                }
                incoming = reader.next() => match incoming {
                    Some(Ok(Message::Binary(data))) => self.dispatch(&data),
                    Some(Ok(Message::Close(_))) | None => break ConnectionEnd::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("WebSocket read failed: {e}");
                        break ConnectionEnd::Dropped;
                    }
                },
                _ = heartbeat.tick() => {
                    if let Ok(ping) = WireMessage::Ping.encode() {
                        if writer.send(Message::Binary(ping.into())).await.is_err() {
                            break ConnectionEnd::Dropped;
                        }
                    }
                }
            }
        };

        *lock(&self.outgoing) = None;
        end
    }

    fn dispatch(&self, data: &[u8]) {
        let message = match WireMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping undecodable frame ({} bytes): {e}", data.len());
                return;
            }
        };
        log::trace!("Received {}", message.event_name());

        match message {
            WireMessage::DocUpdate { room, update } => {
                let handlers = handlers_of(&read(&self.handlers).document);
                for handler in handlers {
                    handler(&room, &update);
                }
            }
            WireMessage::AwarenessUpdate { room, states } => {
                let handlers = handlers_of(&read(&self.handlers).awareness);
                for handler in handlers {
                    handler(&room, &states);
                }
            }
            WireMessage::SyncRequest { room, state_vector } => {
                let handlers = handlers_of(&read(&self.handlers).sync);
                for handler in handlers {
                    handler(&room, &state_vector);
                }
            }
            WireMessage::Ping => {
                self.send_frame(&WireMessage::Pong);
            }
            WireMessage::Pong => {}
            other @ (WireMessage::JoinRoom { .. } | WireMessage::LeaveRoom { .. }) => {
                log::debug!("Ignoring {} from server", other.event_name());
            }
        }
    }

    // ─── Rooms ────────────────────────────────────────────────────

    /// Add a room to this connection. Returns `false` if already joined.
    ///
    /// While disconnected the join is recorded and sent on (re)connect.
    pub fn join_room(&self, room: &RoomId) -> bool {
        if !lock(&self.rooms).insert(room.clone()) {
            return false;
        }
        log::info!("Joining room {room}");
        if self.send_frame(&WireMessage::join_room(room, &self.credentials.user_id)) {
            self.fire_room_joined(room);
        }
        true
    }

    /// Remove a room from this connection. Returns `false` if not joined.
    pub fn leave_room(&self, room: &RoomId) -> bool {
        if !lock(&self.rooms).remove(room) {
            return false;
        }
        log::info!("Leaving room {room}");
        self.send_frame(&WireMessage::leave_room(room, &self.credentials.user_id));
        true
    }

    pub fn is_joined(&self, room: &RoomId) -> bool {
        lock(&self.rooms).contains(room)
    }

    pub fn joined_rooms(&self) -> Vec<RoomId> {
        lock(&self.rooms).iter().cloned().collect()
    }

    fn rejoin_rooms(&self) {
        let rooms = self.joined_rooms();
        for room in &rooms {
            self.send_frame(&WireMessage::join_room(room, &self.credentials.user_id));
        }
        if !rooms.is_empty() {
            log::info!("Rejoined {} rooms", rooms.len());
        }
        for room in &rooms {
            self.fire_room_joined(room);
        }
    }

    fn fire_room_joined(&self, room: &RoomId) {
        let handlers = handlers_of(&read(&self.handlers).room_joined);
        for handler in handlers {
            handler(room);
        }
    }

    // ─── Sending ──────────────────────────────────────────────────

    /// Hand a frame to the socket writer. Returns `false` if it was dropped.
    ///
    /// Awareness goes through the bounded queue and is dropped when it is
    /// full; every other frame is queued without limit.
    fn send_frame(&self, message: &WireMessage) -> bool {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to encode {}: {e}", message.event_name());
                return false;
            }
        };

        let outgoing = lock(&self.outgoing);
        let Some(tx) = outgoing.as_ref() else {
            log::debug!("Not connected, dropping {}", message.event_name());
            return false;
        };
        if !matches!(message, WireMessage::AwarenessUpdate { .. }) {
            return tx.reliable.send(bytes).is_ok();
        }
        match tx.presence.try_send(bytes) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("Awareness buffer full, dropping {}", message.event_name());
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn send_to_room(&self, room: &RoomId, message: WireMessage) -> bool {
        if !self.is_joined(room) {
            log::debug!("Not in room {room}, dropping {}", message.event_name());
            return false;
        }
        self.send_frame(&message)
    }

    pub fn send_document_update(&self, room: &RoomId, update: &[u8]) -> bool {
        self.send_to_room(room, WireMessage::doc_update(room, update))
    }

    pub fn send_awareness_update(&self, room: &RoomId, states: Vec<AwarenessEntry>) -> bool {
        self.send_to_room(room, WireMessage::awareness_update(room, states))
    }

    pub fn send_sync_request(&self, room: &RoomId, state_vector: &[u8]) -> bool {
        self.send_to_room(room, WireMessage::sync_request(room, state_vector))
    }

    // ─── Handlers ─────────────────────────────────────────────────

    fn next_handler_id(&self) -> HandlerId {
        HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on_document_update<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&RoomId, &[u8]) + Send + Sync + 'static,
    {
        let id = self.next_handler_id();
        write(&self.handlers).document.push((id, Arc::new(handler)));
        id
    }

    pub fn on_awareness_update<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&RoomId, &[AwarenessEntry]) + Send + Sync + 'static,
    {
        let id = self.next_handler_id();
        write(&self.handlers).awareness.push((id, Arc::new(handler)));
        id
    }

    pub fn on_sync_request<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&RoomId, &[u8]) + Send + Sync + 'static,
    {
        let id = self.next_handler_id();
        write(&self.handlers).sync.push((id, Arc::new(handler)));
        id
    }

    /// Called after every successful join, including re-joins after a
    /// reconnect.
    pub fn on_room_joined<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&RoomId) + Send + Sync + 'static,
    {
        let id = self.next_handler_id();
        write(&self.handlers).room_joined.push((id, Arc::new(handler)));
        id
    }

    /// Unregister a handler. Returns whether it was registered.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = write(&self.handlers);
        let before = handlers.len();
        handlers.remove(id);
        handlers.len() != before
    }
}
