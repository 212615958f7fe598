//! Room sessions: one replica and one awareness set per open room, routed
//! over the shared transport bridge.
//!
//! ```text
//!                        ┌──────────────────────────────┐
//!  doc-update ──────────►│ RoomSessionManager routes    │──► RoomSession(room A) ── DocumentReplica
//!  awareness-update ────►│ RoomId → Arc<RoomSession>    │──► RoomSession(room B) ── DocumentReplica
//!  sync-request ────────►│ (the only inbound path)      │
//!  room joined ─────────►└──────────────────────────────┘
//! ```
//!
//! Sync handshake, run on every join and re-join:
//! 1. the session sends its state vector (`sync-request`) followed by its
//!    delete set (`doc-update`), since deletions never advance a state
//!    vector;
//! 2. each member answers with everything the requester lacks plus its own
//!    delete set (`doc-update`);
//! 3. a member that finds the requester ahead of it sends its own
//!    `sync-request` back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::awareness::AwarenessStore;
use crate::config::AwarenessConfig;
use crate::locks::{lock, read, write};
use crate::protocol::AwarenessEntry;
use crate::replica::{DocumentReplica, Origin, ReplicaSubscription};
use crate::room::RoomId;
use crate::transport::{HandlerId, TransportBridge};

/// Everything the client holds for one open room.
pub struct RoomSession {
    room: RoomId,
    replica: Arc<DocumentReplica>,
    awareness: Mutex<AwarenessStore>,
    bridge: Arc<TransportBridge>,
    /// Forwards local deltas to the bridge; taken on close.
    outbound: Mutex<Option<ReplicaSubscription>>,
    closed: AtomicBool,
}

impl RoomSession {
    fn new(room: RoomId, bridge: Arc<TransportBridge>, config: AwarenessConfig) -> Arc<Self> {
        let replica = DocumentReplica::new(room.clone());

        let outbound = {
            let bridge = bridge.clone();
            let room = room.clone();
            replica.observe(move |event| {
                if event.origin == Origin::Local {
                    bridge.send_document_update(&room, &event.delta);
                }
            })
        };

        Arc::new(Self {
            awareness: Mutex::new(AwarenessStore::new(bridge.user_id(), config)),
            room,
            replica,
            bridge,
            outbound: Mutex::new(Some(outbound)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn replica(&self) -> &Arc<DocumentReplica> {
        &self.replica
    }

    /// Run `f` against this room's awareness store.
    pub fn awareness<R>(&self, f: impl FnOnce(&mut AwarenessStore) -> R) -> R {
        f(&mut lock(&self.awareness))
    }

    /// Send awareness entries to the room. Dropped after close.
    pub fn broadcast_awareness(&self, entry: AwarenessEntry) -> bool {
        if self.is_closed() {
            return false;
        }
        self.bridge.send_awareness_update(&self.room, vec![entry])
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Step 1 of the handshake.
    pub fn request_sync(&self) -> bool {
        let state_vector = self.replica.state_vector();
        if !self.bridge.send_sync_request(&self.room, &state_vector) {
            return false;
        }
        match self.replica.diff_since(&state_vector) {
            Ok(deletions) => self.bridge.send_document_update(&self.room, &deletions),
            Err(e) => {
                log::warn!("{}: cannot encode delete set: {e}", self.room);
                false
            }
        }
    }

    fn handle_document_update(&self, update: &[u8]) {
        // Malformed deltas are already logged by the replica; the session
        // keeps running.
        let _ = self.replica.apply_remote_delta(update);
    }

    /// Merge remote presence. A client seen for the first time gets the
    /// local state in reply, since it joined after our last broadcast.
    fn handle_awareness(&self, states: &[AwarenessEntry]) {
        let greeting = {
            let mut awareness = lock(&self.awareness);
            let unknown: Vec<Uuid> = states
                .iter()
                .filter(|e| e.state.is_some() && awareness.get(&e.client_id).is_none())
                .map(|e| e.client_id)
                .collect();

            let changed = awareness.apply_remote(states);
            if !changed.is_empty() {
                log::trace!("{}: awareness changed for {} clients", self.room, changed.len());
            }

            let arrived = unknown.iter().any(|id| awareness.get(id).is_some());
            arrived.then(|| awareness.local_update())
        };

        if let Some(entry) = greeting {
            log::debug!("{}: greeting new awareness peer", self.room);
            self.broadcast_awareness(entry);
        }
    }

    /// Re-announce the local state and drop peers that went silent.
    fn renew_presence(&self) {
        let (renewal, gone) = {
            let mut awareness = lock(&self.awareness);
            (awareness.renew(), awareness.remove_idle())
        };
        if !gone.is_empty() {
            log::debug!("{}: {} awareness peers timed out", self.room, gone.len());
        }
        self.broadcast_awareness(renewal);
    }

    /// Steps 2 and 3 of the handshake.
    fn handle_sync_request(&self, state_vector: &[u8]) {
        // The diff always carries the full delete set, so it is sent even
        // when the requester has every insertion.
        match self.replica.diff_since(state_vector) {
            Ok(diff) => {
                log::debug!("{}: answering sync request with {} bytes", self.room, diff.len());
                self.bridge.send_document_update(&self.room, &diff);
            }
            Err(e) => {
                log::warn!("{}: ignoring sync request: {e}", self.room);
                return;
            }
        }

        if let Ok(true) = self.replica.is_behind(state_vector) {
            self.request_sync();
        }
    }

    /// Stop forwarding local changes and announce departure.
    fn shut_down(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.outbound).take();
        let leave = lock(&self.awareness).leave_update();
        self.bridge.send_awareness_update(&self.room, vec![leave]);
        lock(&self.awareness).clear_remote();
    }
}

type Routes = Arc<RwLock<HashMap<RoomId, Arc<RoomSession>>>>;

fn route(routes: &Routes, room: &RoomId) -> Option<Arc<RoomSession>> {
    read(routes).get(room).cloned()
}

/// Renew presence in every open room until the manager goes away.
async fn maintain_presence(routes: Weak<RwLock<HashMap<RoomId, Arc<RoomSession>>>>, every: Duration) {
    let mut ticks = tokio::time::interval(every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticks.tick().await;

    loop {
        ticks.tick().await;
        let Some(routes) = routes.upgrade() else {
            break;
        };
        let sessions: Vec<Arc<RoomSession>> = read(&routes).values().cloned().collect();
        drop(routes);
        for session in sessions {
            session.renew_presence();
        }
    }
}

/// Owns the routing table from room names to sessions.
pub struct RoomSessionManager {
    bridge: Arc<TransportBridge>,
    routes: Routes,
    awareness_config: AwarenessConfig,
    handlers: Vec<HandlerId>,
    /// Presence renewal; only runs when the manager is built inside a
    /// tokio runtime.
    renewal: Option<JoinHandle<()>>,
}

impl RoomSessionManager {
    pub fn new(bridge: Arc<TransportBridge>) -> Self {
        Self::with_awareness_config(bridge, AwarenessConfig::default())
    }

    pub fn with_awareness_config(bridge: Arc<TransportBridge>, awareness_config: AwarenessConfig) -> Self {
        let routes: Routes = Arc::new(RwLock::new(HashMap::new()));

        let handlers = vec![
            {
                let routes = routes.clone();
                bridge.on_document_update(move |room, update| match route(&routes, room) {
                    Some(session) => session.handle_document_update(update),
                    None => log::trace!("Dropping doc-update for unopened room {room}"),
                })
            },
            {
                let routes = routes.clone();
                bridge.on_awareness_update(move |room, states| {
                    if let Some(session) = route(&routes, room) {
                        session.handle_awareness(states);
                    }
                })
            },
            {
                let routes = routes.clone();
                bridge.on_sync_request(move |room, state_vector| {
                    if let Some(session) = route(&routes, room) {
                        session.handle_sync_request(state_vector);
                    }
                })
            },
            {
                let routes = routes.clone();
                bridge.on_room_joined(move |room| {
                    if let Some(session) = route(&routes, room) {
                        session.request_sync();
                        let presence = session.awareness(|a| a.local_update());
                        session.broadcast_awareness(presence);
                    }
                })
            },
        ];

        let renewal = match tokio::runtime::Handle::try_current() {
            Ok(runtime) if !awareness_config.renew_interval.is_zero() => Some(runtime.spawn(
                maintain_presence(Arc::downgrade(&routes), awareness_config.renew_interval),
            )),
            _ => None,
        };

        Self {
            bridge,
            routes,
            awareness_config,
            handlers,
            renewal,
        }
    }

    pub fn bridge(&self) -> &Arc<TransportBridge> {
        &self.bridge
    }

    /// Session for `room`, creating and joining it on first use.
    ///
    /// Every call for the same room returns the same instance, including
    /// concurrent calls.
    pub fn open(&self, room: &RoomId) -> Arc<RoomSession> {
        let (session, created) = {
            let mut routes = write(&self.routes);
            match routes.get(room) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let session = RoomSession::new(room.clone(), self.bridge.clone(), self.awareness_config);
                    routes.insert(room.clone(), session.clone());
                    (session, true)
                }
            }
        };

        // Joining may fire the room-joined hook, which reads the table, so
        // the write lock must be released first.
        if created {
            log::info!("Opened session for room {room}");
            self.bridge.join_room(room);
        }
        session
    }

    /// Session for `room` if it is open.
    pub fn get(&self, room: &RoomId) -> Option<Arc<RoomSession>> {
        route(&self.routes, room)
    }

    /// Close a room: unroute it, stop forwarding, announce departure and
    /// leave. Returns whether the room was open.
    pub fn close(&self, room: &RoomId) -> bool {
        let Some(session) = write(&self.routes).remove(room) else {
            return false;
        };
        session.shut_down();
        self.bridge.leave_room(room);
        log::info!("Closed session for room {room}");
        true
    }

    pub fn open_rooms(&self) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = read(&self.routes).keys().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Drop awareness entries that went silent, in every open room.
    pub fn sweep_idle_awareness(&self) -> usize {
        let sessions: Vec<Arc<RoomSession>> = read(&self.routes).values().cloned().collect();
        sessions
            .iter()
            .map(|s| s.awareness(|a| a.remove_idle().len()))
            .sum()
    }
}

impl Drop for RoomSessionManager {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
        for id in self.handlers.drain(..) {
            self.bridge.remove_handler(id);
        }
    }
}
