//! # folio-collab: real-time collaborative section editing
//!
//! Keeps every open tab's copy of a document section convergent using a
//! CRDT replica per room, synchronised over one WebSocket per client.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  TreeMutation   ┌──────────────────┐  ReplicaEvent  ┌────────────────────┐
//! │ EditorAdapter │ ──────────────► │ DocumentReplica  │ ─────────────► │ RoomSession        │
//! │ (per editor)  │ ◄── on_change ─ │ (yrs Doc / room) │                │ (+ AwarenessStore) │
//! └───────────────┘                 └──────────────────┘                └─────────┬──────────┘
//!                                                                                 │
//!                                                       RoomSessionManager routes │ RoomId
//!                                                                                 ▼
//!                                  WebSocket, binary frames             ┌────────────────────┐
//!            ┌─────────────┐ ◄────────────────────────────────────────► │ TransportBridge    │
//!            │ RelayServer │     join / doc-update / awareness /        │ (one per client)   │
//!            │ (fan-out)   │     sync-request                           └────────────────────┘
//!            └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`room`]: Deterministic room names per document section
//! - [`replica`]: CRDT document replica with local/remote update events
//! - [`html`]: HTML codec for the editor seam
//! - [`awareness`]: Ephemeral cursor and presence state
//! - [`protocol`]: Binary wire protocol (bincode-encoded `WireMessage`)
//! - [`transport`]: Authenticated, reconnecting WebSocket bridge
//! - [`session`]: Room session manager and sync handshake
//! - [`editor`]: Editor integration adapter
//! - [`broadcast`] / [`relay`]: Reference room relay

pub mod awareness;
pub mod broadcast;
pub mod config;
pub mod editor;
pub mod error;
pub mod html;
mod locks;
pub mod protocol;
pub mod relay;
pub mod replica;
pub mod room;
pub mod session;
pub mod transport;
mod validate;

// Re-exports for convenience
pub use awareness::{color_for, AwarenessState, AwarenessStore, CursorRange, RemotePresence};
pub use broadcast::{BroadcastGroup, BroadcastStats, RelayFrame, RoomManager};
pub use config::{AwarenessConfig, Credentials, RelayConfig, TransportConfig};
pub use editor::{CursorDecoration, EditorAdapter};
pub use error::{CollabError, TransportError};
pub use html::HtmlNode;
pub use protocol::{AwarenessEntry, ProtocolError, WireMessage};
pub use relay::{RelayHandle, RelayServer, RelayStats};
pub use replica::{DocumentReplica, Mark, Origin, ReplicaEvent, ReplicaSubscription, TreeMutation};
pub use room::RoomId;
pub use session::{RoomSession, RoomSessionManager};
pub use transport::{ConnectionState, HandlerId, TransportBridge};
