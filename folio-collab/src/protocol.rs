//! Wire protocol between the transport bridge and the room relay.
//!
//! Every frame is one bincode-encoded [`WireMessage`] carried in a binary
//! WebSocket message:
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ variant tag  │ fields (room name, user id, payload bytes…)  │
//! │ varint       │ varint-length-prefixed                       │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Document payloads are opaque Update Deltas / state vectors produced by
//! the replica; the relay never interprets them.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::awareness::AwarenessState;
use crate::room::RoomId;

/// Upper bound on a decoded frame; larger length prefixes are rejected
/// before any allocation happens.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// One client's entry in an awareness update.
///
/// `state: None` announces that the client left the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: Uuid,
    pub clock: u64,
    pub state: Option<AwarenessState>,
}

/// Messages exchanged over the WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Subscribe the connection to a room.
    JoinRoom { room_name: RoomId, user_id: String },
    /// Unsubscribe the connection from a room.
    LeaveRoom { room_name: RoomId, user_id: String },
    /// Update Delta for the room's replica.
    DocUpdate { room: RoomId, update: Vec<u8> },
    /// Ephemeral presence, never merged into the replica.
    AwarenessUpdate { room: RoomId, states: Vec<AwarenessEntry> },
    /// State vector of the sender; members answer with the missing delta.
    SyncRequest { room: RoomId, state_vector: Vec<u8> },
    /// Keepalive
    Ping,
    Pong,
}

impl WireMessage {
    pub fn join_room(room: &RoomId, user_id: &str) -> Self {
        Self::JoinRoom {
            room_name: room.clone(),
            user_id: user_id.to_string(),
        }
    }

    pub fn leave_room(room: &RoomId, user_id: &str) -> Self {
        Self::LeaveRoom {
            room_name: room.clone(),
            user_id: user_id.to_string(),
        }
    }

    pub fn doc_update(room: &RoomId, update: &[u8]) -> Self {
        Self::DocUpdate {
            room: room.clone(),
            update: update.to_vec(),
        }
    }

    pub fn awareness_update(room: &RoomId, states: Vec<AwarenessEntry>) -> Self {
        Self::AwarenessUpdate {
            room: room.clone(),
            states,
        }
    }

    pub fn sync_request(room: &RoomId, state_vector: &[u8]) -> Self {
        Self::SyncRequest {
            room: room.clone(),
            state_vector: state_vector.to_vec(),
        }
    }

    /// Event name used in logs and by peers that speak the named-event
    /// dialect of this protocol.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom { .. } => "leave-room",
            Self::DocUpdate { .. } => "doc-update",
            Self::AwarenessUpdate { .. } => "awareness-update",
            Self::SyncRequest { .. } => "sync-request",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Room this message is addressed to, if any.
    pub fn room(&self) -> Option<&RoomId> {
        match self {
            Self::JoinRoom { room_name, .. } | Self::LeaveRoom { room_name, .. } => Some(room_name),
            Self::DocUpdate { room, .. }
            | Self::AwarenessUpdate { room, .. }
            | Self::SyncRequest { room, .. } => Some(room),
            Self::Ping | Self::Pong => None,
        }
    }

    /// Whether the relay should fan this message out to the other members
    /// of its room.
    pub fn is_room_traffic(&self) -> bool {
        matches!(
            self,
            Self::DocUpdate { .. } | Self::AwarenessUpdate { .. } | Self::SyncRequest { .. }
        )
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, wire_config())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, read) = bincode::serde::decode_from_slice(bytes, wire_config())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::TrailingBytes(bytes.len() - read));
        }
        Ok(msg)
    }
}

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_FRAME_BYTES>()
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::CursorRange;

    fn room() -> RoomId {
        RoomId::for_section("doc123", "summary_table").unwrap()
    }

    #[test]
    fn test_doc_update_roundtrip() {
        let msg = WireMessage::doc_update(&room(), &[1, 2, 3, 4, 5]);
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(decoded.event_name(), "doc-update");
        assert_eq!(decoded.room(), Some(&room()));
    }

    #[test]
    fn test_awareness_roundtrip_with_leave_entry() {
        let here = AwarenessEntry {
            client_id: Uuid::new_v4(),
            clock: 7,
            state: Some(AwarenessState {
                user_name: "Ana".into(),
                color: "#3366ff".into(),
                cursor: Some(CursorRange { anchor: 4, head: 9 }),
            }),
        };
        let gone = AwarenessEntry {
            client_id: Uuid::new_v4(),
            clock: 3,
            state: None,
        };
        let msg = WireMessage::awareness_update(&room(), vec![here, gone]);
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();

        match decoded {
            WireMessage::AwarenessUpdate { states, .. } => {
                assert_eq!(states.len(), 2);
                assert_eq!(states[0].clock, 7);
                assert!(states[1].state.is_none());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_event_names() {
        assert_eq!(WireMessage::join_room(&room(), "u1").event_name(), "join-room");
        assert_eq!(WireMessage::leave_room(&room(), "u1").event_name(), "leave-room");
        assert_eq!(WireMessage::sync_request(&room(), &[0]).event_name(), "sync-request");
        assert_eq!(
            WireMessage::awareness_update(&room(), Vec::new()).event_name(),
            "awareness-update"
        );
        assert_eq!(WireMessage::Ping.event_name(), "ping");
        assert!(WireMessage::Ping.room().is_none());
    }

    #[test]
    fn test_room_traffic_classification() {
        assert!(WireMessage::doc_update(&room(), &[]).is_room_traffic());
        assert!(WireMessage::sync_request(&room(), &[]).is_room_traffic());
        assert!(!WireMessage::join_room(&room(), "u1").is_room_traffic());
        assert!(!WireMessage::Pong.is_room_traffic());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(WireMessage::decode(&[0xFF, 0xFF, 0xFF]).is_err());
        assert!(WireMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_length_prefix() {
        // DocUpdate tag, then a room name whose u64 length prefix claims 2^56 bytes.
        let bytes = [2u8, 253, 0, 0, 0, 0, 0, 0, 0, 0x01];
        assert!(matches!(
            WireMessage::decode(&bytes),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = WireMessage::Ping.encode().unwrap();
        bytes.push(0);
        assert_eq!(WireMessage::decode(&bytes), Err(ProtocolError::TrailingBytes(1)));
    }
}
