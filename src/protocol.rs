//! Binary wire protocol for document sync and presence relay.
//!
//! Every inbound or outbound message is a tagged envelope (bincode-encoded):
//! ```text
//! ┌──────────────┬───────────┬──────────┐
//! │ document_id  │ kind      │ payload  │
//! │ string       │ 1 byte    │ variable │
//! └──────────────┴───────────┴──────────┘
//! ```
//!
//! `Sync` payloads follow the state-vector/diff convention: a client (or the
//! session, on join) sends its state vector (`StateVector`), the other side
//! replies with the computed diff (`Diff`), and live edits travel as
//! incremental `Update` deltas. `Awareness` payloads carry a
//! [`PresenceDelta`] of added/updated/removed presence entries whose state
//! blobs are opaque to the core.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level message kinds carried by a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Document synchronization (state vector, diff, or update)
    Sync = 1,
    /// Ephemeral presence delta (cursors, selections)
    Awareness = 2,
}

/// The wire envelope: `[document_id][kind][payload]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub document_id: String,
    pub kind: MessageKind,
    /// Kind-specific payload (encoded [`SyncPayload`] or [`PresenceDelta`])
    pub payload: Vec<u8>,
}

impl Frame {
    /// Wrap a sync payload in an envelope for the given document.
    pub fn sync(document_id: impl Into<String>, payload: &SyncPayload) -> Result<Self, ProtocolError> {
        Ok(Self {
            document_id: document_id.into(),
            kind: MessageKind::Sync,
            payload: payload.encode()?,
        })
    }

    /// Wrap a presence delta in an envelope for the given document.
    pub fn awareness(document_id: impl Into<String>, delta: &PresenceDelta) -> Result<Self, ProtocolError> {
        Ok(Self {
            document_id: document_id.into(),
            kind: MessageKind::Awareness,
            payload: delta.encode()?,
        })
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }

    /// Parse the payload as a sync message.
    pub fn sync_payload(&self) -> Result<SyncPayload, ProtocolError> {
        if self.kind != MessageKind::Sync {
            return Err(ProtocolError::InvalidMessageKind);
        }
        SyncPayload::decode(&self.payload)
    }

    /// Parse the payload as a presence delta.
    pub fn presence_delta(&self) -> Result<PresenceDelta, ProtocolError> {
        if self.kind != MessageKind::Awareness {
            return Err(ProtocolError::InvalidMessageKind);
        }
        PresenceDelta::decode(&self.payload)
    }
}

/// Sync-protocol payload inside a [`MessageKind::Sync`] frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPayload {
    /// Step-1: a compact summary of "what this replica has seen";
    /// the receiver answers with the missing diff.
    StateVector(Vec<u8>),
    /// Step-2: the diff computed against a previously received state vector.
    Diff(Vec<u8>),
    /// An incremental update delta produced by a live edit.
    Update(Vec<u8>),
}

impl SyncPayload {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (payload, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(payload)
    }
}

/// One presence entry: a replica-local client id plus an opaque state blob.
///
/// The core relays and stores the blob without interpreting it; Tabula
/// clients put a [`PresenceState`] inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub client_id: u64,
    pub state: Vec<u8>,
}

/// An added/updated/removed presence delta, broadcast to every other client
/// in the same session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceDelta {
    pub added: Vec<PresenceEntry>,
    pub updated: Vec<PresenceEntry>,
    pub removed: Vec<u64>,
}

impl PresenceDelta {
    /// Delta announcing a single new or changed entry.
    pub fn update_of(client_id: u64, state: Vec<u8>) -> Self {
        Self {
            updated: vec![PresenceEntry { client_id, state }],
            ..Self::default()
        }
    }

    /// Delta removing the given entries.
    pub fn removal_of(client_ids: Vec<u64>) -> Self {
        Self {
            removed: client_ids,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (delta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(delta)
    }
}

/// Grid coordinates of a single cell (0-based row/column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRef {
    pub row: u32,
    pub col: u32,
}

/// A rectangular cell selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRange {
    pub start: CellRef,
    pub end: CellRef,
}

/// The presence payload Tabula clients place inside [`PresenceEntry::state`].
///
/// Opaque to the session; decoded only at the endpoints for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    /// Cell the user's cursor currently occupies
    pub active_cell: Option<CellRef>,
    /// Current selection rectangle, if any
    pub selection: Option<CellRange>,
    pub user_name: String,
    /// RGBA color for cursor/selection rendering
    pub user_color: [f32; 4],
}

impl PresenceState {
    pub fn new(user_name: impl Into<String>, user_color: [f32; 4]) -> Self {
        Self {
            active_cell: None,
            selection: None,
            user_name: user_name.into(),
            user_color,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (state, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(state)
    }
}

/// Derive a stable RGBA cursor color from a connection id.
pub fn stable_color(id: Uuid) -> [f32; 4] {
    let hash = id.as_u128();
    let r = (hash & 0xFF) as f32 / 255.0;
    let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
    let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
    [r, g, b, 1.0]
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageKind,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageKind => write!(f, "Invalid message kind"),
        }
    }
}

impl std::error::Error for ProtocolError {}
