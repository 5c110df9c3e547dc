//! # tabula-sync — Real-time document synchronization core for Tabula
//!
//! The collaborative backbone of the Tabula multi-user spreadsheet: many
//! clients editing the same document converge on identical state, see each
//! other's live cursors, and leave behind a bounded, queryable history of
//! snapshots.
//!
//! ## Architecture
//!
//! ```text
//! client frames ──► SessionRegistry ──► Session (per document)
//!                        │                 ├── replica (Yrs Doc)
//!                        │                 ├── presence map
//!                        │                 └── fan-out to other clients
//!                        │ debounced
//!                        ▼
//!                  DocumentStorage ◄── DocumentStore (RocksDB, LZ4)
//!                                            ▲
//!                  VersionStore ─────────────┘
//!                  (history, retention, eviction)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire envelope and sync/presence payloads
//! - [`session`] — per-document replica, presence and client fan-out
//! - [`registry`] — session lifecycle, debounced persistence, sweeps
//! - [`sched`] — schedule-or-reset delayed actions keyed by document id
//! - [`versions`] — snapshot history with retention and size eviction
//! - [`storage`] — durable store traits and the RocksDB backend
//!
//! Transport is out of scope: the core consumes a [`session::ClientChannel`]
//! per client and never touches sockets itself. The replica is treated as an
//! opaque conflict-free data structure behind the `yrs` API; its merge
//! internals are not reimplemented here.

pub mod protocol;
pub mod registry;
pub mod sched;
pub mod session;
pub mod storage;
pub mod versions;

// Re-exports for convenience
pub use protocol::{
    CellRange, CellRef, Frame, MessageKind, PresenceDelta, PresenceEntry, PresenceState,
    ProtocolError, SyncPayload,
};
pub use registry::{RegistryConfig, RegistryStats, RoomStats, SessionRegistry, CLOSE_INACTIVE};
pub use sched::Debouncer;
pub use session::{ClientChannel, ClientProfile, ConnectedClient, Session, SessionError};
pub use storage::{DocumentMetadata, DocumentStorage, DocumentStore, StoreConfig, StoreError};
pub use versions::{
    RetentionPolicy, SnapshotTrigger, StoredVersion, VersionAuthor, VersionMeta,
    VersionPersistence, VersionQuery, VersionStore, VersionStoreConfig, VersionStoreError,
};
