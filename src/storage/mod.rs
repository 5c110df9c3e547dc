//! Durable storage for live documents and version history.
//!
//! The registry and the version store consume abstract interfaces —
//! [`DocumentStorage`] here and `VersionPersistence` in the versions module
//! — so hosts can plug in anything key-value-shaped. [`rocks`] provides the
//! production backend:
//!
//! ```text
//! ┌──────────────┐  debounced writes  ┌───────────────┐
//! │ Registry     │ ─────────────────► │ DocumentStore │
//! │ VersionStore │  snapshots          │ (RocksDB)     │
//! └──────────────┘                    └──────┬────────┘
//!                                            │ column families
//!                                            ▼
//!                  ┌────────────────────────────────────────┐
//!                  │ CF "documents"     — live state (LZ4)   │
//!                  │ CF "metadata"      — per-doc metadata   │
//!                  │ CF "versions"      — snapshots (LZ4)    │
//!                  │ CF "version_index" — doc → version ids  │
//!                  └────────────────────────────────────────┘
//! ```

pub mod rocks;

pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};

/// Durable key-value storage for live document state, keyed by document id.
///
/// The core treats this as at-least-eventually-durable; a missing document
/// is `Ok(None)`, never an error.
pub trait DocumentStorage: Send + Sync {
    fn load_document(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn save_document(&self, document_id: &str, state: &[u8]) -> Result<(), StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Record not found
    NotFound(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Record not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<StoreError> for crate::versions::VersionStoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SerializationError(msg) => {
                crate::versions::VersionStoreError::Serialization(msg)
            }
            StoreError::DeserializationError(msg) => {
                crate::versions::VersionStoreError::Serialization(msg)
            }
            other => crate::versions::VersionStoreError::Persistence(other.to_string()),
        }
    }
}
