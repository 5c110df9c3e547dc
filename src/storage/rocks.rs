//! RocksDB-backed durable store.
//!
//! Column families:
//! - `documents`     — live document state, LZ4 compressed, keyed by doc id
//! - `metadata`      — per-document [`DocumentMetadata`]
//! - `versions`      — snapshot history records (bincode + LZ4), keyed by
//!   version uuid
//! - `version_index` — `<doc id>\0<version uuid>` prefix keys for
//!   per-document scans
//!
//! Writes that touch a record and its index go through one atomic
//! `WriteBatch`, so a crash never leaves an index entry pointing at nothing.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

use super::{DocumentStorage, StoreError};
use crate::versions::{StoredVersion, VersionPersistence, VersionStoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";
const CF_VERSIONS: &str = "versions";
const CF_VERSION_INDEX: &str = "version_index";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA, CF_VERSIONS, CF_VERSION_INDEX];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tabula_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches, caller-provided temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document bookkeeping stored alongside the live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: String,
    /// Uncompressed state size in bytes
    pub snapshot_size: u64,
    /// Compressed state size in bytes
    pub compressed_size: u64,
    /// Number of times this document has been written through
    pub save_count: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(document_id: &str) -> Self {
        let now = epoch_secs();
        Self {
            document_id: document_id.to_string(),
            snapshot_size: 0,
            compressed_size: 0,
            save_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// RocksDB-backed store for live documents and version history.
pub struct DocumentStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store at the configured path, creating the database and
    /// column families as needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(name, &config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_VERSIONS => {
                // Large values, point lookups
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_VERSION_INDEX => {
                // Small keys, prefix-scanned; values are empty
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    // ─── Live documents ───────────────────────────────────────────────

    /// Persist a document's full state (LZ4 compressed) plus metadata.
    pub fn save_document_state(
        &self,
        document_id: &str,
        state: &[u8],
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(state);

        let mut meta = self
            .load_metadata(document_id)
            .unwrap_or_else(|_| DocumentMetadata::new(document_id));
        meta.snapshot_size = state.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.save_count += 1;
        meta.updated_at = epoch_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, document_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, document_id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load a document's full state, or `None` when it was never persisted.
    pub fn load_document_state(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn document_exists(&self, document_id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        Ok(self.db.get_cf(&cf, document_id.as_bytes())?.is_some())
    }

    pub fn load_metadata(&self, document_id: &str) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(document_id.to_string())),
        }
    }

    /// List all persisted document ids.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            match String::from_utf8(key.to_vec()) {
                Ok(id) => ids.push(id),
                Err(_) => {
                    return Err(StoreError::DeserializationError(
                        "non-utf8 document key".into(),
                    ))
                }
            }
        }
        Ok(ids)
    }

    /// Drop a document's live state and metadata (versions are managed
    /// separately through the version-store hook).
    pub fn delete_document(&self, document_id: &str) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, document_id.as_bytes());
        batch.delete_cf(&cf_meta, document_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    // ─── Versions ─────────────────────────────────────────────────────

    fn put_version(&self, version: &StoredVersion) -> Result<(), StoreError> {
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_index = self.cf(CF_VERSION_INDEX)?;

        let record = bincode::serde::encode_to_vec(version, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&record);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_versions, version.id.as_bytes(), &compressed);
        batch.put_cf(
            &cf_index,
            Self::index_key(&version.document_id, version.id),
            b"",
        );

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn get_version(&self, version_id: Uuid) -> Result<Option<StoredVersion>, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let Some(compressed) = self.db.get_cf(&cf, version_id.as_bytes())? else {
            return Ok(None);
        };
        let record = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (version, _) = bincode::serde::decode_from_slice(&record, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(Some(version))
    }

    fn remove_version(&self, version_id: Uuid) -> Result<bool, StoreError> {
        // The record carries its document id; needed for the index key
        let Some(version) = self.get_version(version_id)? else {
            return Ok(false);
        };

        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_index = self.cf(CF_VERSION_INDEX)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_versions, version_id.as_bytes());
        batch.delete_cf(&cf_index, Self::index_key(&version.document_id, version_id));
        self.db.write(batch)?;
        Ok(true)
    }

    fn versions_of(&self, document_id: &str) -> Result<Vec<StoredVersion>, StoreError> {
        let cf_index = self.cf(CF_VERSION_INDEX)?;
        let prefix = Self::index_prefix(document_id);

        let mut versions = Vec::new();
        let iter = self.db.iterator_cf(
            &cf_index,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            if key.len() != prefix.len() + 16 {
                continue;
            }
            let version_id = Uuid::from_bytes(
                key[prefix.len()..]
                    .try_into()
                    .map_err(|_| StoreError::DeserializationError("bad index key".into()))?,
            );
            if let Some(version) = self.get_version(version_id)? {
                versions.push(version);
            }
        }
        Ok(versions)
    }

    fn clear_versions(&self) -> Result<(), StoreError> {
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_index = self.cf(CF_VERSION_INDEX)?;

        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(&cf_versions, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            batch.delete_cf(&cf_versions, &key);
        }
        for item in self.db.iterator_cf(&cf_index, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            batch.delete_cf(&cf_index, &key);
        }
        self.db.write(batch)?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// Index key: `<document id utf8>\0<version uuid 16 bytes>`.
    fn index_key(document_id: &str, version_id: Uuid) -> Vec<u8> {
        let mut key = Self::index_prefix(document_id);
        key.extend_from_slice(version_id.as_bytes());
        key
    }

    fn index_prefix(document_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(document_id.len() + 1);
        prefix.extend_from_slice(document_id.as_bytes());
        prefix.push(0);
        prefix
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force a flush of all memtables.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))
    }
}

impl DocumentStorage for DocumentStore {
    fn load_document(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.load_document_state(document_id)
    }

    fn save_document(&self, document_id: &str, state: &[u8]) -> Result<(), StoreError> {
        self.save_document_state(document_id, state).map(|_| ())
    }
}

impl VersionPersistence for DocumentStore {
    fn save(&self, version: &StoredVersion) -> Result<(), VersionStoreError> {
        self.put_version(version).map_err(Into::into)
    }

    fn load(&self, version_id: Uuid) -> Result<Option<StoredVersion>, VersionStoreError> {
        self.get_version(version_id).map_err(Into::into)
    }

    fn delete(&self, version_id: Uuid) -> Result<bool, VersionStoreError> {
        self.remove_version(version_id).map_err(Into::into)
    }

    fn load_document_versions(
        &self,
        document_id: &str,
    ) -> Result<Vec<StoredVersion>, VersionStoreError> {
        self.versions_of(document_id).map_err(Into::into)
    }

    fn clear(&self) -> Result<(), VersionStoreError> {
        self.clear_versions().map_err(Into::into)
    }
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::versions::{SnapshotTrigger, VersionAuthor};
    use std::fs;

    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tabula_test_rocks_{name}_{}", Uuid::new_v4()))
    }

    fn cleanup(path: &Path) {
        let _ = fs::remove_dir_all(path);
    }

    fn version(document_id: &str, label: Option<&str>) -> StoredVersion {
        let v = StoredVersion::new(
            document_id,
            VersionAuthor::new("u1", "Alice"),
            b"snapshot bytes with enough repetition repetition repetition".to_vec(),
            SnapshotTrigger::Periodic,
        );
        match label {
            Some(label) => v.with_label(label),
            None => v,
        }
    }

    #[test]
    fn test_store_open() {
        let path = temp_db_path("open");
        let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert!(store.path().exists());
        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_document_save_load() {
        let path = temp_db_path("doc_roundtrip");
        let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();

        let state = b"full document state with repeated cells cells cells cells".to_vec();
        let meta = store.save_document_state("doc1", &state).unwrap();
        assert_eq!(meta.snapshot_size, state.len() as u64);
        assert!(meta.compressed_size > 0);
        assert_eq!(meta.save_count, 1);

        let loaded = store.load_document_state("doc1").unwrap();
        assert_eq!(loaded, Some(state));

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_missing_document_is_none() {
        let path = temp_db_path("doc_missing");
        let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.load_document_state("nope").unwrap(), None);
        assert!(!store.document_exists("nope").unwrap());
        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_save_count_accumulates() {
        let path = temp_db_path("save_count");
        let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();

        for _ in 0..3 {
            store.save_document_state("doc1", b"state").unwrap();
        }
        let meta = store.load_metadata("doc1").unwrap();
        assert_eq!(meta.save_count, 3);
        assert!(meta.updated_at >= meta.created_at);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_list_and_delete_documents() {
        let path = temp_db_path("list_delete");
        let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();

        store.save_document_state("alpha", b"a").unwrap();
        store.save_document_state("beta", b"b").unwrap();

        let mut listed = store.list_documents().unwrap();
        listed.sort();
        assert_eq!(listed, vec!["alpha".to_string(), "beta".to_string()]);

        store.delete_document("alpha").unwrap();
        assert!(!store.document_exists("alpha").unwrap());
        assert!(store.document_exists("beta").unwrap());

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_version_roundtrip() {
        let path = temp_db_path("version_roundtrip");
        let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();

        let v = version("doc1", Some("quarter close"));
        let id = v.id;
        VersionPersistence::save(&store, &v).unwrap();

        let loaded = VersionPersistence::load(&store, id).unwrap().unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.document_id, "doc1");
        assert_eq!(loaded.label.as_deref(), Some("quarter close"));
        assert_eq!(loaded.snapshot, v.snapshot);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_version_delete() {
        let path = temp_db_path("version_delete");
        let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();

        let v = version("doc1", None);
        let id = v.id;
        VersionPersistence::save(&store, &v).unwrap();

        assert!(VersionPersistence::delete(&store, id).unwrap());
        assert!(!VersionPersistence::delete(&store, id).unwrap());
        assert!(VersionPersistence::load(&store, id).unwrap().is_none());
        assert!(store.versions_of("doc1").unwrap().is_empty());

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_versions_scoped_per_document() {
        let path = temp_db_path("version_scope");
        let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();

        for _ in 0..3 {
            VersionPersistence::save(&store, &version("doc1", None)).unwrap();
        }
        VersionPersistence::save(&store, &version("doc2", None)).unwrap();
        // "doc" is a prefix of both ids but indexes must not bleed
        VersionPersistence::save(&store, &version("doc", None)).unwrap();

        assert_eq!(store.versions_of("doc1").unwrap().len(), 3);
        assert_eq!(store.versions_of("doc2").unwrap().len(), 1);
        assert_eq!(store.versions_of("doc").unwrap().len(), 1);
        assert!(store.versions_of("doc3").unwrap().is_empty());

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_clear_versions() {
        let path = temp_db_path("version_clear");
        let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();

        for _ in 0..4 {
            VersionPersistence::save(&store, &version("doc1", None)).unwrap();
        }
        VersionPersistence::clear(&store).unwrap();
        assert!(store.versions_of("doc1").unwrap().is_empty());

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_reopen_preserves_data() {
        let path = temp_db_path("reopen");
        let config = StoreConfig::for_testing(&path);
        let version_id;

        {
            let store = DocumentStore::open(config.clone()).unwrap();
            store.save_document_state("doc1", b"persisted state").unwrap();
            let v = version("doc1", None);
            version_id = v.id;
            VersionPersistence::save(&store, &v).unwrap();
        }

        let store = DocumentStore::open(config).unwrap();
        assert_eq!(
            store.load_document_state("doc1").unwrap(),
            Some(b"persisted state".to_vec())
        );
        assert!(VersionPersistence::load(&store, version_id)
            .unwrap()
            .is_some());

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_compression_applied() {
        let path = temp_db_path("compression");
        let store = DocumentStore::open(StoreConfig::for_testing(&path)).unwrap();

        // Repetitive data, typical for serialized grid state
        let state = b"row,row,row,row,".repeat(1000);
        let meta = store.save_document_state("doc1", &state).unwrap();
        let ratio = meta.snapshot_size as f64 / meta.compressed_size as f64;
        assert!(ratio > 2.0, "compression ratio {ratio:.1}x too low");

        drop(store);
        cleanup(&path);
    }
}
