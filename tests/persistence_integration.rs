//! Persistence integration tests.
//!
//! Verifies:
//! - Debounced document writes coalesce bursts and self-heal on failure
//! - Hydration restores a document from the durable store on first access
//! - `remove_room` and `shutdown` leave final state on disk
//! - Version history survives a process restart through the RocksDB hook

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabula_sync::protocol::{Frame, SyncPayload};
use tabula_sync::registry::{RegistryConfig, SessionRegistry};
use tabula_sync::session::{ClientChannel, ClientProfile};
use tabula_sync::storage::{DocumentStorage, DocumentStore, StoreConfig, StoreError};
use tabula_sync::versions::{
    RetentionPolicy, SnapshotTrigger, StoredVersion, VersionAuthor, VersionQuery, VersionStore,
    VersionStoreConfig,
};
use tempfile::tempdir;
use uuid::Uuid;
use yrs::{Doc, Map, ReadTxn, StateVector, Transact, WriteTxn};

// ─── Helpers ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct TestChannel {
    closed: AtomicBool,
}

impl ClientChannel for TestChannel {
    fn send(&self, _bytes: &[u8]) {}

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn close(&self, _code: u16, _reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// In-memory durable store with write accounting.
#[derive(Default)]
struct MemoryStorage {
    docs: Mutex<HashMap<String, Vec<u8>>>,
    saves: AtomicUsize,
    fail_writes: AtomicBool,
}

impl DocumentStorage for MemoryStorage {
    fn load_document(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.docs.lock().unwrap().get(document_id).cloned())
    }

    fn save_document(&self, document_id: &str, state: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseError("injected failure".into()));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.docs
            .lock()
            .unwrap()
            .insert(document_id.to_string(), state.to_vec());
        Ok(())
    }
}

/// Edit a cell on a local replica and relay the delta into the registry.
async fn edit(
    registry: &SessionRegistry,
    client_id: Uuid,
    doc: &Doc,
    document_id: &str,
    cell: &str,
    value: &str,
) {
    let before = {
        let txn = doc.transact();
        txn.state_vector()
    };
    {
        let mut txn = doc.transact_mut();
        let cells = txn.get_or_insert_map("cells");
        cells.insert(&mut txn, cell, value);
    }
    let delta = {
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&before)
    };
    let frame = Frame::sync(document_id, &SyncPayload::Update(delta)).unwrap();
    registry
        .handle_frame(client_id, &frame.encode().unwrap())
        .await
        .unwrap();
}

fn full_state(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

fn version(document_id: &str, trigger: SnapshotTrigger) -> StoredVersion {
    StoredVersion::new(
        document_id,
        VersionAuthor::new("u1", "Alice"),
        b"serialized grid state".to_vec(),
        trigger,
    )
}

// ─── Debounced document persistence ──────────────────────────────────────────

#[tokio::test]
async fn test_rapid_edits_coalesce_to_one_write() {
    let storage = Arc::new(MemoryStorage::default());
    let config = RegistryConfig {
        persist_debounce: Duration::from_millis(50),
        ..RegistryConfig::default()
    };
    let registry = SessionRegistry::with_storage(config, storage.clone());

    let client = Uuid::new_v4();
    registry
        .add_client_to_room("doc1", client, ClientProfile::default(), Arc::new(TestChannel::default()))
        .await;

    let doc = Doc::new();
    for i in 0..5 {
        edit(&registry, client, &doc, "doc1", "A1", &format!("v{i}")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        storage.saves.load(Ordering::SeqCst),
        1,
        "a typing burst costs one write"
    );
    assert!(storage.docs.lock().unwrap().contains_key("doc1"));
}

#[tokio::test]
async fn test_spaced_edits_each_write() {
    let storage = Arc::new(MemoryStorage::default());
    let config = RegistryConfig {
        persist_debounce: Duration::from_millis(30),
        ..RegistryConfig::default()
    };
    let registry = SessionRegistry::with_storage(config, storage.clone());

    let client = Uuid::new_v4();
    registry
        .add_client_to_room("doc1", client, ClientProfile::default(), Arc::new(TestChannel::default()))
        .await;

    let doc = Doc::new();
    for i in 0..3 {
        edit(&registry, client, &doc, "doc1", "A1", &format!("v{i}")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(storage.saves.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_write_failure_self_heals_on_next_mutation() {
    let storage = Arc::new(MemoryStorage::default());
    let config = RegistryConfig {
        persist_debounce: Duration::from_millis(20),
        ..RegistryConfig::default()
    };
    let registry = SessionRegistry::with_storage(config, storage.clone());

    let client = Uuid::new_v4();
    registry
        .add_client_to_room("doc1", client, ClientProfile::default(), Arc::new(TestChannel::default()))
        .await;

    let doc = Doc::new();
    storage.fail_writes.store(true, Ordering::SeqCst);
    edit(&registry, client, &doc, "doc1", "A1", "lost?").await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(storage.saves.load(Ordering::SeqCst), 0);

    // No eager retry; the next mutation reschedules and succeeds
    storage.fail_writes.store(false, Ordering::SeqCst);
    edit(&registry, client, &doc, "doc1", "A1", "recovered").await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(storage.saves.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shutdown_persists_and_stops_timers() {
    let storage = Arc::new(MemoryStorage::default());
    let config = RegistryConfig {
        persist_debounce: Duration::from_secs(30), // would never fire in-test
        ..RegistryConfig::default()
    };
    let registry = SessionRegistry::with_storage(config, storage.clone());

    let client = Uuid::new_v4();
    registry
        .add_client_to_room("doc1", client, ClientProfile::default(), Arc::new(TestChannel::default()))
        .await;
    let doc = Doc::new();
    edit(&registry, client, &doc, "doc1", "A1", "final").await;

    registry.shutdown().await;
    assert_eq!(storage.saves.load(Ordering::SeqCst), 1);
    assert_eq!(
        storage.docs.lock().unwrap().get("doc1"),
        Some(&full_state(&doc))
    );
    assert_eq!(registry.room_count().await, 0);

    // The cancelled debounce timer never fires a second write
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(storage.saves.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_remove_room_final_write() {
    let storage = Arc::new(MemoryStorage::default());
    let registry = SessionRegistry::with_storage(RegistryConfig::default(), storage.clone());

    let client = Uuid::new_v4();
    registry
        .add_client_to_room("doc1", client, ClientProfile::default(), Arc::new(TestChannel::default()))
        .await;
    let doc = Doc::new();
    edit(&registry, client, &doc, "doc1", "A1", "kept").await;

    assert!(registry.remove_room("doc1", true).await);
    assert_eq!(
        storage.docs.lock().unwrap().get("doc1"),
        Some(&full_state(&doc))
    );
}

// ─── Hydration ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_document_survives_restart_via_rocks() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let doc = Doc::new();

    // First process: edit and tear down
    {
        let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(&db_path)).unwrap());
        let registry =
            SessionRegistry::with_storage(RegistryConfig::default(), store.clone());

        let client = Uuid::new_v4();
        registry
            .add_client_to_room("sheet", client, ClientProfile::default(), Arc::new(TestChannel::default()))
            .await;
        edit(&registry, client, &doc, "sheet", "A1", "q1 revenue").await;
        edit(&registry, client, &doc, "sheet", "B1", "4200").await;
        registry.shutdown().await;
    }
    // Let aborted timer tasks drop their store handle before reopening
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Second process: first access hydrates from disk
    let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(&db_path)).unwrap());
    let registry = SessionRegistry::with_storage(RegistryConfig::default(), store);
    let session = registry.get_or_create("sheet").await;

    assert_eq!(session.encode_full_state().await, full_state(&doc));
}

#[tokio::test]
async fn test_hydration_failure_starts_empty() {
    // A store whose load blows up must not take the session down with it
    struct BrokenLoad;
    impl DocumentStorage for BrokenLoad {
        fn load_document(&self, _: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::DatabaseError("corrupt".into()))
        }
        fn save_document(&self, _: &str, _: &[u8]) -> Result<(), StoreError> {
            Ok(())
        }
    }

    let registry =
        SessionRegistry::with_storage(RegistryConfig::default(), Arc::new(BrokenLoad));
    let session = registry.get_or_create("doc1").await;
    assert_eq!(session.client_count().await, 0);
}

// ─── Version history durability ──────────────────────────────────────────────

#[tokio::test]
async fn test_versions_survive_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let labeled_id;

    {
        let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(&db_path)).unwrap());
        let versions = VersionStore::with_hook(VersionStoreConfig::default(), store);

        let labeled = version("sheet", SnapshotTrigger::Manual).with_label("before restructure");
        labeled_id = labeled.id;
        versions.save_version(labeled).await.unwrap();
        for _ in 0..3 {
            versions
                .save_version(version("sheet", SnapshotTrigger::Periodic))
                .await
                .unwrap();
        }
    }

    let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(&db_path)).unwrap());
    let versions = VersionStore::with_hook(VersionStoreConfig::default(), store);

    // Cold cache: a single id faults in lazily
    let loaded = versions.get_version(labeled_id).await.unwrap().unwrap();
    assert_eq!(loaded.label.as_deref(), Some("before restructure"));

    // Full replay for the listing UI
    assert_eq!(versions.hydrate_document("sheet").await.unwrap(), 3);
    let listed = versions.get_versions("sheet", &VersionQuery::default()).await;
    assert_eq!(listed.len(), 4);
    for pair in listed.windows(2) {
        assert!(pair[0].timestamp_ms >= pair[1].timestamp_ms);
    }
}

#[tokio::test]
async fn test_retention_deletes_durable_copies() {
    let dir = tempdir().unwrap();
    let store =
        Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let versions = VersionStore::with_hook(
        VersionStoreConfig {
            retention: RetentionPolicy {
                max_versions_per_document: Some(2),
                max_auto_snapshot_age_days: None,
                max_manual_snapshot_age_days: None,
            },
            max_total_size_bytes: None,
            cleanup_on_save: false,
        },
        store.clone(),
    );

    let mut ids = Vec::new();
    for i in 0..5u64 {
        let mut v = version("sheet", SnapshotTrigger::Periodic);
        v.timestamp_ms = 1000 + i;
        ids.push(v.id);
        versions.save_version(v).await.unwrap();
    }

    assert_eq!(versions.cleanup_document("sheet").await, 3);
    assert_eq!(versions.count_for_document("sheet").await, 2);

    // The three oldest are gone from disk as well
    use tabula_sync::versions::VersionPersistence;
    for id in &ids[..3] {
        assert!(store.load(*id).unwrap().is_none());
    }
    for id in &ids[3..] {
        assert!(store.load(*id).unwrap().is_some());
    }
}

#[tokio::test]
async fn test_update_label_persists_through_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let id;

    {
        let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(&db_path)).unwrap());
        let versions = VersionStore::with_hook(VersionStoreConfig::default(), store);
        let v = version("sheet", SnapshotTrigger::Manual);
        id = v.id;
        versions.save_version(v).await.unwrap();
        assert!(versions
            .update_version_label(id, Some("EOY close".into()))
            .await
            .unwrap());
    }

    let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(&db_path)).unwrap());
    let versions = VersionStore::with_hook(VersionStoreConfig::default(), store);
    let reloaded = versions.get_version(id).await.unwrap().unwrap();
    assert_eq!(reloaded.label.as_deref(), Some("EOY close"));
}
