//! Snapshot history per document.
//!
//! The [`VersionStore`] keeps a queryable, size-and-age-bounded history of
//! full-document snapshots, decoupled from the live sync path. Listing is
//! metadata-only and always newest-first; retention and size eviction keep
//! growth bounded under continuous editing.
//!
//! Durability is delegated to an optional [`VersionPersistence`] hook. The
//! in-memory map, the per-document index and the running size total are
//! derived state updated together under one write lock — there is no window
//! in which the size total disagrees with the version set.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use uuid::Uuid;

const MS_PER_DAY: u64 = 86_400_000;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What caused a snapshot to be captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotTrigger {
    /// User explicitly saved a version
    Manual,
    /// Periodic auto-snapshot
    Periodic,
    /// Enough accumulated changes since the last snapshot
    ChangeThreshold,
    /// Captured right before a risky operation (restore, bulk paste)
    PreOperation,
}

/// Snapshot attribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionAuthor {
    pub id: String,
    pub name: String,
    pub avatar: Option<String>,
}

impl VersionAuthor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
        }
    }
}

/// One captured snapshot. Immutable once created, except for `label`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredVersion {
    pub id: Uuid,
    pub document_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    pub author: VersionAuthor,
    pub label: Option<String>,
    /// Full serialized document state
    pub snapshot: Vec<u8>,
    /// Edits accumulated since the previous snapshot
    pub change_count: u64,
    /// Snapshot payload size in bytes
    pub size: u64,
    pub is_auto: bool,
    pub trigger: SnapshotTrigger,
}

impl StoredVersion {
    pub fn new(
        document_id: impl Into<String>,
        author: VersionAuthor,
        snapshot: Vec<u8>,
        trigger: SnapshotTrigger,
    ) -> Self {
        let size = snapshot.len() as u64;
        Self {
            id: Uuid::new_v4(),
            document_id: document_id.into(),
            timestamp_ms: now_ms(),
            author,
            label: None,
            snapshot,
            change_count: 0,
            size,
            is_auto: !matches!(trigger, SnapshotTrigger::Manual),
            trigger,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_change_count(mut self, change_count: u64) -> Self {
        self.change_count = change_count;
        self
    }

    /// Labeled manual snapshots are exempt from count limits and size
    /// eviction; only the manual age rule can remove them.
    pub fn is_protected(&self) -> bool {
        self.label.is_some() && !self.is_auto
    }
}

/// Listing metadata — everything but the snapshot payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionMeta {
    pub id: Uuid,
    pub document_id: String,
    pub timestamp_ms: u64,
    pub author: VersionAuthor,
    pub label: Option<String>,
    pub change_count: u64,
    pub size: u64,
    pub is_auto: bool,
    pub trigger: SnapshotTrigger,
}

impl From<&StoredVersion> for VersionMeta {
    fn from(v: &StoredVersion) -> Self {
        Self {
            id: v.id,
            document_id: v.document_id.clone(),
            timestamp_ms: v.timestamp_ms,
            author: v.author.clone(),
            label: v.label.clone(),
            change_count: v.change_count,
            size: v.size,
            is_auto: v.is_auto,
            trigger: v.trigger,
        }
    }
}

/// Pluggable durable backend for versions.
pub trait VersionPersistence: Send + Sync {
    fn save(&self, version: &StoredVersion) -> Result<(), VersionStoreError>;
    fn load(&self, version_id: Uuid) -> Result<Option<StoredVersion>, VersionStoreError>;
    /// Returns whether a durable copy existed.
    fn delete(&self, version_id: Uuid) -> Result<bool, VersionStoreError>;
    fn load_document_versions(
        &self,
        document_id: &str,
    ) -> Result<Vec<StoredVersion>, VersionStoreError>;
    fn clear(&self) -> Result<(), VersionStoreError>;
}

/// Per-document retention rules, applied in `cleanup_document`.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Newest-first count limit per document
    pub max_versions_per_document: Option<usize>,
    /// Auto-snapshots older than this are always deleted
    pub max_auto_snapshot_age_days: Option<u64>,
    /// Labeled manual snapshots lose their protection past this age
    pub max_manual_snapshot_age_days: Option<u64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_versions_per_document: Some(100),
            max_auto_snapshot_age_days: Some(30),
            max_manual_snapshot_age_days: None,
        }
    }
}

/// Version store configuration.
#[derive(Debug, Clone, Default)]
pub struct VersionStoreConfig {
    pub retention: RetentionPolicy,
    /// Global ceiling across all documents; exceeding it triggers
    /// oldest-first eviction of unprotected versions
    pub max_total_size_bytes: Option<u64>,
    /// Run the per-document retention sweep on every save
    pub cleanup_on_save: bool,
}

/// Listing options for [`VersionStore::get_versions`].
#[derive(Debug, Clone)]
pub struct VersionQuery {
    pub limit: Option<usize>,
    pub offset: usize,
    pub include_auto: bool,
    /// Filter by author id
    pub author: Option<String>,
    pub since_ms: Option<u64>,
    pub until_ms: Option<u64>,
}

impl Default for VersionQuery {
    fn default() -> Self {
        Self {
            limit: None,
            offset: 0,
            include_auto: true,
            author: None,
            since_ms: None,
            until_ms: None,
        }
    }
}

/// In-memory version set plus derived state, mutated atomically.
#[derive(Default)]
struct VersionIndex {
    versions: HashMap<Uuid, StoredVersion>,
    by_document: HashMap<String, HashSet<Uuid>>,
    total_size: u64,
}

impl VersionIndex {
    fn insert(&mut self, version: StoredVersion) {
        self.remove(&version.id);
        self.total_size += version.size;
        self.by_document
            .entry(version.document_id.clone())
            .or_default()
            .insert(version.id);
        self.versions.insert(version.id, version);
    }

    fn remove(&mut self, version_id: &Uuid) -> Option<StoredVersion> {
        let version = self.versions.remove(version_id)?;
        self.total_size = self.total_size.saturating_sub(version.size);
        if let Some(ids) = self.by_document.get_mut(&version.document_id) {
            ids.remove(version_id);
            if ids.is_empty() {
                self.by_document.remove(&version.document_id);
            }
        }
        Some(version)
    }
}

/// Queryable, bounded snapshot history, independent of the live sync path.
pub struct VersionStore {
    config: VersionStoreConfig,
    hook: Option<Arc<dyn VersionPersistence>>,
    inner: RwLock<VersionIndex>,
}

impl VersionStore {
    pub fn new(config: VersionStoreConfig) -> Self {
        Self {
            config,
            hook: None,
            inner: RwLock::new(VersionIndex::default()),
        }
    }

    pub fn with_hook(config: VersionStoreConfig, hook: Arc<dyn VersionPersistence>) -> Self {
        Self {
            config,
            hook: Some(hook),
            inner: RwLock::new(VersionIndex::default()),
        }
    }

    /// Insert a version, persist it, and apply the configured bounds.
    ///
    /// A hook failure surfaces as `Err`; the in-memory copy is kept and a
    /// later save may re-persist it.
    pub async fn save_version(&self, version: StoredVersion) -> Result<(), VersionStoreError> {
        let document_id = version.document_id.clone();
        let version_id = version.id;
        {
            let mut inner = self.inner.write().await;
            inner.insert(version.clone());
        }

        if let Some(hook) = &self.hook {
            if let Err(e) = hook.save(&version) {
                log::error!("failed to persist version {version_id} for {document_id}: {e}");
                return Err(e);
            }
        }

        if self.config.cleanup_on_save {
            let removed = self.cleanup_document(&document_id).await;
            if removed > 0 {
                log::debug!("retention removed {removed} versions of {document_id}");
            }
        }
        if let Some(ceiling) = self.config.max_total_size_bytes {
            if self.total_size().await > ceiling {
                self.evict_oldest_versions().await;
            }
        }
        Ok(())
    }

    /// Metadata listing, always sorted strictly descending by timestamp
    /// (version id as the deterministic tie-break) before filters and
    /// pagination apply. The version-history UI depends on this ordering.
    pub async fn get_versions(&self, document_id: &str, query: &VersionQuery) -> Vec<VersionMeta> {
        let inner = self.inner.read().await;
        let Some(ids) = inner.by_document.get(document_id) else {
            return Vec::new();
        };
        let mut list: Vec<&StoredVersion> =
            ids.iter().filter_map(|id| inner.versions.get(id)).collect();
        list.sort_by(|a, b| {
            b.timestamp_ms
                .cmp(&a.timestamp_ms)
                .then_with(|| b.id.cmp(&a.id))
        });

        list.into_iter()
            .filter(|v| query.include_auto || !v.is_auto)
            .filter(|v| query.author.as_deref().map_or(true, |a| v.author.id == a))
            .filter(|v| query.since_ms.map_or(true, |t| v.timestamp_ms >= t))
            .filter(|v| query.until_ms.map_or(true, |t| v.timestamp_ms <= t))
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .map(VersionMeta::from)
            .collect()
    }

    /// Full version by id; faults in from the hook on a memory miss and
    /// re-indexes it (idempotently — a concurrent load never double-inserts).
    pub async fn get_version(
        &self,
        version_id: Uuid,
    ) -> Result<Option<StoredVersion>, VersionStoreError> {
        if let Some(version) = self.inner.read().await.versions.get(&version_id) {
            return Ok(Some(version.clone()));
        }
        let Some(hook) = &self.hook else {
            return Ok(None);
        };
        let Some(loaded) = hook.load(version_id)? else {
            return Ok(None);
        };

        let mut inner = self.inner.write().await;
        if !inner.versions.contains_key(&version_id) {
            inner.insert(loaded.clone());
        }
        Ok(Some(loaded))
    }

    /// Delete a version everywhere. The hook delete is attempted even when
    /// the in-memory copy was absent (a durable copy may exist that was
    /// never lazily loaded). Returns whether anything existed.
    pub async fn delete_version(&self, version_id: Uuid) -> Result<bool, VersionStoreError> {
        let removed = self.inner.write().await.remove(&version_id).is_some();
        let durable_removed = match &self.hook {
            Some(hook) => hook.delete(version_id)?,
            None => false,
        };
        Ok(removed || durable_removed)
    }

    /// Rename a version — the only mutation allowed on an existing one.
    /// Re-persists through the hook. Returns false for unknown ids.
    pub async fn update_version_label(
        &self,
        version_id: Uuid,
        label: Option<String>,
    ) -> Result<bool, VersionStoreError> {
        // Fault in a never-loaded durable copy first
        if self.get_version(version_id).await?.is_none() {
            return Ok(false);
        }

        let updated = {
            let mut inner = self.inner.write().await;
            match inner.versions.get_mut(&version_id) {
                Some(version) => {
                    version.label = label;
                    Some(version.clone())
                }
                None => None,
            }
        };
        match updated {
            Some(version) => {
                if let Some(hook) = &self.hook {
                    hook.save(&version)?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Enforce the per-document retention rules. Precedence:
    ///
    /// 1. labeled manual snapshots are protected unless older than
    ///    `max_manual_snapshot_age_days`;
    /// 2. auto-snapshots older than `max_auto_snapshot_age_days` go
    ///    regardless of count limits;
    /// 3. of the remainder sorted newest-first, anything beyond
    ///    `max_versions_per_document` goes, protected versions excepted.
    ///
    /// Every deletion goes through `delete_version` so index, size total and
    /// hook stay consistent. Returns the number removed.
    pub async fn cleanup_document(&self, document_id: &str) -> usize {
        let policy = self.config.retention.clone();
        let now = now_ms();

        struct Candidate {
            id: Uuid,
            timestamp_ms: u64,
            is_auto: bool,
            labeled: bool,
        }

        let mut candidates: Vec<Candidate> = {
            let inner = self.inner.read().await;
            let Some(ids) = inner.by_document.get(document_id) else {
                return 0;
            };
            ids.iter()
                .filter_map(|id| inner.versions.get(id))
                .map(|v| Candidate {
                    id: v.id,
                    timestamp_ms: v.timestamp_ms,
                    is_auto: v.is_auto,
                    labeled: v.label.is_some(),
                })
                .collect()
        };

        let mut doomed: Vec<Uuid> = Vec::new();
        let mut doomed_set: HashSet<Uuid> = HashSet::new();

        if let Some(days) = policy.max_manual_snapshot_age_days {
            let cutoff = now.saturating_sub(days * MS_PER_DAY);
            for c in &candidates {
                if c.labeled && !c.is_auto && c.timestamp_ms < cutoff && doomed_set.insert(c.id) {
                    doomed.push(c.id);
                }
            }
        }
        if let Some(days) = policy.max_auto_snapshot_age_days {
            let cutoff = now.saturating_sub(days * MS_PER_DAY);
            for c in &candidates {
                if c.is_auto && c.timestamp_ms < cutoff && doomed_set.insert(c.id) {
                    doomed.push(c.id);
                }
            }
        }

        if let Some(max) = policy.max_versions_per_document {
            candidates.sort_by(|a, b| {
                b.timestamp_ms
                    .cmp(&a.timestamp_ms)
                    .then_with(|| b.id.cmp(&a.id))
            });
            for (position, c) in candidates
                .iter()
                .filter(|c| !doomed_set.contains(&c.id))
                .enumerate()
            {
                if position < max {
                    continue;
                }
                if c.labeled && !c.is_auto {
                    continue;
                }
                if doomed_set.insert(c.id) {
                    doomed.push(c.id);
                }
            }
        }

        let mut removed = 0;
        for id in doomed {
            match self.delete_version(id).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => log::warn!("retention delete of version {id} failed: {e}"),
            }
        }
        removed
    }

    /// Delete oldest-first until the global size ceiling is met, skipping
    /// protected versions — they are never size-evicted, only the age rule
    /// can take them. When only protected versions remain, eviction stops
    /// short of the target; that is a documented limitation, not an error.
    pub async fn evict_oldest_versions(&self) -> usize {
        let Some(ceiling) = self.config.max_total_size_bytes else {
            return 0;
        };

        let (mut total, candidates) = {
            let inner = self.inner.read().await;
            let mut list: Vec<(Uuid, u64, u64, bool)> = inner
                .versions
                .values()
                .map(|v| (v.id, v.timestamp_ms, v.size, v.is_protected()))
                .collect();
            list.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            (inner.total_size, list)
        };
        if total <= ceiling {
            return 0;
        }

        let mut evicted = 0;
        for (id, _, size, protected) in candidates {
            if total <= ceiling {
                break;
            }
            if protected {
                continue;
            }
            match self.delete_version(id).await {
                Ok(true) => {
                    total = total.saturating_sub(size);
                    evicted += 1;
                }
                Ok(false) => {}
                Err(e) => log::warn!("size eviction of version {id} failed: {e}"),
            }
        }
        if total > ceiling {
            log::debug!("size eviction stopped short: remaining versions are protected");
        }
        evicted
    }

    /// Replay a document's durable versions into the index (idempotent).
    /// For process restart; versions already in memory are left untouched.
    pub async fn hydrate_document(&self, document_id: &str) -> Result<usize, VersionStoreError> {
        let Some(hook) = &self.hook else {
            return Ok(0);
        };
        let durable = hook.load_document_versions(document_id)?;
        let mut inner = self.inner.write().await;
        let mut loaded = 0;
        for version in durable {
            if !inner.versions.contains_key(&version.id) {
                inner.insert(version);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Wipe everything, memory and hook.
    pub async fn clear(&self) -> Result<(), VersionStoreError> {
        {
            let mut inner = self.inner.write().await;
            *inner = VersionIndex::default();
        }
        if let Some(hook) = &self.hook {
            hook.clear()?;
        }
        Ok(())
    }

    pub async fn total_size(&self) -> u64 {
        self.inner.read().await.total_size
    }

    pub async fn version_count(&self) -> usize {
        self.inner.read().await.versions.len()
    }

    pub async fn count_for_document(&self, document_id: &str) -> usize {
        self.inner
            .read()
            .await
            .by_document
            .get(document_id)
            .map_or(0, |ids| ids.len())
    }
}

/// Version store errors.
#[derive(Debug, Clone)]
pub enum VersionStoreError {
    /// Durable backend failure
    Persistence(String),
    /// Record (de)serialization failure
    Serialization(String),
}

impl std::fmt::Display for VersionStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Persistence(e) => write!(f, "Persistence error: {e}"),
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for VersionStoreError {}
