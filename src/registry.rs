//! Process-wide session registry.
//!
//! Owns the `document id → Session` map. Creation is idempotent under
//! concurrent first access (fast read path, double-checked write path — one
//! session per document, ever). New sessions are hydrated from the durable
//! store when one is configured, and every replica mutation schedules a
//! debounced persistence write so rapid typing costs one write per quiet
//! period rather than one per keystroke.
//!
//! Periodic sweeps bound memory: empty sessions idle past a threshold are
//! persisted and dropped, and clients that went silent without a close event
//! are force-closed. `shutdown` drains everything — the only place the core
//! blocks on I/O completion.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{Frame, MessageKind};
use crate::sched::Debouncer;
use crate::session::{ClientChannel, ClientProfile, Session, SessionError};
use crate::storage::DocumentStorage;

/// Close code sent when the inactivity sweep force-closes a silent client.
pub const CLOSE_INACTIVE: u16 = 4408;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Quiet period before a mutated document is written through
    pub persist_debounce: Duration,
    /// Empty sessions idle past this are evicted by the sweep
    pub idle_session_timeout: Duration,
    /// Clients silent past this are force-closed by the sweep
    pub client_inactivity_timeout: Duration,
    /// Period of the cleanup sweeps
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            persist_debounce: Duration::from_secs(1),
            idle_session_timeout: Duration::from_secs(300),
            client_inactivity_timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Per-room statistics.
#[derive(Debug, Clone)]
pub struct RoomStats {
    pub document_id: String,
    pub clients: usize,
    pub idle: Duration,
}

/// Registry-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub rooms: usize,
    pub clients: usize,
    pub per_room: Vec<RoomStats>,
}

/// The session registry.
pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    /// Connection id → documents it currently participates in
    subscriptions: Arc<RwLock<HashMap<Uuid, HashSet<String>>>>,
    storage: Option<Arc<dyn DocumentStorage>>,
    debounce: Arc<Debouncer>,
    sweepers: StdMutex<Vec<JoinHandle<()>>>,
}

impl SessionRegistry {
    /// Create a registry without durable persistence.
    pub fn new(config: RegistryConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a registry backed by a durable document store.
    pub fn with_storage(config: RegistryConfig, storage: Arc<dyn DocumentStorage>) -> Self {
        Self::build(config, Some(storage))
    }

    fn build(config: RegistryConfig, storage: Option<Arc<dyn DocumentStorage>>) -> Self {
        let debounce = Arc::new(Debouncer::new(config.persist_debounce));
        Self {
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            storage,
            debounce,
            sweepers: StdMutex::new(Vec::new()),
        }
    }

    /// Resolve a document's session, creating and hydrating it on first
    /// access. Concurrent first access for the same id resolves to the same
    /// session instance.
    pub async fn get_or_create(&self, document_id: &str) -> Arc<Session> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(document_id) {
                return session.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(document_id) {
            return session.clone();
        }

        let session = Arc::new(Session::new(document_id));
        if let Some(storage) = &self.storage {
            match storage.load_document(document_id) {
                Ok(Some(bytes)) => {
                    if let Err(e) = session.apply_initial_state(&bytes).await {
                        log::warn!("failed to hydrate document {document_id}: {e}");
                    }
                }
                Ok(None) => {}
                Err(e) => log::warn!("failed to load document {document_id}: {e}"),
            }
            self.install_persistence_hook(document_id, &session, storage.clone());
        }

        sessions.insert(document_id.to_string(), session.clone());
        log::info!("created session for document {document_id}");
        session
    }

    /// Wire the session's change hook to the per-document debounce timer.
    ///
    /// The hook holds a weak session reference; a session removed from the
    /// map is not kept alive by its own pending write.
    fn install_persistence_hook(
        &self,
        document_id: &str,
        session: &Arc<Session>,
        storage: Arc<dyn DocumentStorage>,
    ) {
        let debounce = self.debounce.clone();
        let weak = Arc::downgrade(session);
        let document_id = document_id.to_string();

        session.set_update_hook(Box::new(move || {
            let debounce = debounce.clone();
            let storage = storage.clone();
            let weak = weak.clone();
            let document_id = document_id.clone();
            tokio::spawn(async move {
                let key = document_id.clone();
                debounce
                    .schedule(&key, move || async move {
                        let Some(session) = weak.upgrade() else {
                            return;
                        };
                        let state = session.encode_full_state().await;
                        if let Err(e) = storage.save_document(&document_id, &state) {
                            // Not retried here; the next mutation reschedules
                            log::error!("failed to persist document {document_id}: {e}");
                        } else {
                            log::debug!(
                                "persisted document {document_id} ({} bytes)",
                                state.len()
                            );
                        }
                    })
                    .await;
            });
        }));
    }

    /// Existing session for a document, if any. Never creates.
    pub async fn get(&self, document_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(document_id).cloned()
    }

    /// Decode an inbound envelope and dispatch it to the target session.
    ///
    /// Step-2 diff replies are unicast back to the originating client's
    /// channel. Malformed frames are dropped, logged with the client id, and
    /// reported to the caller; they never disturb the session.
    pub async fn handle_frame(&self, client_id: Uuid, bytes: &[u8]) -> Result<(), SessionError> {
        let frame = Frame::decode(bytes).map_err(|e| {
            log::warn!("dropping malformed frame from client {client_id}: {e}");
            SessionError::Protocol(e)
        })?;

        let session = self.get_or_create(&frame.document_id).await;
        match frame.kind {
            MessageKind::Sync => {
                match session.handle_sync_message(&frame.payload, client_id).await {
                    Ok(Some(reply)) => {
                        if let Some(channel) = session.channel_of(&client_id).await {
                            if channel.is_open() {
                                channel.send(&reply);
                            }
                        }
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(e) => {
                        log::warn!(
                            "dropping sync frame from client {client_id} for {}: {e}",
                            frame.document_id
                        );
                        Err(e)
                    }
                }
            }
            MessageKind::Awareness => session
                .handle_awareness_message(&frame.payload, client_id)
                .await
                .map_err(|e| {
                    log::warn!(
                        "dropping awareness frame from client {client_id} for {}: {e}",
                        frame.document_id
                    );
                    e
                }),
        }
    }

    /// Join a client to a document's session.
    pub async fn add_client_to_room(
        &self,
        document_id: &str,
        client_id: Uuid,
        profile: ClientProfile,
        channel: Arc<dyn ClientChannel>,
    ) -> Arc<Session> {
        let session = self.get_or_create(document_id).await;
        session.add_client(client_id, profile, channel).await;
        self.subscriptions
            .write()
            .await
            .entry(client_id)
            .or_default()
            .insert(document_id.to_string());
        session
    }

    /// Remove a client from one document's session.
    pub async fn remove_client_from_room(&self, document_id: &str, client_id: &Uuid) {
        if let Some(session) = self.get(document_id).await {
            session.remove_client(client_id).await;
        }
        let mut subs = self.subscriptions.write().await;
        if let Some(docs) = subs.get_mut(client_id) {
            docs.remove(document_id);
            if docs.is_empty() {
                subs.remove(client_id);
            }
        }
    }

    /// Remove a disconnecting client from every session it had joined.
    pub async fn remove_client_from_all_sessions(&self, client_id: &Uuid) {
        let documents = self
            .subscriptions
            .write()
            .await
            .remove(client_id)
            .unwrap_or_default();
        for document_id in documents {
            if let Some(session) = self.get(&document_id).await {
                session.remove_client(client_id).await;
            }
        }
    }

    /// Tear down a document's session: cancel the pending debounce timer,
    /// optionally perform one final ordered write, destroy, unmap. Unknown
    /// ids are a no-op. Held write lock keeps this from racing a concurrent
    /// `get_or_create` for the same id.
    pub async fn remove_room(&self, document_id: &str, persist: bool) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.remove(document_id) else {
            return false;
        };

        self.debounce.cancel(document_id).await;
        if persist {
            if let Some(storage) = &self.storage {
                let gate = self.debounce.write_gate(document_id).await;
                let _write = gate.lock().await;
                let state = session.encode_full_state().await;
                if let Err(e) = storage.save_document(document_id, &state) {
                    log::error!("final persistence for document {document_id} failed: {e}");
                }
            }
        }
        self.debounce.forget(document_id).await;
        session.destroy().await;
        drop(sessions);

        log::info!("removed session for document {document_id}");
        true
    }

    /// Sweep: evict sessions with zero clients idle past the configured
    /// threshold. Per-room failures never abort the sweep.
    pub async fn cleanup_empty_sessions(&self) -> usize {
        let timeout = self.config.idle_session_timeout;
        let candidates: Vec<String> = {
            let sessions = self.sessions.read().await;
            let mut out = Vec::new();
            for (id, session) in sessions.iter() {
                if session.is_empty().await && session.last_activity().await.elapsed() > timeout {
                    out.push(id.clone());
                }
            }
            out
        };

        let mut removed = 0;
        for document_id in candidates {
            // Re-check: a client may have joined since the scan
            let still_idle = match self.get(&document_id).await {
                Some(session) => {
                    session.is_empty().await
                        && session.last_activity().await.elapsed() > timeout
                }
                None => false,
            };
            if still_idle && self.remove_room(&document_id, true).await {
                removed += 1;
            }
        }
        if removed > 0 {
            log::info!("evicted {removed} idle sessions");
        }
        removed
    }

    /// Sweep: force-close clients silent past `timeout` across all sessions.
    /// Exists because a connection can die without a close event ever
    /// arriving (suspended tab, crashed process).
    pub async fn cleanup_inactive_clients(&self, timeout: Duration) -> usize {
        let sessions: Vec<(String, Arc<Session>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, session)| (id.clone(), session.clone()))
            .collect();

        let mut total = 0;
        for (document_id, session) in sessions {
            let evicted = session
                .evict_idle_clients(timeout, CLOSE_INACTIVE, "closed for inactivity")
                .await;
            if evicted.is_empty() {
                continue;
            }
            log::info!(
                "evicted {} inactive clients from {document_id}",
                evicted.len()
            );
            let mut subs = self.subscriptions.write().await;
            for client_id in &evicted {
                if let Some(docs) = subs.get_mut(client_id) {
                    docs.remove(&document_id);
                    if docs.is_empty() {
                        subs.remove(client_id);
                    }
                }
            }
            total += evicted.len();
        }
        total
    }

    /// Start the periodic cleanup sweeps. The sweep task holds only a weak
    /// registry reference and exits when the registry is dropped.
    pub fn start_sweeps(self: &Arc<Self>) {
        let registry = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        let client_timeout = self.config.client_inactivity_timeout;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.cleanup_empty_sessions().await;
                registry.cleanup_inactive_clients(client_timeout).await;
            }
        });

        if let Ok(mut sweepers) = self.sweepers.lock() {
            sweepers.push(handle);
        }
    }

    /// Stop the sweeps, cancel all pending debounce timers, then persist and
    /// destroy every session, awaiting completion of all writes.
    pub async fn shutdown(&self) {
        if let Ok(mut sweepers) = self.sweepers.lock() {
            for handle in sweepers.drain(..) {
                handle.abort();
            }
        }
        self.debounce.cancel_all().await;

        let drained: Vec<(String, Arc<Session>)> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().collect()
        };

        let storage = self.storage.clone();
        let writes = drained.into_iter().map(|(document_id, session)| {
            let storage = storage.clone();
            async move {
                if let Some(storage) = storage {
                    let state = session.encode_full_state().await;
                    if let Err(e) = storage.save_document(&document_id, &state) {
                        log::error!("shutdown persistence for document {document_id} failed: {e}");
                    }
                }
                session.destroy().await;
            }
        });
        futures_util::future::join_all(writes).await;

        self.subscriptions.write().await.clear();
        log::info!("registry shut down");
    }

    pub async fn room_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn stats(&self) -> RegistryStats {
        let sessions = self.sessions.read().await;
        let mut per_room = Vec::with_capacity(sessions.len());
        let mut clients = 0;
        for (document_id, session) in sessions.iter() {
            let count = session.client_count().await;
            clients += count;
            per_room.push(RoomStats {
                document_id: document_id.clone(),
                clients: count,
                idle: session.last_activity().await.elapsed(),
            });
        }
        RegistryStats {
            rooms: sessions.len(),
            clients,
            per_room,
        }
    }
}
