//! Per-document collaborative session.
//!
//! A [`Session`] owns one replicated document (a Yrs `Doc`), the ephemeral
//! presence map for that document, and the set of connected clients. Inbound
//! sync frames mutate the replica; the replica's update hook re-encodes what
//! was actually integrated and the session fans it out to every other
//! subscribed client. Presence deltas are relayed the same way but never
//! touch the replica and are never persisted.
//!
//! ```text
//! client A ──frame──► Session ──┬── replica (Yrs Doc)
//!                               │        │ update hook
//!                               │        ▼
//!                               ├── broadcast to B, C, … (never back to A)
//!                               └── presence map (opaque blobs)
//! ```
//!
//! All session state sits behind a single async mutex, so update application
//! and the resulting broadcast are serialized in inbound-processing order —
//! the same guarantee a single-threaded event loop would give.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Subscription, Transact, Update};

use crate::protocol::{Frame, PresenceDelta, PresenceEntry, ProtocolError, SyncPayload};

/// Send-capable handle to a remote peer. The core only ever sends, checks
/// openness, and force-closes; transport details live outside.
pub trait ClientChannel: Send + Sync {
    /// Best-effort send. Must not block; a failed send is simply lost.
    fn send(&self, bytes: &[u8]);
    fn is_open(&self) -> bool;
    /// Force-close the connection with an application close code.
    fn close(&self, code: u16, reason: &str);
}

/// Optional attribution for presence rendering, passed through unchanged.
#[derive(Debug, Clone, Default)]
pub struct ClientProfile {
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub color: Option<String>,
}

/// One live connection subscribed to this session.
pub struct ConnectedClient {
    pub id: Uuid,
    pub channel: Arc<dyn ClientChannel>,
    pub profile: ClientProfile,
    /// Updated on every inbound frame from this connection
    pub last_active: Instant,
    /// Replica-local presence ids attributable to this connection.
    /// Removal must clear exactly these entries, nothing else.
    pub presence_ids: HashSet<u64>,
}

type UpdateHook = Box<dyn Fn() + Send + Sync>;

struct SessionState {
    replica: Doc,
    clients: HashMap<Uuid, ConnectedClient>,
    /// Replica-local client id → opaque presence blob
    presence: HashMap<u64, Vec<u8>>,
    last_activity: Instant,
    destroyed: bool,
    _replica_sub: Subscription,
}

/// The live, in-memory collaborative state for one open document.
pub struct Session {
    id: String,
    created_at: Instant,
    state: Mutex<SessionState>,
    /// Updates buffered by the replica's update hook during a transaction,
    /// drained right after commit for broadcast.
    pending: Arc<StdMutex<Vec<Vec<u8>>>>,
    /// Registry-installed callback fired after every replica mutation
    /// (drives debounced persistence).
    update_hook: StdMutex<Option<UpdateHook>>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let replica = Doc::new();
        let pending: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::new(StdMutex::new(Vec::new()));

        let buf = pending.clone();
        let sub = replica
            .observe_update_v1(move |_txn, event| {
                if let Ok(mut buf) = buf.lock() {
                    buf.push(event.update.clone());
                }
            })
            .expect("fresh replica accepts observers");

        Self {
            id: id.into(),
            created_at: Instant::now(),
            state: Mutex::new(SessionState {
                replica,
                clients: HashMap::new(),
                presence: HashMap::new(),
                last_activity: Instant::now(),
                destroyed: false,
                _replica_sub: sub,
            }),
            pending,
            update_hook: StdMutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Install the change-triggered callback (persistence debounce).
    pub fn set_update_hook(&self, hook: UpdateHook) {
        if let Ok(mut slot) = self.update_hook.lock() {
            *slot = Some(hook);
        }
    }

    /// Register a client and bring it up to date.
    ///
    /// The new client is unicast (a) a sync-initiation frame carrying this
    /// replica's state vector, so it can request only the missing diff, and
    /// (b) a snapshot of every other known presence entry, if any. Existing
    /// clients see nothing until the newcomer edits or moves its cursor.
    /// Re-adding an already-present id behaves like a single fresh join.
    pub async fn add_client(
        &self,
        client_id: Uuid,
        profile: ClientProfile,
        channel: Arc<dyn ClientChannel>,
    ) {
        let mut state = self.state.lock().await;
        if state.destroyed {
            return;
        }

        // A rejoin keeps the presence attribution of the previous entry
        let presence_ids = state
            .clients
            .remove(&client_id)
            .map(|prev| prev.presence_ids)
            .unwrap_or_default();

        let sv = {
            let txn = state.replica.transact();
            txn.state_vector().encode_v1()
        };
        send_sync(&*channel, &self.id, &SyncPayload::StateVector(sv));

        let others: Vec<PresenceEntry> = state
            .presence
            .iter()
            .filter(|(id, _)| !presence_ids.contains(id))
            .map(|(id, blob)| PresenceEntry {
                client_id: *id,
                state: blob.clone(),
            })
            .collect();
        if !others.is_empty() {
            let snapshot = PresenceDelta {
                added: others,
                ..PresenceDelta::default()
            };
            send_awareness(&*channel, &self.id, &snapshot);
        }

        state.clients.insert(
            client_id,
            ConnectedClient {
                id: client_id,
                channel,
                profile,
                last_active: Instant::now(),
                presence_ids,
            },
        );
    }

    /// Unregister a client and drop the presence entries attributable to it,
    /// so other clients stop seeing a stale cursor. Unknown ids are a no-op.
    pub async fn remove_client(&self, client_id: &Uuid) -> bool {
        let mut state = self.state.lock().await;
        let Some(client) = state.clients.remove(client_id) else {
            return false;
        };

        let gone: Vec<u64> = client
            .presence_ids
            .iter()
            .copied()
            .filter(|id| state.presence.remove(id).is_some())
            .collect();
        if !gone.is_empty() {
            state.last_activity = Instant::now();
            broadcast_awareness(&state.clients, &self.id, &PresenceDelta::removal_of(gone), None);
        }
        true
    }

    /// Process an inbound sync payload from `from`.
    ///
    /// A state-vector request yields `Ok(Some(reply))` — an encoded frame the
    /// caller unicasts back to the origin. Updates and diffs are applied to
    /// the replica; whatever the replica actually integrated is re-encoded by
    /// its update hook and broadcast to every other client, never echoing to
    /// the origin. Malformed payloads return `Err` and leave the session
    /// intact.
    pub async fn handle_sync_message(
        &self,
        payload: &[u8],
        from: Uuid,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        let msg = SyncPayload::decode(payload)?;
        let mut state = self.state.lock().await;
        if state.destroyed {
            return Ok(None);
        }
        if let Some(client) = state.clients.get_mut(&from) {
            client.last_active = Instant::now();
        }

        match msg {
            SyncPayload::StateVector(sv) => {
                let sv = StateVector::decode_v1(&sv)
                    .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
                let diff = {
                    let txn = state.replica.transact();
                    txn.encode_diff_v1(&sv)
                };
                let reply = Frame::sync(self.id.as_str(), &SyncPayload::Diff(diff))?.encode()?;
                Ok(Some(reply))
            }
            SyncPayload::Update(bytes) | SyncPayload::Diff(bytes) => {
                let update = Update::decode_v1(&bytes)
                    .map_err(|e| SessionError::Replica(e.to_string()))?;
                let applied = {
                    let mut txn = state.replica.transact_mut();
                    txn.apply_update(update)
                };
                if let Err(e) = applied {
                    self.drain_pending();
                    return Err(SessionError::Replica(e.to_string()));
                }

                let integrated = self.drain_pending();
                if !integrated.is_empty() {
                    state.last_activity = Instant::now();
                    for update in integrated {
                        broadcast_sync(
                            &state.clients,
                            &self.id,
                            &SyncPayload::Update(update),
                            Some(from),
                        );
                    }
                    drop(state);
                    self.fire_update_hook();
                }
                Ok(None)
            }
        }
    }

    /// Apply an inbound presence delta and relay it to every other client.
    ///
    /// Entries written by `from` are attributed to it so a later disconnect
    /// removes exactly those. Presence carries no consistency guarantee and
    /// is never persisted.
    pub async fn handle_awareness_message(
        &self,
        payload: &[u8],
        from: Uuid,
    ) -> Result<(), SessionError> {
        let delta = PresenceDelta::decode(payload)?;
        let mut state = self.state.lock().await;
        if state.destroyed {
            return Ok(());
        }

        for entry in delta.added.iter().chain(delta.updated.iter()) {
            state.presence.insert(entry.client_id, entry.state.clone());
        }
        for id in &delta.removed {
            state.presence.remove(id);
        }

        if let Some(client) = state.clients.get_mut(&from) {
            client.last_active = Instant::now();
            for entry in delta.added.iter().chain(delta.updated.iter()) {
                client.presence_ids.insert(entry.client_id);
            }
            for id in &delta.removed {
                client.presence_ids.remove(id);
            }
        }

        state.last_activity = Instant::now();
        broadcast_awareness(&state.clients, &self.id, &delta, Some(from));
        Ok(())
    }

    /// Hydration path: apply persisted bytes as an initial update, without
    /// broadcasting or scheduling persistence.
    pub async fn apply_initial_state(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let update =
            Update::decode_v1(bytes).map_err(|e| SessionError::Replica(e.to_string()))?;
        let state = self.state.lock().await;
        let applied = {
            let mut txn = state.replica.transact_mut();
            txn.apply_update(update)
        };
        self.drain_pending();
        applied.map_err(|e| SessionError::Replica(e.to_string()))
    }

    /// Full replica state, for persistence and versioning.
    pub async fn encode_full_state(&self) -> Vec<u8> {
        let state = self.state.lock().await;
        let txn = state.replica.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Compact summary of what this replica has seen.
    pub async fn state_vector(&self) -> Vec<u8> {
        let state = self.state.lock().await;
        let txn = state.replica.transact();
        txn.state_vector().encode_v1()
    }

    /// Force-close and remove clients silent for longer than `timeout`.
    ///
    /// Covers connections that died without a close event (suspended tab,
    /// crashed process). Returns the evicted connection ids.
    pub async fn evict_idle_clients(
        &self,
        timeout: Duration,
        code: u16,
        reason: &str,
    ) -> Vec<Uuid> {
        let mut state = self.state.lock().await;
        let stale: Vec<Uuid> = state
            .clients
            .iter()
            .filter(|(_, c)| c.last_active.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            if let Some(client) = state.clients.remove(id) {
                client.channel.close(code, reason);
                let gone: Vec<u64> = client
                    .presence_ids
                    .iter()
                    .copied()
                    .filter(|pid| state.presence.remove(pid).is_some())
                    .collect();
                if !gone.is_empty() {
                    broadcast_awareness(
                        &state.clients,
                        &self.id,
                        &PresenceDelta::removal_of(gone),
                        None,
                    );
                }
            }
        }
        stale
    }

    /// Tear down the session: announce removal of all presence entries to
    /// any still-open channels, then clear clients and presence. Idempotent.
    pub async fn destroy(&self) {
        let mut state = self.state.lock().await;
        if state.destroyed {
            return;
        }
        state.destroyed = true;

        let all: Vec<u64> = state.presence.keys().copied().collect();
        if !all.is_empty() {
            log::debug!(
                "session {} closing, dropping {} presence entries",
                self.id,
                all.len()
            );
            broadcast_awareness(&state.clients, &self.id, &PresenceDelta::removal_of(all), None);
        }
        state.presence.clear();
        state.clients.clear();
        self.drain_pending();
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.clients.is_empty()
    }

    pub async fn last_activity(&self) -> Instant {
        self.state.lock().await.last_activity
    }

    pub async fn client_ids(&self) -> Vec<Uuid> {
        self.state.lock().await.clients.keys().copied().collect()
    }

    /// Channel of a connected client, for unicast replies.
    pub async fn channel_of(&self, client_id: &Uuid) -> Option<Arc<dyn ClientChannel>> {
        self.state
            .lock()
            .await
            .clients
            .get(client_id)
            .map(|c| c.channel.clone())
    }

    pub async fn presence_len(&self) -> usize {
        self.state.lock().await.presence.len()
    }

    fn drain_pending(&self) -> Vec<Vec<u8>> {
        match self.pending.lock() {
            Ok(mut buf) => std::mem::take(&mut *buf),
            Err(_) => Vec::new(),
        }
    }

    fn fire_update_hook(&self) {
        if let Ok(slot) = self.update_hook.lock() {
            if let Some(hook) = slot.as_ref() {
                hook();
            }
        }
    }
}

fn send_sync(channel: &dyn ClientChannel, document_id: &str, payload: &SyncPayload) {
    match Frame::sync(document_id, payload).and_then(|f| f.encode()) {
        Ok(bytes) => {
            if channel.is_open() {
                channel.send(&bytes);
            }
        }
        Err(e) => log::warn!("failed to encode sync frame for {document_id}: {e}"),
    }
}

fn send_awareness(channel: &dyn ClientChannel, document_id: &str, delta: &PresenceDelta) {
    match Frame::awareness(document_id, delta).and_then(|f| f.encode()) {
        Ok(bytes) => {
            if channel.is_open() {
                channel.send(&bytes);
            }
        }
        Err(e) => log::warn!("failed to encode awareness frame for {document_id}: {e}"),
    }
}

fn broadcast_sync(
    clients: &HashMap<Uuid, ConnectedClient>,
    document_id: &str,
    payload: &SyncPayload,
    skip: Option<Uuid>,
) {
    let bytes = match Frame::sync(document_id, payload).and_then(|f| f.encode()) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("failed to encode sync broadcast for {document_id}: {e}");
            return;
        }
    };
    fan_out(clients, &bytes, skip);
}

fn broadcast_awareness(
    clients: &HashMap<Uuid, ConnectedClient>,
    document_id: &str,
    delta: &PresenceDelta,
    skip: Option<Uuid>,
) {
    let bytes = match Frame::awareness(document_id, delta).and_then(|f| f.encode()) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("failed to encode awareness broadcast for {document_id}: {e}");
            return;
        }
    };
    fan_out(clients, &bytes, skip);
}

/// Fire-and-forget fan-out. A closed or slow channel is skipped, never
/// removed here — removal is driven by disconnect or the inactivity sweep.
fn fan_out(clients: &HashMap<Uuid, ConnectedClient>, bytes: &[u8], skip: Option<Uuid>) {
    for (id, client) in clients {
        if Some(*id) == skip {
            continue;
        }
        if client.channel.is_open() {
            client.channel.send(bytes);
        }
    }
}

/// Session errors.
#[derive(Debug, Clone)]
pub enum SessionError {
    /// Malformed frame or payload
    Protocol(ProtocolError),
    /// The replica rejected an update
    Replica(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Replica(e) => write!(f, "Replica error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e)
    }
}
