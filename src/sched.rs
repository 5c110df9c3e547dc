//! Schedule-or-reset delayed actions keyed by document id.
//!
//! Backs the registry's debounced persistence: every replica mutation resets
//! the per-document timer, and only a quiet period lets the write run. One
//! write per pause instead of one per keystroke.
//!
//! Scheduling restarts the timer, it does not extend it — a continuously
//! edited document defers its action until editing pauses. Actions for the
//! same key are serialized through a per-key gate; actions for different
//! keys run concurrently.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct DebouncerInner {
    timers: HashMap<String, Timer>,
    /// Per-key write gates. A gate outlives its timer so a rescheduled
    /// action can never overlap an in-flight one for the same key.
    gates: HashMap<String, Arc<Mutex<()>>>,
    next_generation: u64,
}

/// Debounced per-key action scheduler.
pub struct Debouncer {
    delay: Duration,
    inner: Arc<Mutex<DebouncerInner>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: Arc::new(Mutex::new(DebouncerInner::default())),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedule `action` to run after the quiet period, restarting any timer
    /// already pending for `key`.
    pub async fn schedule<F, Fut>(&self, key: &str, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let delay = self.delay;
        let inner = self.inner.clone();
        let key_owned = key.to_string();

        let mut guard = self.inner.lock().await;
        if let Some(previous) = guard.timers.remove(key) {
            previous.handle.abort();
        }
        let generation = guard.next_generation;
        guard.next_generation += 1;
        let gate = guard
            .gates
            .entry(key_owned.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let _write = gate.lock().await;
                action().await;
            }
            let mut guard = inner.lock().await;
            if guard
                .timers
                .get(&key_owned)
                .is_some_and(|t| t.generation == generation)
            {
                guard.timers.remove(&key_owned);
            }
        });

        guard.timers.insert(key.to_string(), Timer { generation, handle });
    }

    /// Cancel the pending timer for `key`. Returns whether one existed.
    pub async fn cancel(&self, key: &str) -> bool {
        let mut guard = self.inner.lock().await;
        match guard.timers.remove(key) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// The per-key gate. Callers hold it to order a final write after
    /// cancelling the timer.
    pub async fn write_gate(&self, key: &str) -> Arc<Mutex<()>> {
        let mut guard = self.inner.lock().await;
        guard
            .gates
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop all bookkeeping for `key` (after a final write has gone through).
    pub async fn forget(&self, key: &str) {
        let mut guard = self.inner.lock().await;
        if let Some(timer) = guard.timers.remove(key) {
            timer.handle.abort();
        }
        guard.gates.remove(key);
    }

    /// Abort every pending timer.
    pub async fn cancel_all(&self) {
        let mut guard = self.inner.lock().await;
        for (_, timer) in guard.timers.drain() {
            timer.handle.abort();
        }
        guard.gates.clear();
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.timers.len()
    }
}
