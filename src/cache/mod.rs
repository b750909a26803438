use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::trace;

/// Expiring map from 32-bit keys to opaque values, backing the
/// upstream sticky cache.
///
/// Entries live for the default TTL from insertion (or the last
/// `reset_ttl`). A background sweeper drops expired entries; `get`
/// treats a past-deadline entry as absent, so the sweep cadence never
/// changes what callers observe.
///
/// Every operation is safe to call from any task. Atomicity across a
/// `get` + `insert` pair is the enclosing pool mutex's job.
pub struct ExpiringMap<V> {
    entries: DashMap<u32, ExpiringEntry<V>>,
    ttl: Duration,
    sweep_interval: Duration,
}

struct ExpiringEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> ExpiringEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

impl<V: Clone + Send + Sync + 'static> ExpiringMap<V> {
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            sweep_interval,
        }
    }

    /// Store `value` under `key` with a fresh TTL, replacing any
    /// previous entry.
    pub fn insert(&self, key: u32, value: V) {
        self.entries.insert(
            key,
            ExpiringEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Fetch the live value for `key`. Reading does not extend the
    /// TTL.
    pub fn get(&self, key: u32) -> Option<V> {
        let now = Instant::now();
        self.entries
            .get(&key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Give an existing entry a fresh TTL. Missing keys are a no-op.
    pub fn reset_ttl(&self, key: u32) {
        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.expires_at = Instant::now() + self.ttl;
        }
    }

    pub fn remove(&self, key: u32) {
        self.entries.remove(&key);
    }

    /// Snapshot of the currently stored keys.
    pub fn keys(&self) -> Vec<u32> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    /// Keep only entries whose value satisfies the predicate.
    pub fn retain(&self, mut keep: impl FnMut(&V) -> bool) {
        self.entries.retain(|_, entry| keep(&entry.value));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry whose deadline has passed.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }

    /// Periodic sweep loop. Runs until the shutdown broadcast fires.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = ticker.tick() => {
                    let before = self.entries.len();
                    self.sweep();
                    let swept = before.saturating_sub(self.entries.len());
                    if swept > 0 {
                        trace!(swept, "expired cache entries removed");
                    }
                }
            }
        }
    }
}
