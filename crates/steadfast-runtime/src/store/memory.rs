//! In-process counter store.

use async_trait::async_trait;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{CounterStore, StoreError};

/// Writes between opportunistic sweeps of expired keys.
const PURGE_INTERVAL: u64 = 1024;

lazy_static! {
    static ref GLOBAL_STORE: Arc<MemoryCounterStore> = Arc::new(MemoryCounterStore::new());
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Counter store backed by a locked `HashMap`.
///
/// Every operation runs under one lock, so increments are atomic across
/// threads and tasks. Expired keys are dropped lazily when touched, swept
/// every [`PURGE_INTERVAL`] writes, or in bulk with
/// [`purge_expired`](Self::purge_expired).
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
    writes: AtomicU64,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide store shared by executors that were not given one.
    pub fn global() -> Arc<MemoryCounterStore> {
        Arc::clone(&GLOBAL_STORE)
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every key.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl MemoryCounterStore {
    fn sweep_if_due(&self, now: Instant, entries: &mut HashMap<String, Entry>) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % PURGE_INTERVAL == 0 {
            let before = entries.len();
            entries.retain(|_, entry| entry.is_live(now));
            tracing::trace!(removed = before - entries.len(), "Swept expired counters");
        }
    }
}

fn expiry(now: Instant, ttl: Option<Duration>) -> Option<Instant> {
    ttl.and_then(|ttl| now.checked_add(ttl))
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(
        &self,
        key: &str,
        amount: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        self.sweep_if_due(now, &mut entries);

        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.value = entry.value.saturating_add(amount);
                Ok(entry.value)
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: amount,
                        expires_at: expiry(now, ttl),
                    },
                );
                Ok(amount)
            }
        }
    }

    async fn read(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value)),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        self.sweep_if_due(now, &mut entries);
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: expiry(now, ttl),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_increment_from_missing() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.increment("k", 1, None).await.unwrap(), 1);
        assert_eq!(store.increment("k", 2, None).await.unwrap(), 3);
        assert_eq!(store.read("k").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_ttl_set_on_create_only() {
        let store = MemoryCounterStore::new();
        store
            .increment("k", 1, Some(Duration::from_millis(150)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(90)).await;

        // A later increment does not push the expiry out
        store
            .increment("k", 1, Some(Duration::from_millis(150)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(90)).await;

        assert_eq!(store.read("k").await.unwrap(), None);
        assert_eq!(store.increment("k", 1, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_write_resets_value_and_ttl() {
        let store = MemoryCounterStore::new();
        store.increment("k", 5, None).await.unwrap();
        store
            .write("k", 0, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(store.read("k").await.unwrap(), Some(0));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.read("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryCounterStore::new();
        store.write("short", 1, Some(Duration::ZERO)).await.unwrap();
        store.write("long", 1, None).await.unwrap();

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_writes_sweep_expired_keys() {
        let store = MemoryCounterStore::new();
        for i in 0..100 {
            store
                .increment(&format!("stale:{i}"), 1, Some(Duration::ZERO))
                .await
                .unwrap();
        }
        assert_eq!(store.entries.lock().len(), 100);

        for _ in 0..PURGE_INTERVAL {
            store.increment("hot", 1, None).await.unwrap();
        }

        let entries = store.entries.lock();
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("hot"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_do_not_race() {
        let store = Arc::new(MemoryCounterStore::new());

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for _ in 0..10 {
                        store
                            .increment("shared", 1, Some(Duration::from_secs(60)))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.read("shared").await.unwrap(), Some(640));
    }
}
