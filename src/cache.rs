//! Client-side query cache.
//!
//! Holds the last fetched result for each query key together with a validity
//! flag. Two independent ways of reacting to a backend change:
//!
//! - [`QueryCache::patch`] edits the cached collection in place so readers
//!   see the change without a round trip, and
//! - [`QueryCache::invalidate`] marks the entry stale so the next read
//!   refetches.
//!
//! Successful fetches are written through to the durable store, which backs
//! reads when the network is gone.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::db::Store;

const SIGNAL_BUS_CAPACITY: usize = 128;

/// Emitted for every cache state change so views can re-read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheSignal {
    Invalidated(String),
    RefreshRequested(String),
    Patched(String),
}

/// In-place edit of a cached collection, keyed by each row's `id`.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    /// Append unless a row with the same id is already present.
    Insert(Value),
    /// Replace the row with the same id.
    Update(Value),
    /// Remove the row with this id.
    Delete(Value),
}

/// Where a [`QueryCache::fetch_with`] result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    /// Valid in-memory entry, no fetch made.
    Memory,
    /// Fresh from the backend.
    Network,
    /// Fetch failed; served from the durable store within its TTL.
    Persisted,
    /// Fetch failed; served from the stale in-memory entry.
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead {
    pub data: Value,
    pub source: CacheSource,
}

#[derive(Debug, Clone)]
struct CachedQuery {
    data: Value,
    valid: bool,
    fetched_at: i64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, CachedQuery>,
    invalidations: HashMap<String, u64>,
}

pub struct QueryCache {
    inner: Mutex<Inner>,
    signals: broadcast::Sender<CacheSignal>,
    store: Option<Arc<Store>>,
    persist_ttl_millis: i64,
    clock: SharedClock,
}

impl QueryCache {
    pub fn new(store: Option<Arc<Store>>, persist_ttl_millis: i64, clock: SharedClock) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_BUS_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            signals,
            store,
            persist_ttl_millis,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The map holds plain data; a panic mid-update leaves it usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheSignal> {
        self.signals.subscribe()
    }

    pub fn set(&self, key: &str, data: Value) {
        let now = self.clock.now_ms();
        self.lock().entries.insert(
            key.to_string(),
            CachedQuery {
                data,
                valid: true,
                fetched_at: now,
            },
        );
    }

    /// Cached data regardless of validity.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().entries.get(key).map(|e| e.data.clone())
    }

    pub fn is_valid(&self, key: &str) -> bool {
        self.lock().entries.get(key).is_some_and(|e| e.valid)
    }

    pub fn fetched_at(&self, key: &str) -> Option<i64> {
        self.lock().entries.get(key).map(|e| e.fetched_at)
    }

    /// Number of invalidations applied to `key` since startup.
    pub fn invalidation_count(&self, key: &str) -> u64 {
        self.lock().invalidations.get(key).copied().unwrap_or(0)
    }

    /// Mark the entry stale; the next read refetches.
    pub fn invalidate(&self, key: &str) {
        {
            let mut inner = self.lock();
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.valid = false;
            }
            *inner.invalidations.entry(key.to_string()).or_insert(0) += 1;
        }
        debug!(key, "cache invalidated");
        let _ = self.signals.send(CacheSignal::Invalidated(key.to_string()));
    }

    /// Invalidate and ask listeners to refetch right away.
    pub fn force_refresh(&self, key: &str) {
        self.invalidate(key);
        let _ = self
            .signals
            .send(CacheSignal::RefreshRequested(key.to_string()));
    }

    /// Apply an optimistic edit to a cached array. Returns whether the
    /// cached data changed. Missing entries and non-array data are left
    /// alone; validity is not touched.
    pub fn patch(&self, key: &str, op: PatchOp) -> bool {
        let changed = {
            let mut inner = self.lock();
            let Some(Value::Array(rows)) = inner.entries.get_mut(key).map(|e| &mut e.data) else {
                return false;
            };
            apply_patch(rows, op)
        };
        if changed {
            let _ = self.signals.send(CacheSignal::Patched(key.to_string()));
        }
        changed
    }

    /// Read through the cache.
    ///
    /// 1. A valid in-memory entry is returned without fetching.
    /// 2. Otherwise the fetcher runs; its result is cached and persisted.
    /// 3. On fetch failure, fall back to the durable store entry (if within
    ///    TTL), then to stale in-memory data, else return the error.
    pub async fn fetch_with<F, Fut, E>(&self, key: &str, fetcher: F) -> Result<CacheRead, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: Display,
    {
        if let Some(data) = self.valid_data(key) {
            return Ok(CacheRead {
                data,
                source: CacheSource::Memory,
            });
        }

        match fetcher().await {
            Ok(data) => {
                self.set(key, data.clone());
                if let Some(store) = self.store.as_deref() {
                    if let Err(e) = store.put_cache_entry(key, &data, self.persist_ttl_millis) {
                        warn!(key, error = %e, "failed to persist query result");
                    }
                }
                Ok(CacheRead {
                    data,
                    source: CacheSource::Network,
                })
            }
            Err(err) => {
                warn!(key, error = %err, "query fetch failed, trying offline copies");
                if let Some(entry) = self.persisted(key) {
                    return Ok(CacheRead {
                        data: entry,
                        source: CacheSource::Persisted,
                    });
                }
                match self.get(key) {
                    Some(data) => Ok(CacheRead {
                        data,
                        source: CacheSource::Stale,
                    }),
                    None => Err(err),
                }
            }
        }
    }

    fn valid_data(&self, key: &str) -> Option<Value> {
        self.lock()
            .entries
            .get(key)
            .filter(|e| e.valid)
            .map(|e| e.data.clone())
    }

    fn persisted(&self, key: &str) -> Option<Value> {
        let store = self.store.as_deref()?;
        match store.get_cache_entry(key) {
            Ok(entry) => entry.map(|e| e.data),
            Err(e) => {
                warn!(key, error = %e, "failed to read persisted query result");
                None
            }
        }
    }
}

fn row_id(row: &Value) -> Option<&Value> {
    row.get("id").filter(|id| !id.is_null())
}

fn apply_patch(rows: &mut Vec<Value>, op: PatchOp) -> bool {
    match op {
        PatchOp::Insert(row) => {
            let Some(id) = row_id(&row) else {
                return false;
            };
            if rows.iter().any(|r| row_id(r) == Some(id)) {
                return false;
            }
            rows.push(row);
            true
        }
        PatchOp::Update(row) => {
            let Some(id) = row_id(&row).cloned() else {
                return false;
            };
            match rows.iter_mut().find(|r| row_id(r) == Some(&id)) {
                Some(existing) => {
                    *existing = row;
                    true
                }
                None => false,
            }
        }
        PatchOp::Delete(id) => {
            let before = rows.len();
            rows.retain(|r| row_id(r) != Some(&id));
            rows.len() != before
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn test_cache() -> QueryCache {
        QueryCache::new(None, 60_000, Arc::new(ManualClock::new(0)))
    }

    #[test]
    fn test_invalidate_marks_stale_and_counts() {
        let cache = test_cache();
        cache.set("transactions", json!([]));
        assert!(cache.is_valid("transactions"));

        cache.invalidate("transactions");
        assert!(!cache.is_valid("transactions"));
        assert_eq!(cache.get("transactions"), Some(json!([])));
        assert_eq!(cache.invalidation_count("transactions"), 1);
        assert_eq!(cache.invalidation_count("customers"), 0);
    }

    #[test]
    fn test_force_refresh_emits_both_signals() {
        let cache = test_cache();
        let mut rx = cache.subscribe();
        cache.force_refresh("daily-revenue");
        assert_eq!(
            rx.try_recv().unwrap(),
            CacheSignal::Invalidated("daily-revenue".into())
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            CacheSignal::RefreshRequested("daily-revenue".into())
        );
    }

    #[test]
    fn test_patch_insert_is_append_if_absent() {
        let cache = test_cache();
        cache.set("customers", json!([{ "id": 1, "name": "Ada" }]));
        assert!(cache.patch("customers", PatchOp::Insert(json!({ "id": 2, "name": "Lin" }))));
        assert!(!cache.patch("customers", PatchOp::Insert(json!({ "id": 2, "name": "Dup" }))));
        assert_eq!(
            cache.get("customers"),
            Some(json!([{ "id": 1, "name": "Ada" }, { "id": 2, "name": "Lin" }]))
        );
    }

    #[test]
    fn test_patch_update_replaces_by_id_and_delete_removes() {
        let cache = test_cache();
        cache.set("inventory", json!([{ "id": "a", "qty": 1 }, { "id": "b", "qty": 5 }]));

        assert!(cache.patch("inventory", PatchOp::Update(json!({ "id": "b", "qty": 4 }))));
        assert!(!cache.patch("inventory", PatchOp::Update(json!({ "id": "z", "qty": 4 }))));
        assert!(cache.patch("inventory", PatchOp::Delete(json!("a"))));

        assert_eq!(cache.get("inventory"), Some(json!([{ "id": "b", "qty": 4 }])));
    }

    #[test]
    fn test_patch_leaves_validity_alone() {
        let cache = test_cache();
        cache.set("shifts", json!([]));
        cache.invalidate("shifts");
        cache.patch("shifts", PatchOp::Insert(json!({ "id": 9 })));
        assert!(!cache.is_valid("shifts"));
        assert!(!cache.patch("missing", PatchOp::Insert(json!({ "id": 9 }))));
    }

    #[tokio::test]
    async fn test_fetch_with_uses_valid_entry_then_refetches_after_invalidate() {
        let cache = test_cache();
        let first = cache
            .fetch_with("gift-cards", || async { Ok::<_, String>(json!([1])) })
            .await
            .unwrap();
        assert_eq!(first.source, CacheSource::Network);

        let second = cache
            .fetch_with("gift-cards", || async { Err::<Value, _>("unused".to_string()) })
            .await
            .unwrap();
        assert_eq!(second.source, CacheSource::Memory);

        cache.invalidate("gift-cards");
        let third = cache
            .fetch_with("gift-cards", || async { Ok::<_, String>(json!([1, 2])) })
            .await
            .unwrap();
        assert_eq!(third.source, CacheSource::Network);
        assert_eq!(third.data, json!([1, 2]));
    }

    #[tokio::test]
    async fn test_fetch_with_falls_back_to_persisted_then_stale() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(Store::open_in_memory(clock.clone()).unwrap());
        let cache = QueryCache::new(Some(store.clone()), 1_000, clock.clone());

        cache
            .fetch_with("services", || async { Ok::<_, String>(json!(["cut"])) })
            .await
            .unwrap();
        cache.invalidate("services");

        let offline = cache
            .fetch_with("services", || async { Err::<Value, _>("offline".to_string()) })
            .await
            .unwrap();
        assert_eq!(offline.source, CacheSource::Persisted);

        clock.set(5_000);
        let stale = cache
            .fetch_with("services", || async { Err::<Value, _>("offline".to_string()) })
            .await
            .unwrap();
        assert_eq!(stale.source, CacheSource::Stale);
        assert_eq!(stale.data, json!(["cut"]));

        let miss = cache
            .fetch_with("nothing", || async { Err::<Value, _>("offline".to_string()) })
            .await;
        assert_eq!(miss.unwrap_err(), "offline");
    }
}
