//! Turns backend row changes into cache patches and invalidations.

use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

use super::protocol::{redact_for_log, ChangeEvent, ChangeKind};
use crate::cache::{PatchOp, QueryCache};
use crate::cache_keys::{self, LIVE_DASHBOARD_KEYS};
use crate::clock::SharedClock;
use crate::debounce::Debouncer;

/// What one change event did to the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationOutcome {
    pub patched: bool,
    pub invalidated: Vec<&'static str>,
    pub debounced: Vec<&'static str>,
    pub refreshed: Vec<&'static str>,
}

pub struct InvalidationHandler {
    cache: Arc<QueryCache>,
    debouncer: Mutex<Debouncer>,
    clock: SharedClock,
}

impl InvalidationHandler {
    pub fn new(cache: Arc<QueryCache>, clock: SharedClock) -> Self {
        Self::with_debouncer(cache, Debouncer::default(), clock)
    }

    pub fn with_debouncer(cache: Arc<QueryCache>, debouncer: Debouncer, clock: SharedClock) -> Self {
        Self {
            cache,
            debouncer: Mutex::new(debouncer),
            clock,
        }
    }

    pub fn handle(&self, event: &ChangeEvent) -> InvalidationOutcome {
        let mut outcome = InvalidationOutcome::default();
        let Some(keys) = cache_keys::for_table(&event.table) else {
            trace!(table = %event.table, "change for unmapped table ignored");
            return outcome;
        };

        debug!(
            table = %event.table,
            kind = ?event.kind,
            row = %redact_for_log(&event.new_row),
            "realtime change"
        );

        // Patch first so readers woken by the invalidation see the edit.
        if let Some(collection) = keys.collection {
            if let Some(op) = patch_op(event) {
                outcome.patched = self.cache.patch(collection, op);
            }
        }

        let now = self.clock.now_ms();
        {
            let mut debouncer = self.debouncer.lock().unwrap_or_else(|e| e.into_inner());
            for key in keys.invalidates {
                if debouncer.should_fire(key, now) {
                    outcome.invalidated.push(*key);
                } else {
                    outcome.debounced.push(*key);
                }
            }
        }
        for key in &outcome.invalidated {
            self.cache.invalidate(key);
        }

        if event.table == "transactions" && event.kind == ChangeKind::Insert {
            for key in LIVE_DASHBOARD_KEYS {
                self.cache.force_refresh(key);
                outcome.refreshed.push(*key);
            }
        }

        outcome
    }
}

fn patch_op(event: &ChangeEvent) -> Option<PatchOp> {
    match event.kind {
        ChangeKind::Insert if event.new_row.is_object() => Some(PatchOp::Insert(event.new_row.clone())),
        ChangeKind::Update if event.new_row.is_object() => Some(PatchOp::Update(event.new_row.clone())),
        ChangeKind::Delete => event.row_id().cloned().map(PatchOp::Delete),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn setup() -> (Arc<QueryCache>, Arc<ManualClock>, InvalidationHandler) {
        let clock = Arc::new(ManualClock::new(0));
        let cache = Arc::new(QueryCache::new(None, 60_000, clock.clone()));
        let handler = InvalidationHandler::new(cache.clone(), clock.clone());
        (cache, clock, handler)
    }

    fn change(table: &str, kind: ChangeKind, new_row: Value, old_row: Value) -> ChangeEvent {
        ChangeEvent {
            table: table.to_string(),
            kind,
            new_row,
            old_row,
        }
    }

    #[test]
    fn test_two_events_inside_window_invalidate_once() {
        let (cache, clock, handler) = setup();
        let ev = change("customers", ChangeKind::Update, json!({ "id": 1 }), Value::Null);

        handler.handle(&ev);
        clock.advance(1_500);
        let second = handler.handle(&ev);

        assert_eq!(cache.invalidation_count(cache_keys::CUSTOMERS), 1);
        assert_eq!(second.debounced, vec![cache_keys::CUSTOMERS]);

        clock.advance(600);
        handler.handle(&ev);
        assert_eq!(cache.invalidation_count(cache_keys::CUSTOMERS), 2);
    }

    #[test]
    fn test_transaction_insert_refreshes_dashboard_without_debounce() {
        let (cache, _clock, handler) = setup();
        cache.set(cache_keys::TRANSACTIONS, json!([]));
        let ev = change("transactions", ChangeKind::Insert, json!({ "id": 10, "total": 4.5 }), Value::Null);

        let first = handler.handle(&ev);
        let second = handler.handle(&change(
            "transactions",
            ChangeKind::Insert,
            json!({ "id": 11 }),
            Value::Null,
        ));

        assert!(first.patched);
        assert_eq!(first.refreshed, LIVE_DASHBOARD_KEYS.to_vec());
        assert_eq!(second.refreshed, LIVE_DASHBOARD_KEYS.to_vec());
        assert_eq!(cache.invalidation_count(cache_keys::DAILY_REVENUE), 2);
        assert_eq!(cache.invalidation_count(cache_keys::TRANSACTIONS), 1);
        assert_eq!(
            cache.get(cache_keys::TRANSACTIONS),
            Some(json!([{ "id": 10, "total": 4.5 }, { "id": 11 }]))
        );
    }

    #[test]
    fn test_update_does_not_refresh_dashboard() {
        let (cache, _clock, handler) = setup();
        let out = handler.handle(&change("transactions", ChangeKind::Update, json!({ "id": 1 }), Value::Null));
        assert!(out.refreshed.is_empty());
        assert_eq!(cache.invalidation_count(cache_keys::DAILY_REVENUE), 0);
    }

    #[test]
    fn test_delete_patches_using_old_row_id() {
        let (cache, _clock, handler) = setup();
        cache.set(cache_keys::GIFT_CARDS, json!([{ "id": 3 }, { "id": 4 }]));
        let out = handler.handle(&change("gift_cards", ChangeKind::Delete, Value::Null, json!({ "id": 3 })));
        assert!(out.patched);
        assert_eq!(cache.get(cache_keys::GIFT_CARDS), Some(json!([{ "id": 4 }])));
        assert!(!cache.is_valid(cache_keys::GIFT_CARDS));
    }

    #[test]
    fn test_unmapped_table_is_ignored() {
        let (_cache, _clock, handler) = setup();
        let out = handler.handle(&change("audit_log", ChangeKind::Insert, json!({ "id": 1 }), Value::Null));
        assert_eq!(out, InvalidationOutcome::default());
    }
}
