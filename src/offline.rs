//! Offline queue manager.
//!
//! Completing a sale goes straight to the backend while online. Otherwise
//! (or when that submit fails) the sale is appended to the durable store,
//! and a drain replays the buffered sales in insertion order once the
//! terminal is back online.
//!
//! A drain is single-flight: a second request while one is running returns
//! [`SyncRun::AlreadyRunning`] without reading the queue, so no record can
//! be submitted twice by this process.

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::TransactionSubmitter;
use crate::cache::QueryCache;
use crate::cache_keys::OFFLINE_SYNC_KEYS;
use crate::clock::SharedClock;
use crate::db::{NewPendingTransaction, Store};
use crate::error::{OfflineError, StoreError};
use crate::network::{NetworkMonitor, NetworkTransition};
use crate::notify::{Notice, Notifier};

/// Default cap on rows submitted by one drain pass.
pub const DEFAULT_MAX_BATCH: usize = 500;

/// Rows fetched from the store per cursor page.
const DRAIN_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRun {
    Completed(SyncReport),
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaleOutcome {
    /// Accepted by the backend; carries its response body.
    Submitted(Value),
    /// Buffered locally under this id.
    SavedOffline(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub buffering_enabled: bool,
    pub pending: Option<u64>,
    pub sync_in_progress: bool,
    pub last_report: Option<SyncReport>,
    pub last_sync_at: Option<i64>,
}

/// Clears the in-flight flag when the drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct OfflineQueue<S: TransactionSubmitter> {
    store: Option<Arc<Store>>,
    submitter: Arc<S>,
    cache: Arc<QueryCache>,
    network: Arc<NetworkMonitor>,
    notifier: Notifier,
    clock: SharedClock,
    max_batch: usize,
    in_flight: AtomicBool,
    last_run: Mutex<Option<(SyncReport, i64)>>,
}

impl<S: TransactionSubmitter> OfflineQueue<S> {
    pub fn new(
        store: Option<Arc<Store>>,
        submitter: Arc<S>,
        cache: Arc<QueryCache>,
        network: Arc<NetworkMonitor>,
        notifier: Notifier,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            submitter,
            cache,
            network,
            notifier,
            clock,
            max_batch: DEFAULT_MAX_BATCH,
            in_flight: AtomicBool::new(false),
            last_run: Mutex::new(None),
        }
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    pub fn buffering_enabled(&self) -> bool {
        self.store.is_some()
    }

    // -----------------------------------------------------------------------
    // Capture
    // -----------------------------------------------------------------------

    /// Buffer a sale for later submission. The user always hears about the
    /// result: a "saved offline" notice, or a storage warning on failure.
    pub fn save_offline_transaction(
        &self,
        payload: Value,
        line_items: Vec<Value>,
    ) -> Result<i64, OfflineError> {
        self.save_with_key(uuid::Uuid::new_v4().to_string(), payload, line_items)
    }

    fn save_with_key(
        &self,
        idempotency_key: String,
        payload: Value,
        line_items: Vec<Value>,
    ) -> Result<i64, OfflineError> {
        let result = match self.store.as_deref() {
            Some(store) => store
                .append(NewPendingTransaction {
                    idempotency_key,
                    transaction_payload: payload,
                    line_items,
                })
                .map(|row| row.local_id)
                .map_err(OfflineError::from),
            None => Err(OfflineError::BufferingDisabled),
        };

        match &result {
            Ok(local_id) => {
                info!(local_id, "Sale saved offline");
                self.notifier.notify(Notice::SavedOffline { local_id: *local_id });
            }
            Err(e) => {
                error!(error = %e, "Failed to save sale offline");
                self.notifier.notify(Notice::StorageWarning {
                    detail: e.to_string(),
                });
            }
        }
        result
    }

    /// UI entry point for a finished sale.
    ///
    /// Submits directly while online; buffers when offline or when the
    /// direct submit fails. The buffered copy reuses the submit's
    /// idempotency key, so a submit that reached the backend before failing
    /// is not recorded twice.
    pub async fn complete_sale(
        &self,
        payload: Value,
        line_items: Vec<Value>,
    ) -> Result<SaleOutcome, OfflineError> {
        let idempotency_key = uuid::Uuid::new_v4().to_string();

        if !self.network.is_online() {
            debug!("Offline, buffering sale");
            return self
                .save_with_key(idempotency_key, payload, line_items)
                .map(SaleOutcome::SavedOffline);
        }

        let submit_err = match self
            .submitter
            .submit_transaction(&payload, &line_items, &idempotency_key)
            .await
        {
            Ok(body) => return Ok(SaleOutcome::Submitted(body)),
            Err(e) => e,
        };

        warn!(error = %submit_err, "Direct submit failed, buffering sale");
        self.save_with_key(idempotency_key, payload, line_items)
            .map(SaleOutcome::SavedOffline)
            .map_err(|save_err| {
                OfflineError::SaleLost(format!("{submit_err}; offline save failed: {save_err}"))
            })
    }

    // -----------------------------------------------------------------------
    // Drain
    // -----------------------------------------------------------------------

    /// Submit every unsynced sale once, oldest first.
    pub async fn sync_pending_transactions(&self) -> SyncRun {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync already in progress, skipping");
            return SyncRun::AlreadyRunning;
        }
        let _guard = DrainGuard(&self.in_flight);

        let report = match self.store.as_deref() {
            Some(store) => self.drain(store).await,
            None => SyncReport::default(),
        };

        if report.succeeded > 0 {
            for key in OFFLINE_SYNC_KEYS {
                self.cache.invalidate(key);
            }
            self.notifier.notify(Notice::Synced {
                count: report.succeeded,
            });
        }
        if report.failed > 0 {
            self.notifier.notify(Notice::SyncFailed {
                count: report.failed,
            });
        }
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failed,
                "Offline sync finished"
            );
        }

        let now = self.clock.now_ms();
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some((report, now));
        SyncRun::Completed(report)
    }

    async fn drain(&self, store: &Store) -> SyncReport {
        let mut report = SyncReport::default();

        for row in store.pending_cursor(DRAIN_PAGE_SIZE).take(self.max_batch) {
            let row = match row {
                Ok(row) => row,
                Err(StoreError::Corrupt { local_id, detail }) => {
                    // Skip it; the rest of the queue still drains.
                    report.attempted += 1;
                    report.failed += 1;
                    warn!(local_id, %detail, "Skipping unreadable offline transaction");
                    if let Err(store_err) = store.record_failure(local_id, &detail) {
                        warn!(local_id, error = %store_err, "Failed to record sync failure");
                    }
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read pending transactions");
                    self.notifier.notify(Notice::StorageWarning {
                        detail: e.to_string(),
                    });
                    break;
                }
            };
            report.attempted += 1;

            match self
                .submitter
                .submit_transaction(&row.transaction_payload, &row.line_items, &row.idempotency_key)
                .await
            {
                Ok(_) => {
                    report.succeeded += 1;
                    // The backend has the sale; if the flag cannot be
                    // written the idempotency key absorbs the resubmit.
                    if let Err(e) = store.mark_synced(row.local_id) {
                        warn!(local_id = row.local_id, error = %e, "Failed to mark transaction synced");
                        self.notifier.notify(Notice::StorageWarning {
                            detail: e.to_string(),
                        });
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(local_id = row.local_id, error = %e, "Offline transaction sync failed");
                    if let Err(store_err) = store.record_failure(row.local_id, &e.to_string()) {
                        warn!(local_id = row.local_id, error = %store_err, "Failed to record sync failure");
                    }
                }
            }
        }
        report
    }

    pub fn status(&self) -> QueueStatus {
        let pending = self.store.as_deref().and_then(|store| match store.pending_count() {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "Failed to count pending transactions");
                None
            }
        });
        let last = *self.last_run.lock().unwrap_or_else(|e| e.into_inner());
        QueueStatus {
            buffering_enabled: self.buffering_enabled(),
            pending,
            sync_in_progress: self.in_flight.load(Ordering::Acquire),
            last_report: last.map(|(report, _)| report),
            last_sync_at: last.map(|(_, at)| at),
        }
    }
}

/// Run one drain per online transition until cancelled. A drain that has
/// started is allowed to finish.
pub fn spawn_auto_sync<S>(
    queue: Arc<OfflineQueue<S>>,
    mut transitions: broadcast::Receiver<NetworkTransition>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    S: TransactionSubmitter + 'static,
{
    tokio::spawn(async move {
        info!("Auto-sync started");
        loop {
            let transition = tokio::select! {
                _ = cancel.cancelled() => break,
                t = transitions.recv() => t,
            };
            match transition {
                Ok(NetworkTransition::Online) => {}
                Ok(NetworkTransition::Offline) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Auto-sync missed network transitions");
                    if !queue.network.is_online() {
                        continue;
                    }
                }
                Err(RecvError::Closed) => break,
            }
            let _ = queue.sync_pending_transactions().await;
        }
        info!("Auto-sync stopped");
    })
}
