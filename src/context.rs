//! Runtime context: builds every sync component, spawns the background
//! tasks, and tears them down again.
//!
//! There are no process-wide singletons. Everything hangs off one
//! [`SyncContext`], so tests (and embedders) can run several side by side.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::BackendClient;
use crate::cache::QueryCache;
use crate::clock::{self, SharedClock};
use crate::config::SyncConfig;
use crate::db::Store;
use crate::error::{OfflineError, SubmitError};
use crate::network::{self, ConnectivityEvent, NetworkMonitor, NetworkTransition};
use crate::notify::{Notice, Notifier};
use crate::offline::{self, OfflineQueue, QueueStatus, SaleOutcome, SyncRun};
use crate::realtime::{ChannelState, HttpStreamTransport, InvalidationHandler, RealtimeManager};
use crate::refresher::{self, REPORT_REFRESH_INTERVAL};

pub struct SyncContext {
    store: Option<Arc<Store>>,
    notifier: Notifier,
    network: Arc<NetworkMonitor>,
    cache: Arc<QueryCache>,
    queue: Arc<OfflineQueue<BackendClient>>,
    invalidation: Arc<InvalidationHandler>,
    channel_state: Option<watch::Receiver<ChannelState>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncContext {
    /// Build and start everything. Must be called inside a tokio runtime.
    pub fn start(config: SyncConfig) -> Result<Self, SubmitError> {
        Self::start_with(config, Notifier::new(), clock::system())
    }

    /// Like [`SyncContext::start`], with a caller-owned notice bus (so
    /// startup warnings are not missed) and clock.
    pub fn start_with(
        config: SyncConfig,
        notifier: Notifier,
        clock: SharedClock,
    ) -> Result<Self, SubmitError> {
        let store = match Store::open(&config.data_dir, clock.clone()) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                error!(error = %e, "Offline store unavailable, buffering disabled");
                notifier.notify(Notice::StorageWarning {
                    detail: e.to_string(),
                });
                None
            }
        };

        let cache = Arc::new(QueryCache::new(
            store.clone(),
            config.cache_ttl_millis(),
            clock.clone(),
        ));
        // Offline until the first probe says otherwise.
        let network = Arc::new(NetworkMonitor::new(false, clock.clone(), notifier.clone()));
        let client = Arc::new(BackendClient::new(
            config.backend_url.as_deref(),
            config.api_key.clone(),
        )?);
        let queue = Arc::new(
            OfflineQueue::new(
                store.clone(),
                client.clone(),
                cache.clone(),
                network.clone(),
                notifier.clone(),
                clock.clone(),
            )
            .with_max_batch(config.max_batch),
        );
        let invalidation = Arc::new(InvalidationHandler::new(cache.clone(), clock));
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        // Subscribe before the probe can fire the first transition.
        tasks.push(offline::spawn_auto_sync(
            queue.clone(),
            network.subscribe(),
            cancel.child_token(),
        ));

        if client.base_url().is_some() {
            tasks.push(network::spawn_health_probe(
                client,
                network.clone(),
                config.health_interval,
                cancel.child_token(),
            ));
        } else {
            warn!("POS_BACKEND_URL not set, every sale will be buffered offline");
        }

        tasks.push(refresher::spawn_report_refresher(
            cache.clone(),
            network.clone(),
            REPORT_REFRESH_INTERVAL,
            cancel.child_token(),
        ));

        let channel_state = match config.realtime_url.as_deref() {
            Some(url) => match HttpStreamTransport::new(url, config.api_key.clone()) {
                Ok(transport) => {
                    let manager =
                        RealtimeManager::new(transport, invalidation.clone(), notifier.clone());
                    let state = manager.state();
                    tasks.push(tokio::spawn(
                        manager.run(network.watch(), cancel.child_token()),
                    ));
                    Some(state)
                }
                Err(e) => {
                    warn!(error = %e, "Realtime transport unavailable");
                    notifier.notify(Notice::RealtimeUnavailable);
                    None
                }
            },
            None => {
                info!("No realtime URL configured, change feed disabled");
                None
            }
        };

        info!(
            buffering = store.is_some(),
            realtime = channel_state.is_some(),
            "Sync context started"
        );

        Ok(Self {
            store,
            notifier,
            network,
            cache,
            queue,
            invalidation,
            channel_state,
            cancel,
            tasks,
        })
    }

    pub fn store(&self) -> Option<&Arc<Store>> {
        self.store.as_ref()
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn invalidation(&self) -> &Arc<InvalidationHandler> {
        &self.invalidation
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notifier.subscribe()
    }

    /// Realtime channel state, if a change feed is configured.
    pub fn channel_state(&self) -> Option<watch::Receiver<ChannelState>> {
        self.channel_state.clone()
    }

    /// Forward a native connectivity signal from the embedding platform.
    pub fn handle_connectivity_event(&self, event: ConnectivityEvent) -> Option<NetworkTransition> {
        self.network.handle_event(event)
    }

    pub async fn complete_sale(
        &self,
        payload: Value,
        line_items: Vec<Value>,
    ) -> Result<SaleOutcome, OfflineError> {
        self.queue.complete_sale(payload, line_items).await
    }

    pub fn save_offline_transaction(
        &self,
        payload: Value,
        line_items: Vec<Value>,
    ) -> Result<i64, OfflineError> {
        self.queue.save_offline_transaction(payload, line_items)
    }

    pub async fn sync_pending_transactions(&self) -> SyncRun {
        self.queue.sync_pending_transactions().await
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    /// Cancel every background task and wait for them. A drain already in
    /// progress runs to completion first.
    pub async fn shutdown(self) {
        info!("Sync context shutting down");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Sync context stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;
    use zeroize::Zeroizing;

    fn offline_config(data_dir: PathBuf) -> SyncConfig {
        SyncConfig {
            data_dir,
            backend_url: None,
            api_key: Zeroizing::new(String::new()),
            realtime_url: None,
            health_interval: Duration::from_secs(15),
            max_batch: 500,
            cache_ttl: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_unconfigured_backend_buffers_sales_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = SyncContext::start_with(
            offline_config(dir.path().to_path_buf()),
            Notifier::new(),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        assert!(ctx.channel_state().is_none());

        let outcome = ctx.complete_sale(json!({ "total": 3.0 }), Vec::new()).await.unwrap();
        assert!(matches!(outcome, SaleOutcome::SavedOffline(_)));
        assert_eq!(ctx.queue_status().pending, Some(1));
        assert!(dir.path().join("offline.db").exists());

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_unopenable_store_disables_buffering_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let notifier = Notifier::new();
        let mut notices = notifier.subscribe();
        let ctx = SyncContext::start_with(
            offline_config(blocker),
            notifier,
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();

        assert!(ctx.store().is_none());
        assert!(!ctx.queue_status().buffering_enabled);
        assert!(notices.try_recv().unwrap().is_warning());

        let err = ctx.save_offline_transaction(json!({}), Vec::new()).unwrap_err();
        assert!(matches!(err, OfflineError::BufferingDisabled));
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_platform_online_event_triggers_drain() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Notifier::new();
        let ctx = SyncContext::start_with(
            offline_config(dir.path().to_path_buf()),
            notifier.clone(),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        ctx.save_offline_transaction(json!({ "n": 1 }), Vec::new()).unwrap();
        let mut notices = notifier.subscribe();

        assert_eq!(
            ctx.handle_connectivity_event(ConnectivityEvent::Online),
            Some(NetworkTransition::Online)
        );
        // No backend configured: the drain runs and the submit fails.
        loop {
            if let Notice::SyncFailed { count } = notices.recv().await.unwrap() {
                assert_eq!(count, 1);
                break;
            }
        }
        assert_eq!(ctx.queue_status().pending, Some(1));
        ctx.shutdown().await;
    }
}
