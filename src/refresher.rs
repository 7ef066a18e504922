//! Periodic report refresher.
//!
//! Aggregate reports are not covered by row-level change events, so they are
//! re-validated on a fixed timer while the terminal is online.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::QueryCache;
use crate::cache_keys::REPORT_CACHE_KEYS;
use crate::network::NetworkMonitor;

pub const REPORT_REFRESH_INTERVAL: Duration = Duration::from_secs(120);

pub fn spawn_report_refresher(
    cache: Arc<QueryCache>,
    network: Arc<NetworkMonitor>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Report refresher started (interval: {}s)", interval.as_secs());
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !network.is_online() {
                debug!("Offline, skipping report refresh");
                continue;
            }
            for key in REPORT_CACHE_KEYS {
                cache.invalidate(key);
            }
        }
        info!("Report refresher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_keys::{DAILY_REVENUE, SALES_REPORT};
    use crate::clock::ManualClock;
    use crate::network::ConnectivityEvent;
    use crate::notify::Notifier;

    #[tokio::test(start_paused = true)]
    async fn test_invalidates_reports_only_while_online() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = Arc::new(QueryCache::new(None, 1_000, clock.clone()));
        let network = Arc::new(NetworkMonitor::new(false, clock, Notifier::new()));
        let cancel = CancellationToken::new();
        let task = spawn_report_refresher(
            cache.clone(),
            network.clone(),
            REPORT_REFRESH_INTERVAL,
            cancel.clone(),
        );

        tokio::time::sleep(REPORT_REFRESH_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(cache.invalidation_count(DAILY_REVENUE), 0);

        network.handle_event(ConnectivityEvent::Online);
        tokio::time::sleep(REPORT_REFRESH_INTERVAL * 2).await;
        assert_eq!(cache.invalidation_count(DAILY_REVENUE), 2);
        assert_eq!(cache.invalidation_count(SALES_REPORT), 2);

        cancel.cancel();
        task.await.unwrap();
    }
}
