//! Network status monitor.
//!
//! Single source of truth for online/offline state. Purely event-driven:
//! whoever owns the platform connectivity signal calls
//! [`NetworkMonitor::handle_event`]. The daemon wires the backend health
//! probe in as that signal via [`spawn_health_probe`].

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::BackendClient;
use crate::clock::SharedClock;
use crate::notify::{Notice, Notifier};

const TRANSITION_BUS_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub online: bool,
    pub last_online_at: Option<i64>,
    pub last_changed_at: i64,
}

/// Raw connectivity signal from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

/// Fired once per real state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkTransition {
    Online,
    Offline,
}

pub struct NetworkMonitor {
    status: watch::Sender<NetworkStatus>,
    transitions: broadcast::Sender<NetworkTransition>,
    clock: SharedClock,
    notifier: Notifier,
}

impl NetworkMonitor {
    pub fn new(initial_online: bool, clock: SharedClock, notifier: Notifier) -> Self {
        let now = clock.now_ms();
        let (status, _) = watch::channel(NetworkStatus {
            online: initial_online,
            last_online_at: initial_online.then_some(now),
            last_changed_at: now,
        });
        let (transitions, _) = broadcast::channel(TRANSITION_BUS_CAPACITY);
        Self {
            status,
            transitions,
            clock,
            notifier,
        }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status.borrow().online
    }

    pub fn watch(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkTransition> {
        self.transitions.subscribe()
    }

    /// Apply a connectivity event. Repeated events for the current state are
    /// ignored, so each transition is signalled exactly once.
    pub fn handle_event(&self, event: ConnectivityEvent) -> Option<NetworkTransition> {
        let now = self.clock.now_ms();
        let mut fired = None;
        let mut was_ever_online = false;

        self.status.send_if_modified(|status| match (status.online, event) {
            (false, ConnectivityEvent::Online) => {
                was_ever_online = status.last_online_at.is_some();
                status.online = true;
                status.last_online_at = Some(now);
                status.last_changed_at = now;
                fired = Some(NetworkTransition::Online);
                true
            }
            (true, ConnectivityEvent::Offline) => {
                status.online = false;
                status.last_changed_at = now;
                fired = Some(NetworkTransition::Offline);
                true
            }
            _ => false,
        });

        match fired {
            Some(NetworkTransition::Online) => {
                info!("Network online");
                // First contact after startup is not a "back online" moment.
                if was_ever_online {
                    self.notifier.notify(Notice::BackOnline);
                }
            }
            Some(NetworkTransition::Offline) => {
                warn!("Network offline");
                self.notifier.notify(Notice::WentOffline);
            }
            None => debug!(?event, "connectivity event without state change"),
        }

        if let Some(transition) = fired {
            let _ = self.transitions.send(transition);
        }
        fired
    }
}

/// Reachability source polled by [`spawn_health_probe`].
pub trait HealthCheck: Send + Sync {
    fn check_health(&self) -> impl Future<Output = bool> + Send;
}

impl HealthCheck for BackendClient {
    async fn check_health(&self) -> bool {
        BackendClient::check_health(self).await
    }
}

/// Feed the monitor from a health check at a fixed cadence.
///
/// Each probe result is forwarded as a connectivity event; the monitor
/// collapses repeats so only real changes fire.
pub fn spawn_health_probe<H: HealthCheck + 'static>(
    client: Arc<H>,
    monitor: Arc<NetworkMonitor>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Health probe started (interval: {}s)", interval.as_secs());
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let event = if client.check_health().await {
                ConnectivityEvent::Online
            } else {
                ConnectivityEvent::Offline
            };
            monitor.handle_event(event);
        }
        info!("Health probe stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::drain;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted health results, then reports unreachable.
    struct ScriptedHealth(Mutex<VecDeque<bool>>);

    impl HealthCheck for ScriptedHealth {
        async fn check_health(&self) -> bool {
            self.0.lock().unwrap().pop_front().unwrap_or(false)
        }
    }

    fn test_monitor(initial_online: bool) -> (NetworkMonitor, Arc<ManualClock>, Notifier) {
        let clock = Arc::new(ManualClock::new(1_000));
        let notifier = Notifier::new();
        (
            NetworkMonitor::new(initial_online, clock.clone(), notifier.clone()),
            clock,
            notifier,
        )
    }

    #[test]
    fn test_online_transition_stamps_both_timestamps() {
        let (monitor, clock, _) = test_monitor(false);
        clock.set(5_000);
        assert_eq!(
            monitor.handle_event(ConnectivityEvent::Online),
            Some(NetworkTransition::Online)
        );
        let status = monitor.status();
        assert!(status.online);
        assert_eq!(status.last_online_at, Some(5_000));
        assert_eq!(status.last_changed_at, 5_000);
    }

    #[test]
    fn test_offline_transition_keeps_last_online_at() {
        let (monitor, clock, _) = test_monitor(true);
        clock.set(9_000);
        assert_eq!(
            monitor.handle_event(ConnectivityEvent::Offline),
            Some(NetworkTransition::Offline)
        );
        let status = monitor.status();
        assert!(!status.online);
        assert_eq!(status.last_online_at, Some(1_000));
        assert_eq!(status.last_changed_at, 9_000);
    }

    #[test]
    fn test_repeated_events_fire_once() {
        let (monitor, _, _) = test_monitor(false);
        let mut rx = monitor.subscribe();
        assert!(monitor.handle_event(ConnectivityEvent::Online).is_some());
        assert!(monitor.handle_event(ConnectivityEvent::Online).is_none());
        assert!(monitor.handle_event(ConnectivityEvent::Online).is_none());

        assert_eq!(rx.try_recv().unwrap(), NetworkTransition::Online);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_back_online_notice_only_after_prior_online() {
        let (monitor, _, notifier) = test_monitor(false);
        let mut rx = notifier.subscribe();

        monitor.handle_event(ConnectivityEvent::Online);
        monitor.handle_event(ConnectivityEvent::Offline);
        monitor.handle_event(ConnectivityEvent::Online);

        assert_eq!(
            drain(&mut rx),
            vec![Notice::WentOffline, Notice::BackOnline]
        );
    }

    #[test]
    fn test_watch_receiver_sees_latest_status() {
        let (monitor, _, _) = test_monitor(true);
        let rx = monitor.watch();
        monitor.handle_event(ConnectivityEvent::Offline);
        assert!(!rx.borrow().online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_loop_forwards_only_state_changes() {
        let (monitor, _clock, _notifier) = test_monitor(false);
        let monitor = Arc::new(monitor);
        let mut transitions = monitor.subscribe();
        let health = Arc::new(ScriptedHealth(Mutex::new(
            [true, true, true, false, false].into_iter().collect(),
        )));
        let cancel = CancellationToken::new();
        let interval = Duration::from_secs(15);

        let task = spawn_health_probe(health, monitor.clone(), interval, cancel.clone());
        // First tick fires immediately; five checks fit in 4 intervals.
        tokio::time::sleep(interval * 4 + Duration::from_secs(1)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(transitions.try_recv().unwrap(), NetworkTransition::Online);
        assert_eq!(transitions.try_recv().unwrap(), NetworkTransition::Offline);
        assert!(transitions.try_recv().is_err());
        assert!(!monitor.is_online());
    }
}
