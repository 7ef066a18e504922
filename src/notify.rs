//! User-visible notices ("toasts").
//!
//! Components publish onto a broadcast bus; the register front end (or the
//! daemon's log forwarder) subscribes and renders them. Publishing never
//! fails: with no subscribers the notice is dropped.

use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

const NOTICE_BUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    SavedOffline { local_id: i64 },
    Synced { count: u64 },
    SyncFailed { count: u64 },
    BackOnline,
    WentOffline,
    RealtimeUnavailable,
    StorageWarning { detail: String },
}

impl Notice {
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Notice::SyncFailed { .. }
                | Notice::WentOffline
                | Notice::RealtimeUnavailable
                | Notice::StorageWarning { .. }
        )
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::SavedOffline { .. } => {
                write!(f, "Sale saved offline, will sync when back online")
            }
            Notice::Synced { count } => write!(f, "Synced {count} offline transactions"),
            Notice::SyncFailed { count } => write!(f, "Failed to sync {count} transactions"),
            Notice::BackOnline => write!(f, "You're back online"),
            Notice::WentOffline => write!(f, "You're offline"),
            Notice::RealtimeUnavailable => {
                write!(f, "Realtime updates unavailable, please refresh")
            }
            Notice::StorageWarning { detail } => write!(f, "Offline storage problem: {detail}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notice>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_BUS_CAPACITY);
        Self { tx }
    }

    pub fn notify(&self, notice: Notice) {
        debug!(notice = %notice, "notice");
        let _ = self.tx.send(notice);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) fn drain(rx: &mut broadcast::Receiver<Notice>) -> Vec<Notice> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}
