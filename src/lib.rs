//! The Small POS - offline transaction buffering and realtime cache sync
//!
//! Lets a register complete sales while the terminal is offline, replays the
//! buffered sales once connectivity returns, and keeps client-side cached
//! query results in step with backend row changes.
//!
//! Embed [`SyncContext`] directly, or run the `pos-sync` daemon which wires
//! it to the environment via [`run`].

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

pub mod api;
pub mod cache;
pub mod cache_keys;
pub mod clock;
pub mod config;
pub mod context;
pub mod db;
pub mod debounce;
pub mod error;
pub mod logging;
pub mod network;
pub mod notify;
pub mod offline;
pub mod realtime;
pub mod refresher;

pub use config::SyncConfig;
pub use context::SyncContext;
pub use error::{ChannelError, ConfigError, OfflineError, StoreError, SubmitError};
pub use notify::{Notice, Notifier};
pub use offline::{SaleOutcome, SyncReport, SyncRun};

/// Daemon entry point: configure from the environment, start the sync
/// context, and log notices until Ctrl-C.
pub fn run() -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;

    // Keep the guard alive for the lifetime of the process; dropping it
    // flushes the file writer.
    let _log_guard = logging::init(&config.log_dir())?;

    info!(
        "Starting pos-sync v{} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_GIT_SHA")
    );
    info!(?config, "Configuration loaded");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let notifier = Notifier::new();
        let mut notices = notifier.subscribe();
        let ctx = SyncContext::start_with(config, notifier, clock::system())?;

        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!("Failed to listen for Ctrl-C: {e}");
                    }
                    break;
                }
                notice = notices.recv() => match notice {
                    Ok(n) if n.is_warning() => warn!(notice = %n, "notice"),
                    Ok(n) => info!(notice = %n, "notice"),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "notice log fell behind"),
                    Err(RecvError::Closed) => break,
                },
            }
        }

        ctx.shutdown().await;
        Ok(())
    })
}
