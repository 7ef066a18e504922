//! Per-key invalidation debounce table.
//!
//! Collapses repeated triggers for the same cache key inside a fixed window.
//! The table is swept of expired entries once it grows past a threshold, so
//! long-running sessions do not accumulate keys.

use std::collections::HashMap;
use std::time::Duration;

/// Window inside which repeated invalidations of one key are dropped.
pub const INVALIDATION_DEBOUNCE: Duration = Duration::from_secs(2);

/// Table size that triggers a sweep of expired entries.
pub const DEBOUNCE_SWEEP_THRESHOLD: usize = 256;

#[derive(Debug)]
pub struct Debouncer {
    window_ms: i64,
    sweep_threshold: usize,
    last_fired: HashMap<String, i64>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self::with_sweep_threshold(window, DEBOUNCE_SWEEP_THRESHOLD)
    }

    pub fn with_sweep_threshold(window: Duration, sweep_threshold: usize) -> Self {
        Self {
            window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
            sweep_threshold: sweep_threshold.max(1),
            last_fired: HashMap::new(),
        }
    }

    /// Returns `true` and stamps the key when it is outside the window.
    pub fn should_fire(&mut self, key: &str, now_ms: i64) -> bool {
        if let Some(&last) = self.last_fired.get(key) {
            if now_ms.saturating_sub(last) < self.window_ms {
                return false;
            }
        }
        self.last_fired.insert(key.to_string(), now_ms);
        if self.last_fired.len() > self.sweep_threshold {
            self.sweep(now_ms);
        }
        true
    }

    /// Drop every entry whose window has elapsed.
    pub fn sweep(&mut self, now_ms: i64) {
        let window = self.window_ms;
        self.last_fired
            .retain(|_, last| now_ms.saturating_sub(*last) < window);
    }

    pub fn len(&self) -> usize {
        self.last_fired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_fired.is_empty()
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(INVALIDATION_DEBOUNCE)
    }
}
