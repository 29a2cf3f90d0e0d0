//! Per-flow retry accounting and backoff

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Default retry limit per flow
pub const DEFAULT_RETRY_LIMIT: u32 = 5;

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Retry counters keyed by flow identifier
pub struct RetryTable {
    limit: u32,
    counts: Mutex<HashMap<String, u32>>,
}

impl RetryTable {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// True while the flow has not used up its retries.
    pub fn should_retry(&self, id: &str) -> bool {
        self.attempts(id) < self.limit
    }

    /// Record a failure, returning the new count. Saturates at the limit.
    pub fn increment(&self, id: &str) -> u32 {
        let mut counts = self.counts.lock();
        let count = counts.entry(id.to_string()).or_insert(0);
        *count = (*count + 1).min(self.limit);
        *count
    }

    pub fn attempts(&self, id: &str) -> u32 {
        self.counts.lock().get(id).copied().unwrap_or(0)
    }

    pub fn reset(&self, id: &str) {
        self.counts.lock().remove(id);
    }

    pub fn clear(&self) {
        self.counts.lock().clear();
    }

    /// Flows with a non-zero count
    pub fn len(&self) -> usize {
        self.counts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of all counts
    pub fn total(&self) -> u64 {
        self.counts.lock().values().map(|c| *c as u64).sum()
    }
}

impl Default for RetryTable {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_LIMIT)
    }
}

/// Delay before retry `attempt` (1-based): 100ms doubling, capped at 5s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    BACKOFF_BASE
        .checked_mul(1 << shift)
        .map(|d| d.min(BACKOFF_MAX))
        .unwrap_or(BACKOFF_MAX)
}

/// Sleep for `delay` unless stop is signalled first.
///
/// Returns false when interrupted.
pub async fn wait_backoff(delay: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    if *stop.borrow() {
        return false;
    }

    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = stop.changed() => false,
    }
}
