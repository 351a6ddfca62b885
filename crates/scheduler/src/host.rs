//! Per-host running-connection counts.

use indexmap::IndexMap;

/// Tracks how many connections are currently running per host.
/// Entries exist only while the count is nonzero; queued (WAIT)
/// requests never appear here.
#[derive(Debug, Default)]
pub struct HostTracker {
    counts: IndexMap<String, u32>,
}

impl HostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more running connection for `host`.
    pub fn increment(&mut self, host: &str) {
        *self.counts.entry(host.to_string()).or_insert(0) += 1;
    }

    /// Record one less running connection for `host`. Decrementing a
    /// host with no entry is an internal bug: reported and ignored so
    /// the count never goes negative.
    pub fn decrement(&mut self, host: &str) {
        match self.counts.get_mut(host) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.counts.shift_remove(host);
            }
            None => {
                tracing::error!(host, "host connection count underflow");
            }
        }
    }

    /// Running connections for `host`.
    pub fn count(&self, host: &str) -> u32 {
        self.counts.get(host).copied().unwrap_or(0)
    }

    /// Sum of all per-host counts.
    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    /// Number of hosts with at least one running connection.
    pub fn hosts(&self) -> usize {
        self.counts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_entries() {
        let mut tracker = HostTracker::new();
        assert_eq!(tracker.count("example.com"), 0);
        tracker.increment("example.com");
        tracker.increment("example.com");
        assert_eq!(tracker.count("example.com"), 2);
        assert_eq!(tracker.hosts(), 1);
        tracker.decrement("example.com");
        tracker.decrement("example.com");
        assert_eq!(tracker.count("example.com"), 0);
        assert_eq!(tracker.hosts(), 0);
    }

    #[test]
    fn test_underflow_is_clamped() {
        let mut tracker = HostTracker::new();
        tracker.decrement("example.com");
        assert_eq!(tracker.count("example.com"), 0);
        tracker.increment("example.com");
        assert_eq!(tracker.count("example.com"), 1);
    }

    #[test]
    fn test_total() {
        let mut tracker = HostTracker::new();
        tracker.increment("a.com");
        tracker.increment("b.com");
        tracker.increment("b.com");
        assert_eq!(tracker.total(), 3);
    }
}
