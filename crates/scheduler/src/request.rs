//! Per-request bookkeeping.

use crate::config::NetworkConfig;
use crate::error::ConnectionError;
use crate::protocol::{CancelHandle, ProtocolData, TlsSession, Transport};
use crate::state::{ConnectionState, LoadPriority, PRIORITY_LEVELS};
use crate::status::SubscriberKey;
use slotmap::new_key_type;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use timer::TimerKey;
use url::Url;

new_key_type! {
    /// Handle to a connection request in the registry.
    pub struct RequestKey;
}

/// How much of a request can be replayed after a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Restartability {
    /// Nothing irreversible happened; full restart is safe.
    Full = 0,
    /// Some data was consumed; a restart may repeat work.
    Partial = 1,
    /// Mid-transfer side effects; never restart.
    Never = 2,
}

/// Whether a request is still coupled to a live caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetachState {
    /// Normal: at least one subscriber owns an interest.
    Attached,
    /// Running on for the cache after the caller went away.
    Background,
    /// Detached and being torn down for a position restart.
    Restarting,
}

/// Cache interaction requested by the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheMode {
    /// Use the cache normally.
    #[default]
    Normal,
    /// Revalidate, ignoring freshness.
    Reload,
    /// Bypass the cache entirely.
    Bypass,
}

bitflags::bitflags! {
    /// Caller-granted permissions for a load.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct LoadFlags: u32 {
        /// Permit degraded transport security the blacklist would flag.
        const ALLOW_INSECURE = 1 << 0;
        /// Never pool or reuse this request's socket.
        const NO_KEEPALIVE = 1 << 1;
    }
}

/// Transfer-rate window for progress displays.
#[derive(Clone, Copy, Debug, Default)]
pub struct RateWindow {
    last_sample: Option<(Instant, u64)>,
    /// Smoothed receive rate in bytes per second.
    pub bytes_per_sec: f64,
    /// Estimated time to completion, when the length is known.
    pub eta: Option<Duration>,
}

impl RateWindow {
    /// Fold a new byte count into the window.
    pub fn sample(&mut self, now: Instant, received: u64, est_length: Option<u64>) {
        if let Some((then, bytes)) = self.last_sample {
            let dt = now.duration_since(then).as_secs_f64();
            if dt > 0.0 {
                let inst = (received.saturating_sub(bytes)) as f64 / dt;
                // Light smoothing so the display does not jump.
                self.bytes_per_sec = if self.bytes_per_sec == 0.0 {
                    inst
                } else {
                    0.7 * self.bytes_per_sec + 0.3 * inst
                };
            }
        }
        self.last_sample = Some((now, received));
        self.eta = est_length.and_then(|total| {
            let remaining = total.saturating_sub(received);
            if self.bytes_per_sec > 0.0 {
                Some(Duration::from_secs_f64(remaining as f64 / self.bytes_per_sec))
            } else {
                None
            }
        });
    }
}

/// One physical network operation, queued or in flight. A single
/// request may be wanted by several subscribers at different
/// priorities; the per-level refcounts record every interest.
pub struct ConnectionRequest {
    /// Monotonically increasing identity.
    pub serial: u64,
    /// Target URL.
    pub url: Url,
    /// Proxy-normalized dedup key.
    pub normalized: String,
    /// URL that originated the (possibly redirected) fetch.
    pub origin_url: Url,
    /// Referrer, if any. Not owned; informational.
    pub referrer: Option<String>,
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Reference counts, indexed by priority level.
    pri: [u32; PRIORITY_LEVELS],
    /// Subscribers sharing this request.
    pub subscribers: Vec<SubscriberKey>,
    /// Attempts so far.
    pub tries: u32,
    /// Set when spliced onto a pooled socket under a one-try policy:
    /// the first failure must be terminal, not silently retried.
    pub pre_exhausted: bool,
    /// Restart safety level.
    pub restartability: Restartability,
    /// Bytes received so far.
    pub received: u64,
    /// Estimated total length, when known.
    pub est_length: Option<u64>,
    /// Byte offset this transfer started from.
    pub start_position: u64,
    /// The socket, while this request owns one.
    pub socket: Option<Box<dyn Transport>>,
    /// TLS session riding on the socket.
    pub tls: Option<TlsSession>,
    /// Attached cache entry id; the cache owns the entry.
    pub cache_token: Option<u64>,
    /// Cache interaction mode.
    pub cache_mode: CacheMode,
    /// Caller-granted permissions.
    pub flags: LoadFlags,
    /// Caller coupling.
    pub detach: DetachState,
    /// Network configuration captured when the request started.
    pub net_snapshot: NetworkConfig,
    /// Resolved addresses and the one currently being tried.
    pub addresses: Vec<IpAddr>,
    pub address_cursor: usize,
    /// Protocol state spliced in from a keepalive slot.
    pub protocol_data: Option<ProtocolData>,
    /// Cancel handle for an in-flight DNS lookup.
    pub dns_cancel: Option<CancelHandle>,
    /// Redirects followed so far, for loop detection.
    pub redirects: u32,
    /// Whether this request occupies a host/global slot.
    pub running: bool,
    /// Last error seen, carried as context across retries.
    pub last_error: Option<ConnectionError>,
    /// When this request was last admitted; victim selection prefers
    /// the least recently scheduled.
    pub last_scheduled: Instant,
    /// Creation time; queue ties break by insertion order.
    pub created: Instant,
    /// Active phase-timeout timer.
    pub timeout_timer: Option<TimerKey>,
    /// Periodic statistics timer, live only while transferring.
    pub stats_timer: Option<TimerKey>,
    /// Last subscriber notification, for throttling.
    pub last_notify: Option<Instant>,
    /// Transfer-rate window.
    pub rate: RateWindow,
}

impl ConnectionRequest {
    pub fn new(
        serial: u64,
        url: Url,
        normalized: String,
        referrer: Option<String>,
        net_snapshot: NetworkConfig,
        now: Instant,
    ) -> Self {
        Self {
            serial,
            origin_url: url.clone(),
            url,
            normalized,
            referrer,
            state: ConnectionState::Wait,
            pri: [0; PRIORITY_LEVELS],
            subscribers: Vec::new(),
            tries: 0,
            pre_exhausted: false,
            restartability: Restartability::Full,
            received: 0,
            est_length: None,
            start_position: 0,
            socket: None,
            tls: None,
            cache_token: None,
            cache_mode: CacheMode::Normal,
            flags: LoadFlags::empty(),
            detach: DetachState::Attached,
            net_snapshot,
            addresses: Vec::new(),
            address_cursor: 0,
            protocol_data: None,
            dns_cancel: None,
            redirects: 0,
            running: false,
            last_error: None,
            last_scheduled: now,
            created: now,
            timeout_timer: None,
            stats_timer: None,
            last_notify: None,
            rate: RateWindow::default(),
        }
    }

    /// Host part of the target URL.
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or("")
    }

    /// Add one interest at `priority`. Overflow is an internal bug:
    /// reported and saturated rather than wrapped.
    pub fn add_ref(&mut self, priority: LoadPriority) {
        let slot = &mut self.pri[priority.index()];
        match slot.checked_add(1) {
            Some(n) => *slot = n,
            None => {
                tracing::error!(serial = self.serial, ?priority, "priority refcount overflow");
            }
        }
    }

    /// Drop one interest at `priority`. Underflow is an internal bug:
    /// reported and clamped to zero, never negative.
    pub fn remove_ref(&mut self, priority: LoadPriority) {
        let slot = &mut self.pri[priority.index()];
        match slot.checked_sub(1) {
            Some(n) => *slot = n,
            None => {
                tracing::error!(serial = self.serial, ?priority, "priority refcount underflow");
            }
        }
    }

    /// Move every interest from one level to another.
    pub fn move_refs(&mut self, from: LoadPriority, to: LoadPriority) {
        let count = self.pri[from.index()];
        self.pri[from.index()] = 0;
        self.pri[to.index()] = self.pri[to.index()].saturating_add(count);
    }

    /// Total interests across all levels.
    pub fn total_refs(&self) -> u32 {
        self.pri.iter().sum()
    }

    /// Most urgent level holding at least one interest. A request with
    /// no interests left is about to be destroyed.
    pub fn effective_priority(&self) -> Option<LoadPriority> {
        self.pri
            .iter()
            .position(|&n| n > 0)
            .and_then(LoadPriority::from_index)
    }

    /// Whether a retry is still permitted. Three independent guards:
    /// mid-transfer side effects, the try budget, and a stale pooled
    /// socket under a one-try policy. Once false, never true again.
    pub fn is_restartable(&self, max_tries: u32) -> bool {
        if self.restartability >= Restartability::Never {
            return false;
        }
        if self.tries + 1 >= max_tries {
            return false;
        }
        if self.pre_exhausted {
            return false;
        }
        true
    }

    /// Next address to try, advancing past the cursor.
    pub fn next_address(&mut self) -> Option<IpAddr> {
        let addr = self.addresses.get(self.address_cursor).copied();
        if addr.is_some() {
            self.address_cursor += 1;
        }
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ConnectionRequest {
        let url = Url::parse("http://example.com/").unwrap();
        ConnectionRequest::new(
            1,
            url.clone(),
            url.to_string(),
            None,
            NetworkConfig::default(),
            Instant::now(),
        )
    }

    #[test]
    fn test_effective_priority_is_most_urgent() {
        let mut req = request();
        req.add_ref(LoadPriority::Low);
        assert_eq!(req.effective_priority(), Some(LoadPriority::Low));
        req.add_ref(LoadPriority::High);
        assert_eq!(req.effective_priority(), Some(LoadPriority::High));
        req.remove_ref(LoadPriority::High);
        assert_eq!(req.effective_priority(), Some(LoadPriority::Low));
    }

    #[test]
    fn test_refcount_underflow_clamps() {
        let mut req = request();
        req.remove_ref(LoadPriority::Normal);
        assert_eq!(req.total_refs(), 0);
        req.add_ref(LoadPriority::Normal);
        assert_eq!(req.total_refs(), 1);
    }

    #[test]
    fn test_restartable_is_monotone() {
        let mut req = request();
        assert!(req.is_restartable(3));
        req.tries = 2;
        assert!(!req.is_restartable(3));
        req.tries = 0;
        req.restartability = Restartability::Never;
        assert!(!req.is_restartable(3));
    }

    #[test]
    fn test_pre_exhausted_blocks_retry_independently() {
        let mut req = request();
        req.pre_exhausted = true;
        assert_eq!(req.restartability, Restartability::Full);
        assert!(!req.is_restartable(3));
    }

    #[test]
    fn test_address_fallback() {
        let mut req = request();
        req.addresses = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        assert_eq!(req.next_address(), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(req.next_address(), Some("10.0.0.2".parse().unwrap()));
        assert_eq!(req.next_address(), None);
    }

    #[test]
    fn test_rate_window_eta() {
        let mut rate = RateWindow::default();
        let t0 = Instant::now();
        rate.sample(t0, 0, Some(1000));
        rate.sample(t0 + Duration::from_secs(1), 100, Some(1000));
        assert!(rate.bytes_per_sec > 0.0);
        assert!(rate.eta.is_some());
    }
}
