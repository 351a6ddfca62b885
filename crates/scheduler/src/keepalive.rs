//! Keepalive socket pool.
//!
//! Finished connections on reusable protocols park their socket here,
//! keyed by (scheme, keepalive identity, port). A later request with
//! the same key splices the socket in and skips straight past the
//! connect phases. Slots are evicted when stale, expired, or when the
//! pool is over capacity.

use crate::protocol::{ProtocolData, TlsSession, Transport};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// An idle, previously used socket waiting for a matching request.
pub struct KeepAliveSlot {
    /// Scheme of the protocol handler that produced the socket.
    pub scheme: &'static str,
    /// Keepalive identity: `host[:qualifiers]`.
    pub identity: String,
    /// Target port.
    pub port: u16,
    /// The pooled socket.
    pub socket: Box<dyn Transport>,
    /// TLS session riding on the socket, if any.
    pub tls: Option<TlsSession>,
    /// When the slot was added.
    pub added: Instant,
    /// Idle lifetime granted by the protocol handler.
    pub timeout: Duration,
    /// Opaque protocol state to hand back on resumption.
    pub protocol_data: Option<ProtocolData>,
    /// Address-selection snapshot from the finished request.
    pub addresses: Vec<IpAddr>,
}

impl KeepAliveSlot {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.added) >= self.timeout
    }

    /// A peer that becomes readable while the socket is idle has
    /// half-closed or sent unsolicited data; the slot is stale.
    fn is_stale(&self) -> bool {
        self.socket.has_unexpected_input()
    }
}

/// Pool of idle keepalive sockets, oldest first.
pub struct KeepAlivePool {
    slots: Vec<KeepAliveSlot>,
    capacity: usize,
}

impl KeepAlivePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity,
        }
    }

    /// Park a socket. If this pushes the pool over capacity the
    /// least-recently-added slots are evicted immediately.
    pub fn insert(&mut self, slot: KeepAliveSlot) {
        tracing::debug!(
            scheme = slot.scheme,
            identity = %slot.identity,
            port = slot.port,
            "pooling keepalive socket"
        );
        self.slots.push(slot);
        self.enforce_capacity();
    }

    /// Remove and return the first slot matching the key.
    pub fn take(&mut self, scheme: &str, identity: &str, port: u16) -> Option<KeepAliveSlot> {
        let pos = self
            .slots
            .iter()
            .position(|s| s.scheme == scheme && s.identity == identity && s.port == port)?;
        Some(self.slots.remove(pos))
    }

    /// Whether a matching idle slot exists.
    pub fn has_match(&self, scheme: &str, identity: &str, port: u16) -> bool {
        self.slots
            .iter()
            .any(|s| s.scheme == scheme && s.identity == identity && s.port == port)
    }

    /// Evict stale and expired slots, then enforce capacity. Runs at
    /// the start of every scheduling pass.
    pub fn maintain(&mut self, now: Instant) {
        self.slots.retain(|slot| {
            if slot.is_stale() {
                tracing::debug!(identity = %slot.identity, "evicting stale keepalive socket");
                return false;
            }
            if slot.is_expired(now) {
                tracing::debug!(identity = %slot.identity, "evicting expired keepalive socket");
                return false;
            }
            true
        });
        self.enforce_capacity();
    }

    fn enforce_capacity(&mut self) {
        while self.slots.len() > self.capacity {
            let evicted = self.slots.remove(0);
            tracing::debug!(
                identity = %evicted.identity,
                "evicting oldest keepalive socket over capacity"
            );
        }
    }

    /// Drop every pooled socket. Used when the network configuration
    /// changes and existing routes are no longer valid.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Number of pooled sockets.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSocket {
        readable: bool,
    }

    impl Transport for FakeSocket {
        fn has_unexpected_input(&self) -> bool {
            self.readable
        }
    }

    fn slot(identity: &str, readable: bool, added: Instant) -> KeepAliveSlot {
        KeepAliveSlot {
            scheme: "http",
            identity: identity.to_string(),
            port: 80,
            socket: Box::new(FakeSocket { readable }),
            tls: None,
            added,
            timeout: Duration::from_secs(60),
            protocol_data: None,
            addresses: Vec::new(),
        }
    }

    #[test]
    fn test_take_matches_full_key() {
        let now = Instant::now();
        let mut pool = KeepAlivePool::new(4);
        pool.insert(slot("a.com", false, now));
        assert!(pool.take("http", "a.com", 8080).is_none());
        assert!(pool.take("ftp", "a.com", 80).is_none());
        assert!(pool.take("http", "a.com", 80).is_some());
        // Gone after one reuse.
        assert!(pool.take("http", "a.com", 80).is_none());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let now = Instant::now();
        let mut pool = KeepAlivePool::new(2);
        pool.insert(slot("a.com", false, now));
        pool.insert(slot("b.com", false, now));
        pool.insert(slot("c.com", false, now));
        assert_eq!(pool.len(), 2);
        assert!(!pool.has_match("http", "a.com", 80));
        assert!(pool.has_match("http", "b.com", 80));
        assert!(pool.has_match("http", "c.com", 80));
    }

    #[test]
    fn test_maintain_evicts_stale_and_expired() {
        let now = Instant::now();
        let mut pool = KeepAlivePool::new(8);
        pool.insert(slot("stale.com", true, now));
        pool.insert(slot("old.com", false, now - Duration::from_secs(120)));
        pool.insert(slot("fresh.com", false, now));
        pool.maintain(now);
        assert_eq!(pool.len(), 1);
        assert!(pool.has_match("http", "fresh.com", 80));
    }
}
