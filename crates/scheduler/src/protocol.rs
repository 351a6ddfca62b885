//! Seams toward protocol handlers and transports.
//!
//! The scheduler never touches protocol bytes: a [`ProtocolHandler`]
//! drives a connection through its states by calling back into the
//! scheduler, and a [`Transport`] is an opaque socket the scheduler
//! only owns, pools, and closes.

use crate::request::RequestKey;
use crate::scheduler::Scheduler;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Opaque per-protocol state carried across a keepalive reuse (e.g.
/// negotiated HTTP options). Owned by the slot, handed back to the
/// handler on resumption.
pub type ProtocolData = Box<dyn Any + Send>;

/// One handler per URL scheme. `start` begins driving the connection
/// and reports through `Scheduler::set_state`, `report_progress`,
/// `finish`, and `fail`; it must be resumable from a spliced-in
/// keepalive socket when `resumed` is set.
pub trait ProtocolHandler: Send + Sync {
    /// URL scheme this handler serves.
    fn scheme(&self) -> &'static str;

    /// Keepalive identity for a URL (`host[:qualifiers]`), or `None`
    /// if this protocol's connections are not reusable.
    fn keepalive_identity(&self, url: &Url) -> Option<String>;

    /// Idle lifetime for pooled sockets of this protocol; `None` uses
    /// the scheduler's configured default.
    fn keepalive_timeout(&self) -> Option<Duration> {
        None
    }

    /// Begin (or resume, after a retry or keepalive splice) driving
    /// the request.
    fn start(&self, scheduler: &Scheduler, request: RequestKey, resumed: bool);
}

/// An established socket, owned by exactly one request or keepalive
/// slot at a time. Closing is dropping.
pub trait Transport: Send {
    /// Whether the peer has pending input outside any exchange. On an
    /// idle pooled socket that means half-close or unsolicited data,
    /// so the socket is stale.
    fn has_unexpected_input(&self) -> bool;
}

/// Rough strength class of a negotiated cipher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherClass {
    Strong,
    /// Legacy/export-grade; traffic over it is budget-limited before
    /// the socket is barred from the keepalive pool.
    Weak,
}

/// TLS session attached to a connection.
#[derive(Clone, Debug)]
pub struct TlsSession {
    /// Negotiated cipher class.
    pub cipher: CipherClass,
}

impl TlsSession {
    pub fn new(cipher: CipherClass) -> Self {
        Self { cipher }
    }
}

/// Cancel handle for an in-flight DNS lookup or socket operation.
/// Cancel is explicit and idempotent: only the first call reports
/// having done anything.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns `true` the first time only.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
