//! Connection scheduler for the browser's resource fetcher.
//!
//! This crate handles:
//! - Admission control under global and per-host connection caps
//! - Priority-ordered queueing and sharing of identical in-flight loads
//! - Per-connection lifecycle: timeouts, retries, detach, suspension
//! - Keepalive socket pooling with staleness and capacity eviction
//! - Per-host policy blacklisting driven by protocol handlers
//!
//! The scheduler is cooperative and event-driven: all waiting is
//! represented by state, and the owner pumps [`Scheduler::tick`] from
//! its event loop.

pub mod blacklist;
pub mod config;
pub mod error;
pub mod host;
pub mod keepalive;
pub mod protocol;
pub mod request;
pub mod scheduler;
pub mod state;
pub mod status;

pub use blacklist::{BlacklistFlags, BlacklistTable};
pub use config::{NetworkConfig, SchedulerConfig};
pub use error::ConnectionError;
pub use keepalive::KeepAlivePool;
pub use protocol::{
    CancelHandle, CipherClass, ProtocolData, ProtocolHandler, TlsSession, Transport,
};
pub use request::{CacheMode, DetachState, LoadFlags, RequestKey, Restartability};
pub use scheduler::{InteractionHook, LoadRequest, RequestInfo, Scheduler, SchedulerStats};
pub use state::{ConnectionState, LoadPriority};
pub use status::{LoadStatus, StatusCallback, SubscriberKey};
