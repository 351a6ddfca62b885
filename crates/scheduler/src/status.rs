//! Status fan-out: many callers sharing one physical connection.

use crate::error::ConnectionError;
use crate::request::RequestKey;
use crate::state::{ConnectionState, LoadPriority};
use slotmap::new_key_type;
use std::sync::Arc;
use std::time::Duration;

new_key_type! {
    /// A caller's handle into a shared connection request.
    pub struct SubscriberKey;
}

/// Notification callback. Invoked after the scheduler's lock is
/// released, so it may freely call back into the scheduler.
pub type StatusCallback = Arc<dyn Fn(&LoadStatus) + Send + Sync>;

/// Snapshot fanned out to subscribers on every state change and on
/// throttled transfer progress.
#[derive(Clone, Debug)]
pub struct LoadStatus {
    /// State the request just entered.
    pub state: ConnectionState,
    /// Error in effect before this transition, as context.
    pub prev_error: Option<ConnectionError>,
    /// Bytes received so far.
    pub received: u64,
    /// Estimated total length, when known.
    pub est_length: Option<u64>,
    /// Smoothed receive rate, bytes per second.
    pub bytes_per_sec: f64,
    /// Estimated time to completion.
    pub eta: Option<Duration>,
}

impl LoadStatus {
    pub(crate) fn initial() -> Self {
        Self {
            state: ConnectionState::Wait,
            prev_error: None,
            received: 0,
            est_length: None,
            bytes_per_sec: 0.0,
            eta: None,
        }
    }
}

/// One caller's non-owning stake in a request: the priority it
/// contributes, the request it points at, and the last status it saw.
pub struct StatusSubscriber {
    /// Priority level this subscriber contributes to the request.
    pub priority: LoadPriority,
    /// Owning request.
    pub request: RequestKey,
    /// Last observed status.
    pub last: LoadStatus,
    /// Optional notification callback.
    pub callback: Option<StatusCallback>,
}

impl StatusSubscriber {
    pub(crate) fn new(
        priority: LoadPriority,
        request: RequestKey,
        callback: Option<StatusCallback>,
    ) -> Self {
        Self {
            priority,
            request,
            last: LoadStatus::initial(),
            callback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_status() {
        let status = LoadStatus::initial();
        assert_eq!(status.state, ConnectionState::Wait);
        assert!(status.prev_error.is_none());
        assert_eq!(status.received, 0);
    }
}
