//! Connection lifecycle states and load priorities.

use crate::error::ConnectionError;

/// Load priority. Lower numeric value is more urgent.
///
/// Speculative is the cancel tier: work parked there is subject to the
/// background-cancel sweep and may be aborted at any scheduling pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoadPriority {
    /// Main document.
    Critical = 0,
    /// Render-blocking subresources (CSS, blocking scripts).
    High = 1,
    /// Ordinary subresources.
    Normal = 2,
    /// Below-the-fold images, async scripts.
    Low = 3,
    /// Prefetch hints.
    Prefetch = 4,
    /// Abandoned or speculative work kept only while cheap.
    Speculative = 5,
}

/// Number of priority levels; sizes the per-request refcount array.
pub const PRIORITY_LEVELS: usize = 6;

impl LoadPriority {
    /// All levels, most urgent first.
    pub const ALL: [LoadPriority; PRIORITY_LEVELS] = [
        LoadPriority::Critical,
        LoadPriority::High,
        LoadPriority::Normal,
        LoadPriority::Low,
        LoadPriority::Prefetch,
        LoadPriority::Speculative,
    ];

    /// Array index for this level.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Level for an array index, if in range.
    pub fn from_index(index: usize) -> Option<LoadPriority> {
        Self::ALL.get(index).copied()
    }
}

/// Per-connection lifecycle state.
///
/// The happy path runs top to bottom; `Failed` holds any terminal
/// error. `Interrupted` and `TimedOut` are operational: they trigger
/// teardown or retry rather than being reported as endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Queued, waiting for admission.
    Wait,
    /// Connecting to the first resolved address.
    Connecting,
    /// Connecting to an alternate address after a per-address timeout.
    ConnectingAlt,
    /// SOCKS proxy negotiation.
    SocksHandshake,
    /// TLS handshake.
    TlsHandshake,
    /// Request sent, awaiting first response byte.
    Sent,
    /// Protocol-level login exchange.
    Login,
    /// Receiving response headers.
    Headers,
    /// Server-side processing (e.g. CGI) before the body.
    Processing,
    /// Receiving the response body.
    Transferring,
    /// Completed successfully.
    Done,
    /// Canceled by the last subscriber going away.
    Interrupted,
    /// A phase timeout fired; retried or dropped.
    TimedOut,
    /// Terminal failure.
    Failed(ConnectionError),
}

impl ConnectionState {
    /// Whether this is one of the connect phases, whose timeout scales
    /// with the try count and whose timer fire means "try the next
    /// address" rather than "give up".
    pub fn is_connect_phase(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::ConnectingAlt | Self::SocksHandshake | Self::TlsHandshake
        )
    }

    /// Whether the request is past queueing and actively driven by a
    /// protocol handler.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            Self::Wait | Self::Done | Self::Interrupted | Self::TimedOut | Self::Failed(_)
        )
    }

    /// Whether this state ends the request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Interrupted | Self::Failed(_))
    }
}
