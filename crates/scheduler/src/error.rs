//! Connection error taxonomy.

use thiserror::Error;

/// Errors a connection can end in, grouped by how the scheduler reacts:
/// transport errors retry while the request is restartable, policy and
/// protocol errors are terminal, and security errors are terminal
/// unless an external layer accepts the risk and retries.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConnectionError {
    // Transport
    #[error("DNS lookup failed: {0}")]
    Dns(String),
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Timeout")]
    Timeout,

    // Policy
    #[error("Invalid URL: {0}")]
    BadUrl(String),
    #[error("Scheme not allowed: {0}")]
    SchemeDisallowed(String),
    #[error("Proxy required but unavailable")]
    ProxyUnavailable,
    #[error("Cyclic redirect")]
    CyclicRedirect,
    #[error("Response too large")]
    TooLarge,

    // Protocol
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("Login failed")]
    BadLogin,

    // Security
    #[error("Invalid certificate: {0}")]
    CertificateInvalid(String),
    #[error("Cipher too weak")]
    CipherTooWeak,
    #[error("Protocol downgrade detected")]
    ProtocolDowngraded,

    // Internal
    #[error("Internal invariant violated: {0}")]
    InvariantViolation(&'static str),

    /// The last subscriber released the request before it finished.
    #[error("Interrupted")]
    Interrupted,
}

impl ConnectionError {
    /// Whether the scheduler retries this error automatically (subject
    /// to the request still being restartable).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Dns(_) | Self::ConnectFailed(_) | Self::Io(_) | Self::Timeout
        )
    }

    /// Whether this error may be escalated to an interactive decision
    /// (certificate/cipher/downgrade problems and failed logins).
    pub fn is_interactive(&self) -> bool {
        matches!(
            self,
            Self::BadLogin
                | Self::CertificateInvalid(_)
                | Self::CipherTooWeak
                | Self::ProtocolDowngraded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_retry() {
        assert!(ConnectionError::Timeout.is_retryable());
        assert!(ConnectionError::Dns("nxdomain".into()).is_retryable());
        assert!(ConnectionError::ConnectFailed("refused".into()).is_retryable());
    }

    #[test]
    fn test_policy_and_protocol_errors_are_terminal() {
        assert!(!ConnectionError::CyclicRedirect.is_retryable());
        assert!(!ConnectionError::TooLarge.is_retryable());
        assert!(!ConnectionError::MalformedResponse("junk".into()).is_retryable());
    }

    #[test]
    fn test_security_errors_escalate() {
        assert!(ConnectionError::CertificateInvalid("expired".into()).is_interactive());
        assert!(ConnectionError::CipherTooWeak.is_interactive());
        assert!(!ConnectionError::CipherTooWeak.is_retryable());
        assert!(!ConnectionError::Timeout.is_interactive());
    }
}
