//! Scheduler configuration.

use crate::state::LoadPriority;
use std::time::Duration;

/// Connection scheduler configuration.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Maximum total running connections.
    pub max_connections: usize,
    /// Maximum running connections per host.
    pub max_connections_per_host: usize,
    /// Maximum attempts per request (first try included).
    pub max_tries: u32,
    /// Maximum redirects before a fetch is treated as cyclic.
    pub max_redirects: u32,
    /// Base timeout for the connect phases; scaled by the try count
    /// to tolerate multi-address fallback.
    pub connect_timeout: Duration,
    /// Timeout while receiving data on a restartable request.
    pub receive_timeout: Duration,
    /// Timeout once a transfer can no longer be restarted.
    pub unrestartable_timeout: Duration,
    /// Cadence of transfer-rate/ETA recomputation while transferring;
    /// also the minimum spacing of progress notifications.
    pub stats_interval: Duration,
    /// Keepalive pool capacity.
    pub keepalive_capacity: usize,
    /// Idle lifetime of a pooled socket when the protocol handler
    /// supplies no timeout of its own.
    pub keepalive_timeout: Duration,
    /// Bytes a TLS session on a weak cipher may carry before its
    /// socket is no longer eligible for the keepalive pool.
    pub weak_cipher_byte_budget: u64,
    /// Bytes a cancel-tier request may receive before the background
    /// sweep aborts it.
    pub background_byte_budget: u64,
    /// Priority level at or below which the background-cancel sweep
    /// applies.
    pub cancel_tier: LoadPriority,
    /// Network configuration (proxies, DNS suffix).
    pub network: NetworkConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_connections_per_host: 6,
            max_tries: 3,
            max_redirects: 10,
            connect_timeout: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(120),
            unrestartable_timeout: Duration::from_secs(60),
            stats_interval: Duration::from_millis(250),
            keepalive_capacity: 30,
            keepalive_timeout: Duration::from_secs(60),
            weak_cipher_byte_budget: 1024 * 1024,
            background_byte_budget: 1024 * 1024,
            cancel_tier: LoadPriority::Speculative,
            network: NetworkConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the global connection cap.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the per-host connection cap.
    pub fn with_max_per_host(mut self, max: usize) -> Self {
        self.max_connections_per_host = max;
        self
    }

    /// Set the attempt limit.
    pub fn with_max_tries(mut self, tries: u32) -> Self {
        self.max_tries = tries;
        self
    }

    /// Set the keepalive pool capacity.
    pub fn with_keepalive_capacity(mut self, capacity: usize) -> Self {
        self.keepalive_capacity = capacity;
        self
    }

    /// Set the network configuration.
    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }
}

/// Proxy and name-resolution settings. Each request snapshots these at
/// start; a pooled socket is only reusable while they are unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkConfig {
    /// HTTP proxy, as `host:port`.
    pub http_proxy: Option<String>,
    /// SOCKS proxy, as `host:port`.
    pub socks_proxy: Option<String>,
    /// DNS search suffix appended to bare hostnames.
    pub dns_suffix: Option<String>,
}

impl NetworkConfig {
    /// No proxies, no suffix.
    pub fn direct() -> Self {
        Self::default()
    }

    /// Route through an HTTP proxy.
    pub fn with_http_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.http_proxy = Some(proxy.into());
        self
    }

    /// Route through a SOCKS proxy.
    pub fn with_socks_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.socks_proxy = Some(proxy.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.max_connections_per_host, 6);
        assert_eq!(config.max_tries, 3);
        assert_eq!(config.weak_cipher_byte_budget, 1024 * 1024);
    }

    #[test]
    fn test_config_builders() {
        let config = SchedulerConfig::new()
            .with_max_connections(2)
            .with_max_per_host(1)
            .with_keepalive_capacity(4);
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.max_connections_per_host, 1);
        assert_eq!(config.keepalive_capacity, 4);
    }

    #[test]
    fn test_network_config_change_detection() {
        let direct = NetworkConfig::direct();
        let proxied = NetworkConfig::direct().with_http_proxy("127.0.0.1:8080");
        assert_ne!(direct, proxied);
    }
}
