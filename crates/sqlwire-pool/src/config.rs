//! Pool configuration.

use std::time::Duration;

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Minimum number of connections kept open, even when idle
    pub min_connections: usize,
    /// Maximum number of connections allowed (idle + checked out)
    pub max_connections: usize,
    /// Idle sessions older than this are closed by the sweeper
    pub idle_timeout: Duration,
    /// Maximum time a caller waits for a free session
    pub acquire_timeout: Duration,
    /// Sessions older than this are closed on release instead of re-pooled
    pub max_lifetime: Option<Duration>,
    /// Validate idle sessions before handing them out
    pub test_on_checkout: bool,
    /// Reset session state before returning a session to the idle set
    pub reset_on_release: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 100,
            idle_timeout: Duration::from_secs(180),
            acquire_timeout: Duration::from_secs(15),
            max_lifetime: None,
            test_on_checkout: false,
            reset_on_release: false,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    /// Set minimum connections.
    pub fn min_connections(mut self, n: usize) -> Self {
        self.min_connections = n;
        self
    }

    /// Set maximum connections.
    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    /// Set idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set acquire timeout.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set max lifetime. `Duration::ZERO` means unlimited.
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = (!lifetime.is_zero()).then_some(lifetime);
        self
    }

    /// Enable/disable test on checkout.
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }

    /// Enable/disable session reset on release.
    pub fn reset_on_release(mut self, enabled: bool) -> Self {
        self.reset_on_release = enabled;
        self
    }

    /// Check the limits are coherent.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> sqlwire_core::Result<()> {
        if self.max_connections == 0 {
            return Err(sqlwire_core::Error::config(
                "maximum pool size must be greater than zero",
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(sqlwire_core::Error::config(format!(
                "minimum pool size ({}) exceeds maximum pool size ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}
