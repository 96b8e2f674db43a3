//! Backend selection policies
//!
//! Both policies are linear scans over the registry. With a handful of
//! backends this is cheaper than maintaining any index.

use crate::backend::BackendRegistry;
use crate::error::{ProxyError, Result};

/// Load balancing method, chosen at configuration time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RoutingMethod {
    /// Cycle through alive backends in configured order (default)
    #[default]
    RoundRobin,
    /// Pick the alive backend with the fewest active connections
    LeastConnected,
}

/// Selection policy plus its rotation cursor
#[derive(Debug, Default)]
pub struct RoutingPolicy {
    method: RoutingMethod,

    /// Next index round-robin checks
    cursor: usize,
}

impl RoutingPolicy {
    /// Create a policy for the given method
    pub fn new(method: RoutingMethod) -> Self {
        Self { method, cursor: 0 }
    }

    /// Configured method
    pub fn method(&self) -> RoutingMethod {
        self.method
    }

    /// Select a backend index
    #[inline]
    pub fn select(&mut self, backends: &BackendRegistry) -> Result<usize> {
        match self.method {
            RoutingMethod::RoundRobin => self.round_robin(backends),
            RoutingMethod::LeastConnected => least_connected(backends),
        }
    }

    /// Advance the cursor until an alive backend is found.
    ///
    /// # Performance
    /// O(n) worst case where n = number of backends
    fn round_robin(&mut self, backends: &BackendRegistry) -> Result<usize> {
        let len = backends.len();

        // Try each backend once
        for _ in 0..len {
            let idx = self.cursor % len;
            self.cursor = (idx + 1) % len;

            if backends.get(idx).is_some_and(|b| b.is_alive()) {
                return Ok(idx);
            }
        }

        Err(ProxyError::NoBackendAvailable)
    }
}

/// First alive backend with the minimum active connection count
fn least_connected(backends: &BackendRegistry) -> Result<usize> {
    backends
        .iter()
        .enumerate()
        .filter(|(_, b)| b.is_alive())
        .min_by_key(|(_, b)| b.active_connections())
        .map(|(idx, _)| idx)
        .ok_or(ProxyError::NoBackendAvailable)
}
