//! Backend records and the registry that owns them
//!
//! The registry lives on the event-loop thread, so counters are plain
//! integers mutated through `&mut`.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A single backend server
#[derive(Debug, Clone)]
pub struct Backend {
    /// Host as configured
    pub host: String,

    /// Port as configured
    pub port: u16,

    /// Resolved address used for dialing
    pub addr: SocketAddr,

    /// Contexts currently holding a connection to this backend
    active_connections: usize,

    /// Errors since the last successful response
    consecutive_errors: u32,

    /// Dead backends are excluded from routing
    alive: bool,

    /// When the backend was marked dead
    died_at: Option<Instant>,

    /// Responses relayed from this backend
    total_requests: u64,
}

impl Backend {
    /// Create a new backend
    pub fn new(host: impl Into<String>, port: u16, addr: SocketAddr) -> Self {
        Self {
            host: host.into(),
            port,
            addr,
            active_connections: 0,
            consecutive_errors: 0,
            alive: true,
            died_at: None,
            total_requests: 0,
        }
    }

    /// Create a backend whose host and port come from the address
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port(), addr)
    }

    /// Check if backend is still in rotation
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Get active connection count
    #[inline]
    pub fn active_connections(&self) -> usize {
        self.active_connections
    }

    /// Get consecutive error count
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Get total responses relayed
    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    /// Increment active connections (called when a backend socket is opened)
    pub fn inc_connections(&mut self) {
        self.active_connections += 1;
    }

    /// Decrement active connections (called when a backend socket is closed)
    pub fn dec_connections(&mut self) {
        self.active_connections = self.active_connections.saturating_sub(1);
    }

    /// Record a communication error.
    ///
    /// Returns true when this error pushed the backend out of rotation.
    pub fn record_error(&mut self, max_errors: u32, now: Instant) -> bool {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);

        if self.alive && self.consecutive_errors >= max_errors {
            self.alive = false;
            self.died_at = Some(now);
            return true;
        }
        false
    }

    /// Record a complete response from this backend
    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
        self.total_requests += 1;
    }

    fn revive(&mut self) {
        self.alive = true;
        self.died_at = None;
        self.consecutive_errors = 0;
    }
}

/// The ordered set of configured backends
#[derive(Debug)]
pub struct BackendRegistry {
    backends: Vec<Backend>,

    /// Cooldown after which a dead backend re-enters rotation.
    /// `None` keeps dead backends out forever.
    revive_after: Option<Duration>,
}

impl BackendRegistry {
    /// Create a registry that never re-admits dead backends
    pub fn new(backends: Vec<Backend>) -> Self {
        Self {
            backends,
            revive_after: None,
        }
    }

    /// Set the re-admission cooldown
    pub fn with_revive_after(mut self, revive_after: Option<Duration>) -> Self {
        self.revive_after = revive_after;
        self
    }

    /// Number of configured backends
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Check if no backend is configured
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Get a backend by index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Backend> {
        self.backends.get(idx)
    }

    /// Get a backend by index, mutably
    #[inline]
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Backend> {
        self.backends.get_mut(idx)
    }

    /// Iterate over all backends in configured order
    pub fn iter(&self) -> impl Iterator<Item = &Backend> {
        self.backends.iter()
    }

    /// Count backends still in rotation
    pub fn alive_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_alive()).count()
    }

    /// Record an error against a backend, logging when it is taken out of rotation
    pub fn record_error(&mut self, idx: usize, max_errors: u32, now: Instant) {
        let Some(backend) = self.backends.get_mut(idx) else {
            return;
        };

        if backend.record_error(max_errors, now) {
            tracing::warn!(
                backend = idx,
                addr = %backend.addr,
                errors = backend.consecutive_errors,
                "backend removed from rotation"
            );
        }
    }

    /// Bring back dead backends whose cooldown has elapsed
    pub fn revive_expired(&mut self, now: Instant) {
        let Some(cooldown) = self.revive_after else {
            return;
        };

        for (idx, backend) in self.backends.iter_mut().enumerate() {
            let expired = backend
                .died_at
                .is_some_and(|died| now.saturating_duration_since(died) >= cooldown);

            if !backend.alive && expired {
                backend.revive();
                tracing::info!(backend = idx, addr = %backend.addr, "backend back in rotation");
            }
        }
    }
}
