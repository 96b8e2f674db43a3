//! Configuration types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use fulcrum_core::limits::{
    DEFAULT_BUFFER_SIZE, DEFAULT_MAX_BACKEND_ERRORS, DEFAULT_MAX_CONTEXTS, DEFAULT_MAX_TRIES,
};
use fulcrum_core::{Framing, Limits, RoutingMethod};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FulcrumConfig {
    /// Listener and logging
    #[serde(default)]
    pub server: ServerConfig,

    /// Engine tunables
    #[serde(default)]
    pub balancer: BalancerConfig,

    /// Backend servers in routing order
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,

    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,

    /// Debug mode: raises the default log filter to `debug`
    #[serde(default)]
    pub debug: bool,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_backlog() -> i32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
            backlog: default_backlog(),
            debug: false,
            log_level: default_log_level(),
        }
    }
}

/// Balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Backend selection method
    #[serde(default)]
    pub routing: RoutingStrategy,

    /// Message boundary detection
    #[serde(default)]
    pub framing: FramingMode,

    /// Maximum concurrent client connections
    #[serde(default = "default_max_contexts")]
    pub max_contexts: usize,

    /// Per-connection buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Backend selections per request
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// Consecutive errors before a backend is marked dead
    #[serde(default = "default_max_backend_errors")]
    pub max_backend_errors: u32,

    /// Receive timeout applied to backend sockets, in milliseconds
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,

    /// Seconds before a dead backend is put back in rotation.
    /// Unset means dead backends stay dead.
    #[serde(default)]
    pub revive_after_secs: Option<u64>,
}

fn default_max_contexts() -> usize {
    DEFAULT_MAX_CONTEXTS
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_max_tries() -> u32 {
    DEFAULT_MAX_TRIES
}

fn default_max_backend_errors() -> u32 {
    DEFAULT_MAX_BACKEND_ERRORS
}

fn default_recv_timeout_ms() -> u64 {
    1000
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            routing: RoutingStrategy::default(),
            framing: FramingMode::default(),
            max_contexts: default_max_contexts(),
            buffer_size: default_buffer_size(),
            max_tries: default_max_tries(),
            max_backend_errors: default_max_backend_errors(),
            recv_timeout_ms: default_recv_timeout_ms(),
            revive_after_secs: None,
        }
    }
}

impl BalancerConfig {
    /// Engine limits for this configuration
    pub fn limits(&self) -> Limits {
        Limits {
            max_contexts: self.max_contexts,
            buffer_size: self.buffer_size,
            max_tries: self.max_tries,
            max_backend_errors: self.max_backend_errors,
            recv_timeout: Duration::from_millis(self.recv_timeout_ms),
            revive_after: self.revive_after_secs.map(Duration::from_secs),
            framing: self.framing.into(),
        }
    }
}

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Round-robin (default)
    #[default]
    RoundRobin,
    /// Fewest active connections
    LeastConnected,
}

impl From<RoutingStrategy> for RoutingMethod {
    fn from(strategy: RoutingStrategy) -> Self {
        match strategy {
            RoutingStrategy::RoundRobin => RoutingMethod::RoundRobin,
            RoutingStrategy::LeastConnected => RoutingMethod::LeastConnected,
        }
    }
}

/// Message framing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingMode {
    /// Message ends at the first newline (default)
    #[default]
    Newline,
    /// Message ends after an HTTP header block
    HeaderBlock,
}

impl From<FramingMode> for Framing {
    fn from(mode: FramingMode) -> Self {
        match mode {
            FramingMode::Newline => Framing::Newline,
            FramingMode::HeaderBlock => Framing::HeaderBlock,
        }
    }
}

/// Backend server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Host name or IP address
    pub host: String,

    /// TCP port
    pub port: u16,
}
