//! Fulcrum Config - Configuration management
//!
//! TOML file with `[server]`, `[balancer]` and `[[backends]]` sections,
//! validated once at startup.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod loader;
pub mod types;

pub use loader::{ConfigError, ConfigLoader};
pub use types::{
    BackendConfig, BalancerConfig, FramingMode, FulcrumConfig, RoutingStrategy, ServerConfig,
};
