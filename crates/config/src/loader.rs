//! Configuration loading and validation

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::FulcrumConfig;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File not found
    #[error("config file not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Validation error
    #[error("validation error: {0}")]
    Validation(String),
}

/// Loaded and validated configuration
#[derive(Debug)]
pub struct ConfigLoader {
    config: FulcrumConfig,

    /// Path the configuration was read from
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Load configuration from file
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)?;
        let config: FulcrumConfig = toml::from_str(&content)?;

        Self::validate(&config)?;

        Ok(Self {
            config,
            config_path: Some(path.to_path_buf()),
        })
    }

    /// Load configuration from string
    pub fn load_str(content: &str) -> Result<Self, ConfigError> {
        let config: FulcrumConfig = toml::from_str(content)?;
        Self::validate(&config)?;

        Ok(Self {
            config,
            config_path: None,
        })
    }

    /// Current configuration
    #[inline]
    pub fn get(&self) -> &FulcrumConfig {
        &self.config
    }

    /// Path the configuration was loaded from, if any
    pub fn path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Consume the loader, keeping the configuration
    pub fn into_inner(self) -> FulcrumConfig {
        self.config
    }

    /// Validate configuration
    pub fn validate(config: &FulcrumConfig) -> Result<(), ConfigError> {
        if config.backends.is_empty() {
            return Err(ConfigError::Validation("no backends configured".to_string()));
        }

        for (idx, backend) in config.backends.iter().enumerate() {
            if backend.host.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "backend #{} has an empty host",
                    idx
                )));
            }
            if backend.port == 0 {
                return Err(ConfigError::Validation(format!(
                    "backend '{}' has port 0",
                    backend.host
                )));
            }
        }

        let balancer = &config.balancer;
        let limits = [
            ("max_contexts", balancer.max_contexts as u64),
            ("buffer_size", balancer.buffer_size as u64),
            ("max_tries", u64::from(balancer.max_tries)),
            ("max_backend_errors", u64::from(balancer.max_backend_errors)),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "balancer.{} must be greater than zero",
                    name
                )));
            }
        }

        if config.server.backlog <= 0 {
            return Err(ConfigError::Validation(
                "server.backlog must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
