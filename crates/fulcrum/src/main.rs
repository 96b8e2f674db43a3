//! Fulcrum - single-process TCP load balancer
//!
//! # Usage
//! ```bash
//! fulcrum --config fulcrum.toml
//! fulcrum --config fulcrum.toml --debug           # Verbose per-connection logging
//! fulcrum --config fulcrum.toml --listen 0.0.0.0:9000
//! fulcrum --config fulcrum.toml --check           # Validate config only
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use fulcrum_config::{ConfigLoader, FulcrumConfig};
use fulcrum_server::EventLoop;

/// Fulcrum - TCP load balancer written in Rust
#[derive(Parser, Debug)]
#[command(name = "fulcrum")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "fulcrum.toml")]
    config: PathBuf,

    /// Validate configuration and exit
    #[arg(long)]
    check: bool,

    /// Debug mode (same as `server.debug = true`)
    #[arg(short, long)]
    debug: bool,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Listen address, overrides `server.listen`
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration; nothing is logged until the subscriber exists
    let config = load_config(&args)?;

    // Initialize logging
    init_logging(&log_filter(&config, args.log_level.as_deref()));

    tracing::info!("Fulcrum v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Loaded {} with {} backends ({:?}, {:?} framing)",
        args.config.display(),
        config.backends.len(),
        config.balancer.routing,
        config.balancer.framing
    );

    // Config check mode
    if args.check {
        tracing::info!("Configuration is valid");
        return Ok(());
    }

    let mut event_loop = EventLoop::from_config(&config)?;
    event_loop.run()
}

fn load_config(args: &Args) -> Result<FulcrumConfig> {
    let loader = ConfigLoader::load_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    let mut config = loader.into_inner();
    apply_overrides(&mut config, args);
    Ok(config)
}

fn apply_overrides(config: &mut FulcrumConfig, args: &Args) {
    if args.debug {
        config.server.debug = true;
    }
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
}

/// Filter used when `RUST_LOG` is unset
fn log_filter(config: &FulcrumConfig, flag: Option<&str>) -> String {
    match flag {
        Some(level) => level.to_string(),
        None if config.server.debug => "debug".to_string(),
        None => config.server.log_level.clone(),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
