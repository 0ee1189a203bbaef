//! Command line entry point.
//!
//! Handlers are compiled into the application, so the binary is yours to write:
//!
//! ```no_run
//! use amqp_dispatcher::consumers::HandlerRegistry;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), anyhow::Error> {
//!     let registry = HandlerRegistry::new();
//!     amqp_dispatcher::cli::run(registry).await
//! }
//! ```
use crate::configuration::{DispatcherConfig, DispatcherEnvironment};
use crate::consumers::HandlerRegistry;
use crate::dispatcher::Dispatcher;
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Consume messages from RabbitMq queues with the configured handlers.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "amqp-dispatcher", version, long_about = None)]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(long = "config", default_value = "config.yml")]
    pub config: PathBuf,

    /// Only validate the configuration, then exit
    #[arg(long = "validate")]
    pub validate: bool,
}

/// Install a `fmt` subscriber filtered via `RUST_LOG` (`info` if unset or invalid).
pub fn init_logging() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to install the tracing subscriber")
}

/// Parse the command line, load and validate the configuration, then run until SIGTERM.
pub async fn run(registry: HandlerRegistry) -> Result<(), anyhow::Error> {
    run_with_args(Args::parse(), registry).await
}

pub async fn run_with_args(args: Args, registry: HandlerRegistry) -> Result<(), anyhow::Error> {
    init_logging()?;
    let config = DispatcherConfig::from_file(&args.config)?;
    let dispatcher = Dispatcher::new(config, registry, DispatcherEnvironment::from_env());
    dispatcher.validate()?;
    if args.validate {
        info!("Configuration {} is valid", args.config.display());
        return Ok(());
    }
    dispatcher.run_until_sigterm().await
}
