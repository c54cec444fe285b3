//! Orchestration for the `hotwire` binary.
//!
//! This module exposes the command-line interface and the runtime for both
//! roles. The binary stays a thin wrapper that only needs to call [`run`].

pub mod cli;
pub mod runtime;

use anyhow::Result;
use clap::Parser;
pub use cli::{AppConfig, Cli, Commands, ConnectArgs, ServeArgs};
pub use runtime::{LoggingReloadManager, run_connect, run_serve};
use tracing_subscriber::EnvFilter;

/// Parse CLI arguments, install logging and run the selected role.
///
/// # Errors
///
/// Returns any error emitted while parsing configuration or running the
/// role.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    run_with_cli(cli).await
}

/// Execute the binary logic using an already parsed [`Cli`].
///
/// # Errors
///
/// Propagates any failure reported by [`runtime::dispatch`].
pub async fn run_with_cli(cli: Cli) -> Result<()> { runtime::dispatch(cli).await }

/// Install a compact `fmt` subscriber filtered by `RUST_LOG` (default
/// `info`). Does nothing if a subscriber is already set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
