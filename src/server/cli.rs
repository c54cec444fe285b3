//! Command-line interface definitions for the `hotwire` binary.
//!
//! Global settings live in [`AppConfig`] and layer CLI flags over
//! `HOTWIRE_*` environment variables and a `.hotwire.toml` dotfile.

#![expect(
    non_snake_case,
    reason = "Clap/OrthoConfig derive macros generate helper modules with uppercase names"
)]
#![allow(
    missing_docs,
    reason = "OrthoConfig and Clap derive macros generate items that cannot be documented"
)]
#![allow(
    unfulfilled_lint_expectations,
    reason = "derive macros conditionally generate items"
)]

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

use crate::{
    frame::MAX_PAYLOAD_SIZE,
    lifecycle::ReconnectConfig,
    serializer::{SerializationFormat, UnknownFormat},
    session::SessionConfig,
};

/// Arguments for the `serve` subcommand.
#[expect(
    missing_docs,
    reason = "OrthoConfig derive macro generates items that cannot be documented"
)]
#[derive(Parser, OrthoConfig, Deserialize, Serialize, Default, Debug, Clone)]
#[ortho_config(prefix = "HOTWIRE_")]
pub struct ServeArgs {
    /// Address to accept host connections on.
    #[arg(long)]
    pub listen: Option<String>,
    /// Identifier reported to hosts.
    #[arg(long)]
    pub application_identifier: Option<String>,
    /// Directory of dependency modules offered to hosts.
    #[arg(long)]
    pub module_dir: Option<String>,
}

/// Arguments for the `connect` subcommand.
#[expect(
    missing_docs,
    reason = "OrthoConfig derive macro generates items that cannot be documented"
)]
#[derive(Parser, OrthoConfig, Deserialize, Serialize, Default, Debug, Clone)]
#[ortho_config(prefix = "HOTWIRE_")]
pub struct ConnectArgs {
    /// Target address (`host:port`).
    #[arg(long)]
    pub target: Option<String>,
    /// File the target probes to detect a shared filesystem.
    #[arg(long)]
    pub shared_file: Option<String>,
}

/// CLI subcommands exposed by `hotwire`.
#[derive(Subcommand, Deserialize, Serialize, Debug, Clone)]
pub enum Commands {
    /// Run a demo target that accepts host connections.
    #[command(name = "serve")]
    Serve(ServeArgs),
    /// Connect to a target as the host.
    #[command(name = "connect")]
    Connect(ConnectArgs),
}

/// Runtime configuration shared by both roles.
#[expect(
    missing_docs,
    reason = "OrthoConfig derive macro generates items that cannot be documented"
)]
#[derive(Args, OrthoConfig, Serialize, Deserialize, Default, Debug, Clone)]
#[ortho_config(prefix = "HOTWIRE_")]
pub struct AppConfig {
    /// Payload encoding: `json`, `compressed-json` or `binary`.
    #[ortho_config(default = "json".to_owned())]
    #[arg(long, default_value_t = String::from("json"))]
    pub serializer: String,
    /// Delay between reconnect attempts, in milliseconds.
    #[ortho_config(default = 500)]
    #[arg(long, default_value_t = 500)]
    pub reconnect_backoff_ms: u64,
    /// Bound on a single connect attempt, in seconds.
    #[ortho_config(default = 5)]
    #[arg(long, default_value_t = 5)]
    pub connect_timeout_secs: u64,
    /// Bound on a single frame write, in seconds.
    #[ortho_config(default = 30)]
    #[arg(long, default_value_t = 30)]
    pub write_timeout_secs: u64,
    /// Largest accepted frame payload, in bytes.
    #[ortho_config(default = MAX_PAYLOAD_SIZE)]
    #[arg(long, default_value_t = MAX_PAYLOAD_SIZE)]
    pub max_payload: usize,
}

impl AppConfig {
    /// Session settings derived from this configuration.
    ///
    /// # Errors
    /// Returns [`UnknownFormat`] if `serializer` names no known encoding.
    pub fn session_config(&self) -> Result<SessionConfig, UnknownFormat> {
        let serializer: SerializationFormat = self.serializer.parse()?;
        Ok(SessionConfig::default()
            .with_serializer(serializer)
            .with_write_timeout(Duration::from_secs(self.write_timeout_secs))
            .with_max_payload(self.max_payload))
    }

    /// Reconnect policy derived from this configuration.
    ///
    /// # Errors
    /// Returns [`UnknownFormat`] if `serializer` names no known encoding.
    pub fn reconnect_config(&self) -> Result<ReconnectConfig, UnknownFormat> {
        Ok(ReconnectConfig::default()
            .with_backoff(Duration::from_millis(self.reconnect_backoff_ms))
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .with_session(self.session_config()?))
    }
}

/// Top-level CLI entry point consumed by the binary.
#[derive(Parser, Deserialize, Serialize, Debug, Clone)]
#[command(author, version, about)]
pub struct Cli {
    /// Application configuration.
    #[command(flatten)]
    pub config: AppConfig,
    /// Role to run; `serve` when omitted.
    #[command(subcommand)]
    pub command: Option<Commands>,
}
