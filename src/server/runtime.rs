//! Runtime for both roles of the `hotwire` binary.
//!
//! `serve` runs a demo target whose reload manager only logs what it
//! receives; `connect` runs a host that says hello, asks for dependency
//! modules and then follows the channel until it ends.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use ortho_config::load_and_merge_subcommand_for;
use tracing::info;

use super::cli::{AppConfig, Cli, Commands, ConnectArgs, ServeArgs};
use crate::{
    dispatch::HandlerError,
    lifecycle::TcpConnector,
    reload::{
        CachedModuleState,
        DEFAULT_QUEUE_CAPACITY,
        DirectoryCatalog,
        EmptyCatalog,
        ExecuteCommandRequest,
        HostChannels,
        HostHello,
        LoadModuleRequest,
        ModuleCatalog,
        Outcome,
        ReloadManager,
        TargetClient,
        TargetConfig,
        TargetListener,
        shutdown_signal,
    },
};

/// Address `connect` dials when none is configured.
pub const DEFAULT_TARGET_ADDR: &str = "127.0.0.1:50123";

/// Run the role selected on the command line.
///
/// # Errors
///
/// Returns any error encountered while merging configuration or while running
/// the selected role.
pub async fn dispatch(cli: Cli) -> Result<()> {
    let Cli { config, command } = cli;
    match command.unwrap_or_else(|| Commands::Serve(ServeArgs::default())) {
        Commands::Serve(args) => {
            let args = load_and_merge_subcommand_for::<ServeArgs>(&args)?;
            run_serve(args, &config).await
        }
        Commands::Connect(args) => {
            let args = load_and_merge_subcommand_for::<ConnectArgs>(&args)?;
            run_connect(args, &config).await
        }
    }
}

/// A reload manager that accepts everything and logs it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingReloadManager;

#[async_trait]
impl ReloadManager for LoggingReloadManager {
    async fn load_module(&self, request: LoadModuleRequest) -> Result<Outcome, HandlerError> {
        info!(
            module = %request.module_name,
            bytes = request.image.len(),
            symbols = request.debug_symbols.is_some(),
            primary_type = request.primary_type_name.as_deref().unwrap_or("-"),
            "module received"
        );
        Ok(Outcome::ok().with_message(format!("received {} bytes", request.image.len())))
    }

    async fn execute_command(&self, request: ExecuteCommandRequest) -> Result<Outcome, HandlerError> {
        info!(command = %request.command, args = ?request.args, "command received");
        Ok(Outcome::ok())
    }
}

/// Run a target until Ctrl-C or SIGTERM.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the listen address
/// cannot be bound.
pub async fn run_serve(args: ServeArgs, cfg: &AppConfig) -> Result<()> {
    let session_config = cfg.session_config()?;
    let mut target = TargetConfig::default();
    if let Some(listen) = args.listen {
        target = target.with_listen(listen);
    }
    if let Some(identifier) = args.application_identifier {
        target = target.with_application_identifier(identifier);
    }
    let catalog: Arc<dyn ModuleCatalog> = match args.module_dir {
        Some(dir) => {
            target = target.with_root_module_path(dir.as_str());
            Arc::new(DirectoryCatalog::new(dir))
        }
        None => Arc::new(EmptyCatalog),
    };

    let listen = target.listen.clone();
    let listener = TargetListener::bind(target, session_config, Arc::new(LoggingReloadManager), catalog)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    listener.run(shutdown_signal()).await?;
    Ok(())
}

/// Connect to a target, say hello, and follow the channel until it ends or
/// Ctrl-C is pressed.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the initial calls
/// fail.
pub async fn run_connect(args: ConnectArgs, cfg: &AppConfig) -> Result<()> {
    let target = args.target.unwrap_or_else(|| DEFAULT_TARGET_ADDR.to_owned());
    let (client, channels) = TargetClient::new(
        TcpConnector::new(target.as_str()),
        cfg.reconnect_config()?,
        DEFAULT_QUEUE_CAPACITY,
    );

    let mut states = client.channel().channel_state();
    let state_log = tokio::spawn(async move {
        while let Some(state) = states.next().await {
            info!(%state, "channel state");
        }
    });
    let drain = tokio::spawn(drain_host_channels(channels));

    let hello = client
        .hello(HostHello {
            shared_host_file_path: args.shared_file,
        })
        .await
        .with_context(|| format!("hello to {target} failed"))?;
    if hello.use_dependency_cache {
        let outcome = client
            .synchronize_dependencies(CachedModuleState::default())
            .await
            .context("dependency synchronisation failed")?;
        info!(success = outcome.success, "dependency synchronisation requested");
    }

    tokio::select! {
        state = client.channel().wait_for_terminal_state() => {
            info!(%state, "channel ended");
        }
        () = shutdown_signal() => {
            info!("shutdown requested");
            client.close();
        }
    }
    state_log.abort();
    drain.abort();
    Ok(())
}

async fn drain_host_channels(mut channels: HostChannels) {
    loop {
        tokio::select! {
            Some(reference) = channels.references.recv() => {
                info!(
                    module = %reference.module_name,
                    location = %reference.module_location,
                    inline = reference.image.is_some(),
                    "dependency module received"
                );
            }
            Some(command) = channels.commands.recv() => {
                info!(command = %command.command, args = ?command.args, "target requested command");
            }
            else => break,
        }
    }
}
