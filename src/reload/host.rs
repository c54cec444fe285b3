//! Host side of the reload protocol.
//!
//! The host dials the target, pushes modules and commands to it, and serves
//! the target's own calls: dependency module references, command requests
//! and heartbeats. Inbound references and commands are handed to the
//! application through bounded channels so a slow consumer pushes back on
//! the target instead of growing memory.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    models::{
        CachedModuleState,
        ExecuteCommandRequest,
        HeartbeatRequest,
        HostHello,
        LoadModuleRequest,
        ManyModuleReferences,
        ModuleReference,
        Outcome,
        TargetHello,
    },
    reload_registry,
};
use crate::{
    dispatch::{DispatchTableBuilder, HandlerError, ServiceHandler},
    lifecycle::{ChannelState, Connector, ReconnectConfig, Reconnector},
    session::SessionError,
};

/// Default depth of the inbound reference and command queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Receiving ends of the queues fed by [`HostService`].
#[derive(Debug)]
pub struct HostChannels {
    /// Dependency modules announced by the target.
    pub references: mpsc::Receiver<ModuleReference>,
    /// Commands the target asked the host to run.
    pub commands: mpsc::Receiver<ExecuteCommandRequest>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Serves the host operations.
#[derive(Debug)]
pub struct HostService {
    references: mpsc::Sender<ModuleReference>,
    commands: mpsc::Sender<ExecuteCommandRequest>,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
}

impl HostService {
    /// Create the service with queues of `capacity` entries each.
    #[must_use]
    pub fn new(capacity: usize) -> (Arc<Self>, HostChannels) {
        let (references, references_rx) = mpsc::channel(capacity);
        let (commands, commands_rx) = mpsc::channel(capacity);
        let service = Arc::new(Self {
            references,
            commands,
            last_heartbeat: Mutex::new(None),
        });
        (service, HostChannels {
            references: references_rx,
            commands: commands_rx,
        })
    }

    /// Queue one dependency module.
    pub async fn add_module_reference(&self, reference: ModuleReference) -> Outcome {
        let location = reference.module_location.clone();
        debug!(module = %location, inline = reference.image.is_some(), "module reference received");
        match self.references.send(reference).await {
            Ok(()) => Outcome::ok(),
            Err(_) => {
                warn!(module = %location, "module reference dropped; nobody is consuming");
                Outcome::failed(format!("module reference {location} was not accepted"))
            }
        }
    }

    /// Queue a batch of dependency modules in order.
    pub async fn add_many_module_references(&self, batch: ManyModuleReferences) -> Outcome {
        let total = batch.references.len();
        for (accepted, reference) in batch.references.into_iter().enumerate() {
            let outcome = self.add_module_reference(reference).await;
            if !outcome.success {
                return outcome.with_message(format!("{accepted} of {total} references accepted"));
            }
        }
        Outcome::ok()
    }

    /// Queue a command the target wants run.
    pub async fn execute_command(&self, request: ExecuteCommandRequest) -> Outcome {
        let command = request.command.clone();
        info!(%command, args = ?request.args, "target requested command");
        match self.commands.send(request).await {
            Ok(()) => Outcome::ok(),
            Err(_) => Outcome::failed(format!("command {command} was not accepted")),
        }
    }

    /// Record a heartbeat.
    pub fn heartbeat(&self, request: &HeartbeatRequest) -> Outcome {
        *lock(&self.last_heartbeat) = Some(request.sent_at);
        debug!(sent_at = %request.sent_at, "heartbeat");
        Outcome::ok()
    }

    /// When the target last sent a heartbeat.
    #[must_use]
    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> { *lock(&self.last_heartbeat) }
}

impl ServiceHandler for HostService {
    fn register(self: Arc<Self>, table: &mut DispatchTableBuilder) {
        let single = Arc::clone(&self);
        let many = Arc::clone(&self);
        let command = Arc::clone(&self);
        let heartbeat = self;
        table
            .operation("add_module_reference", move |reference: ModuleReference| {
                let service = Arc::clone(&single);
                async move { Ok::<_, HandlerError>(service.add_module_reference(reference).await) }
            })
            .operation("add_many_module_references", move |batch: ManyModuleReferences| {
                let service = Arc::clone(&many);
                async move { Ok::<_, HandlerError>(service.add_many_module_references(batch).await) }
            })
            .operation("execute_command", move |request: ExecuteCommandRequest| {
                let service = Arc::clone(&command);
                async move { Ok::<_, HandlerError>(service.execute_command(request).await) }
            })
            .operation("heartbeat", move |request: HeartbeatRequest| {
                let outcome = heartbeat.heartbeat(&request);
                async move { Ok::<_, HandlerError>(outcome) }
            });
    }
}

/// Host-side client of a running target.
///
/// Every call waits for a connection first, so calls made while the target
/// is restarting resume once it is back.
pub struct TargetClient<C> {
    channel: Reconnector<C>,
    service: Arc<HostService>,
}

impl<C> Clone for TargetClient<C> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            service: Arc::clone(&self.service),
        }
    }
}

impl<C: Connector> TargetClient<C> {
    /// Build a client dialling with `connector`.
    ///
    /// Returns the queues through which the target's module references and
    /// command requests arrive.
    #[must_use]
    pub fn new(connector: C, config: ReconnectConfig, capacity: usize) -> (Self, HostChannels) {
        let (service, channels) = HostService::new(capacity);
        let handler: Arc<dyn ServiceHandler> = service.clone();
        let channel = Reconnector::builder(connector, reload_registry())
            .handler(handler)
            .config(config)
            .build();
        (Self { channel, service }, channels)
    }

    /// Introduce the host and learn the target's capabilities.
    ///
    /// # Errors
    /// Returns the [`SessionError`] of the request.
    pub async fn hello(&self, hello: HostHello) -> Result<TargetHello, SessionError> {
        let session = self.channel.wait_for_connection().await;
        let reply: TargetHello = session.send_request(hello).await?;
        info!(
            application = %reply.application_identifier,
            root = %reply.root_module_path,
            shared_filesystem = reply.use_shared_filesystem_dependency_resolution,
            "target said hello"
        );
        Ok(reply)
    }

    /// Push a compiled module into the target.
    ///
    /// # Errors
    /// Returns the [`SessionError`] of the request.
    pub async fn load_module(&self, request: LoadModuleRequest) -> Result<Outcome, SessionError> {
        let module_name = request.module_name.clone();
        let started = Instant::now();
        let session = self.channel.wait_for_connection().await;
        let outcome: Outcome = session.send_request(request).await?;
        info!(
            module = %module_name,
            success = outcome.success,
            elapsed_ms = started.elapsed().as_millis(),
            "module pushed"
        );
        Ok(outcome)
    }

    /// Run a command inside the target.
    ///
    /// # Errors
    /// Returns the [`SessionError`] of the request.
    pub async fn exec(&self, request: ExecuteCommandRequest) -> Result<Outcome, SessionError> {
        let session = self.channel.wait_for_connection().await;
        session.send_request(request).await
    }

    /// Tell the target which dependency modules the host already holds.
    ///
    /// The target answers at once and follows up with
    /// `add_module_reference` calls for everything missing or stale.
    ///
    /// # Errors
    /// Returns the [`SessionError`] of the request.
    pub async fn synchronize_dependencies(&self, state: CachedModuleState) -> Result<Outcome, SessionError> {
        let session = self.channel.wait_for_connection().await;
        session.send_request(state).await
    }

    /// The reconnecting channel to the target.
    #[must_use]
    pub const fn channel(&self) -> &Reconnector<C> { &self.channel }

    /// Connectivity right now.
    #[must_use]
    pub fn state(&self) -> ChannelState { self.channel.current_state() }

    /// The handler serving the target's calls.
    #[must_use]
    pub const fn service(&self) -> &Arc<HostService> { &self.service }

    /// Drop the current connection.
    pub fn close(&self) { self.channel.close(); }
}
