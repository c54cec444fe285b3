//! Target side of the reload protocol.

use std::{
    collections::HashMap,
    io,
    path::Path,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{
    catalog::{CatalogEntry, ModuleCatalog},
    models::{
        CachedModuleState,
        ExecuteCommandRequest,
        HeartbeatRequest,
        HostHello,
        LoadModuleRequest,
        ModuleReference,
        Outcome,
        TargetHello,
    },
};
use crate::{
    dispatch::{DispatchTableBuilder, HandlerError, ServiceHandler},
    session::{Session, SessionError, WeakSession},
};

/// Default address a target listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:50123";
/// Default pause before dependency modules are pushed to the host.
pub const DEFAULT_SYNC_DELAY: Duration = Duration::from_millis(500);

/// Swaps newly compiled code into the running application.
#[async_trait]
pub trait ReloadManager: Send + Sync + 'static {
    /// Load a module pushed by the host.
    async fn load_module(&self, request: LoadModuleRequest) -> Result<Outcome, HandlerError>;

    /// Run a command sent by the host.
    async fn execute_command(&self, request: ExecuteCommandRequest) -> Result<Outcome, HandlerError>;
}

/// Target behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    /// Address to accept host connections on.
    pub listen: String,
    /// Identifier reported to the host.
    pub application_identifier: String,
    /// Directory the application runs from.
    pub root_module_path: String,
    /// Whether dependency modules are synchronised with the host.
    pub use_dependency_cache: bool,
    /// Whether to resolve dependencies from a shared filesystem when the
    /// host can see ours.
    pub use_shared_filesystem_if_possible: bool,
    /// Pause before pushing dependency modules after a sync request.
    pub sync_delay: Duration,
}

impl Default for TargetConfig {
    fn default() -> Self {
        let root_module_path = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.display().to_string()))
            .unwrap_or_else(|| ".".to_owned());
        Self {
            listen: DEFAULT_LISTEN_ADDR.to_owned(),
            application_identifier: env!("CARGO_PKG_NAME").to_owned(),
            root_module_path,
            use_dependency_cache: true,
            use_shared_filesystem_if_possible: true,
            sync_delay: DEFAULT_SYNC_DELAY,
        }
    }
}

impl TargetConfig {
    /// Override the listen address.
    #[must_use]
    pub fn with_listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = listen.into();
        self
    }

    /// Override the identifier reported to the host.
    #[must_use]
    pub fn with_application_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.application_identifier = identifier.into();
        self
    }

    /// Override the application directory.
    #[must_use]
    pub fn with_root_module_path(mut self, path: impl Into<String>) -> Self {
        self.root_module_path = path.into();
        self
    }

    /// Enable or disable dependency synchronisation.
    #[must_use]
    pub const fn with_dependency_cache(mut self, enabled: bool) -> Self {
        self.use_dependency_cache = enabled;
        self
    }

    /// Enable or disable shared-filesystem dependency resolution.
    #[must_use]
    pub const fn with_shared_filesystem(mut self, enabled: bool) -> Self {
        self.use_shared_filesystem_if_possible = enabled;
        self
    }

    /// Override the pause before dependency modules are pushed.
    #[must_use]
    pub const fn with_sync_delay(mut self, sync_delay: Duration) -> Self {
        self.sync_delay = sync_delay;
        self
    }
}

/// Errors raised while pushing dependency modules to the host.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The module catalog could not be listed.
    #[error("module catalog: {0}")]
    Catalog(#[from] io::Error),
    /// Talking to the host failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Serves the target operations of one host connection.
pub struct TargetService {
    config: TargetConfig,
    reload: Arc<dyn ReloadManager>,
    catalog: Arc<dyn ModuleCatalog>,
    session: Mutex<WeakSession>,
    shared_filesystem: AtomicBool,
    host_cache: tokio::sync::Mutex<HashMap<String, DateTime<Utc>>>,
}

impl TargetService {
    /// Create a service backed by `reload` and `catalog`.
    #[must_use]
    pub fn new(
        config: TargetConfig,
        reload: Arc<dyn ReloadManager>,
        catalog: Arc<dyn ModuleCatalog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            reload,
            catalog,
            session: Mutex::new(WeakSession::default()),
            shared_filesystem: AtomicBool::new(false),
            host_cache: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Report capabilities, probing the host's file to detect a shared
    /// filesystem.
    pub fn hello(&self, hello: &HostHello) -> TargetHello {
        let can_access = hello
            .shared_host_file_path
            .as_deref()
            .is_some_and(|path| Path::new(path).is_file());
        self.shared_filesystem
            .store(can_access && self.config.use_dependency_cache, Ordering::SeqCst);
        info!(can_access, "host said hello");
        TargetHello {
            can_access_shared_host_file: can_access,
            root_module_path: self.config.root_module_path.clone(),
            application_identifier: self.config.application_identifier.clone(),
            use_dependency_cache: self.config.use_dependency_cache,
            use_shared_filesystem_dependency_resolution: can_access
                && self.config.use_shared_filesystem_if_possible,
        }
    }

    /// Hand a module to the reload manager; failures become a failed
    /// [`Outcome`].
    pub async fn load_module(&self, request: LoadModuleRequest) -> Outcome {
        let module_name = request.module_name.clone();
        match self.reload.load_module(request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(module = %module_name, error = %err, "module load failed");
                Outcome::failed(format!("failed to load module {module_name}: {err}"))
            }
        }
    }

    /// Run a command through the reload manager; failures become a failed
    /// [`Outcome`].
    pub async fn exec(&self, request: ExecuteCommandRequest) -> Outcome {
        let command = request.command.clone();
        let args = request.args.clone();
        match self.reload.execute_command(request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%command, ?args, error = %err, "command failed");
                Outcome::failed(format!("command {command} failed: {err}"))
            }
        }
    }

    /// Record what the host already holds and start pushing what it lacks.
    ///
    /// Returns at once; modules follow as independent requests.
    pub fn synchronize_dependencies(self: &Arc<Self>, state: CachedModuleState) -> Outcome {
        if !self.config.use_dependency_cache {
            return Outcome::ok().with_message("dependency cache disabled");
        }
        let service = Arc::clone(self);
        tokio::spawn(async move {
            {
                let mut cache = service.host_cache.lock().await;
                cache.clear();
                cache.extend(
                    state
                        .cached_modules
                        .into_iter()
                        .map(|module| (module.module_location, module.modification_time)),
                );
            }
            tokio::time::sleep(service.config.sync_delay).await;
            match service.push_dependencies().await {
                Ok(sent) => info!(sent, "dependency modules synchronised"),
                Err(err) => warn!(error = %err, "dependency synchronisation failed"),
            }
        });
        Outcome::ok()
    }

    /// Send every catalogued module the host lacks, or holds an older copy
    /// of, and return how many were accepted.
    ///
    /// # Errors
    /// Returns [`SyncError`] if the catalog cannot be listed or the host
    /// cannot be reached.
    pub async fn push_dependencies(&self) -> Result<usize, SyncError> {
        let session = self.session().ok_or(SessionError::Terminated)?;
        let mut cache = self.host_cache.lock().await;
        let wanted: Vec<CatalogEntry> = self
            .catalog
            .modules()?
            .into_iter()
            .filter(|entry| {
                cache
                    .get(&entry.module_location)
                    .is_none_or(|cached| *cached < entry.modification_time)
            })
            .collect();

        let shared = self.shared_filesystem.load(Ordering::SeqCst);
        let references: Vec<ModuleReference> = wanted
            .into_iter()
            .filter_map(|entry| {
                let image = if shared {
                    None
                } else {
                    match self.catalog.read_image(&entry) {
                        Ok(image) => Some(image),
                        Err(err) => {
                            warn!(module = %entry.module_location, error = %err, "cannot read module");
                            return None;
                        }
                    }
                };
                Some(ModuleReference {
                    module_name: entry.module_name,
                    module_location: entry.module_location,
                    modification_time: entry.modification_time,
                    image,
                })
            })
            .collect();

        debug!(count = references.len(), "pushing dependency modules");
        let outcomes: Vec<Outcome> = session
            .stream_requests(stream::iter(references.iter().cloned()))
            .await?;
        let mut accepted = 0;
        for (reference, outcome) in references.iter().zip(outcomes) {
            if outcome.success {
                cache.insert(reference.module_location.clone(), reference.modification_time);
                accepted += 1;
            } else {
                warn!(module = %reference.module_location, "host rejected module reference");
            }
        }
        Ok(accepted)
    }

    /// Forward a command from the running application to the host.
    ///
    /// # Errors
    /// Returns [`SessionError::Terminated`] when no host is connected, or the
    /// error of the request itself.
    pub async fn request_command(&self, request: ExecuteCommandRequest) -> Result<Outcome, SessionError> {
        let session = self.session().ok_or(SessionError::Terminated)?;
        session.send_request(request).await
    }

    /// Tell the host the target is alive.
    ///
    /// # Errors
    /// Returns [`SessionError::Terminated`] when no host is connected, or the
    /// error of the request itself.
    pub async fn heartbeat(&self) -> Result<Outcome, SessionError> {
        let session = self.session().ok_or(SessionError::Terminated)?;
        session
            .send_request(HeartbeatRequest { sent_at: Utc::now() })
            .await
    }

    fn session(&self) -> Option<Session> { lock(&self.session).upgrade() }
}

impl ServiceHandler for TargetService {
    fn register(self: Arc<Self>, table: &mut DispatchTableBuilder) {
        let hello = Arc::clone(&self);
        let load = Arc::clone(&self);
        let exec = Arc::clone(&self);
        let sync = self;
        table
            .operation("hello", move |request: HostHello| {
                let reply = hello.hello(&request);
                async move { Ok::<_, HandlerError>(reply) }
            })
            .operation("load_module", move |request: LoadModuleRequest| {
                let service = Arc::clone(&load);
                async move { Ok::<_, HandlerError>(service.load_module(request).await) }
            })
            .operation("exec", move |request: ExecuteCommandRequest| {
                let service = Arc::clone(&exec);
                async move { Ok::<_, HandlerError>(service.exec(request).await) }
            })
            .operation("synchronize_dependencies", move |state: CachedModuleState| {
                let outcome = sync.synchronize_dependencies(state);
                async move { Ok::<_, HandlerError>(outcome) }
            });
    }

    fn attach(&self, session: WeakSession) { *lock(&self.session) = session; }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use rstest::{fixture, rstest};
    use tempfile::NamedTempFile;

    use super::*;
    use crate::reload::catalog::EmptyCatalog;

    #[derive(Default)]
    struct CountingReload {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl ReloadManager for CountingReload {
        async fn load_module(&self, request: LoadModuleRequest) -> Result<Outcome, HandlerError> {
            if request.image.is_empty() {
                return Err("empty image".into());
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Outcome::ok())
        }

        async fn execute_command(&self, request: ExecuteCommandRequest) -> Result<Outcome, HandlerError> {
            Ok(Outcome::ok().with_message(request.args.join(" ")))
        }
    }

    #[fixture]
    fn service() -> Arc<TargetService> {
        TargetService::new(
            TargetConfig {
                application_identifier: "demo".to_owned(),
                root_module_path: "/srv/demo".to_owned(),
                ..TargetConfig::default()
            },
            Arc::new(CountingReload::default()),
            Arc::new(EmptyCatalog),
        )
    }

    #[rstest]
    fn hello_detects_a_shared_file(service: Arc<TargetService>) {
        let probe = NamedTempFile::new().expect("probe file");
        let reply = service.hello(&HostHello {
            shared_host_file_path: Some(probe.path().display().to_string()),
        });
        assert!(reply.can_access_shared_host_file);
        assert!(reply.use_shared_filesystem_dependency_resolution);
        assert_eq!(reply.application_identifier, "demo");
        assert_eq!(reply.root_module_path, "/srv/demo");
    }

    #[rstest]
    #[case::missing(Some("/definitely/not/here".to_owned()))]
    #[case::absent(None)]
    fn hello_without_shared_file(service: Arc<TargetService>, #[case] path: Option<String>) {
        let reply = service.hello(&HostHello {
            shared_host_file_path: path,
        });
        assert!(!reply.can_access_shared_host_file);
        assert!(!reply.use_shared_filesystem_dependency_resolution);
    }

    #[rstest]
    #[tokio::test]
    async fn reload_failures_become_failed_outcomes(service: Arc<TargetService>) {
        let outcome = service
            .load_module(LoadModuleRequest {
                module_name: "broken".to_owned(),
                ..LoadModuleRequest::default()
            })
            .await;
        assert!(!outcome.success);
        let message = &outcome.messages.first().expect("message").message;
        assert!(message.contains("broken"));
        assert!(message.contains("empty image"));
    }

    #[rstest]
    #[tokio::test]
    async fn exec_passes_through(service: Arc<TargetService>) {
        let outcome = service
            .exec(ExecuteCommandRequest::new("echo", ["a", "b"]))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.messages.first().map(|m| m.message.as_str()), Some("a b"));
    }

    #[rstest]
    #[tokio::test]
    async fn calls_to_the_host_need_a_session(service: Arc<TargetService>) {
        let err = service
            .request_command(ExecuteCommandRequest::new("build", Vec::<String>::new()))
            .await
            .expect_err("no session");
        assert!(matches!(err, SessionError::Terminated));
        assert!(matches!(
            service.push_dependencies().await,
            Err(SyncError::Session(SessionError::Terminated))
        ));
    }
}
