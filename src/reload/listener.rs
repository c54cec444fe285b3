//! TCP accept loop for a target.
//!
//! Each accepted host connection gets its own Session and a fresh
//! [`TargetService`]. On shutdown every live Session is closed and the
//! connection tasks are joined before [`TargetListener::run`] returns.

use std::{future::Future, io, net::SocketAddr, sync::Arc};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinSet,
};
use tracing::{debug, info, warn};

use super::{
    catalog::ModuleCatalog,
    reload_registry,
    target::{ReloadManager, TargetConfig, TargetService},
};
use crate::{
    dispatch::ServiceHandler,
    protocol::Registry,
    session::{Session, SessionConfig},
};

/// Accepts host connections for a running target.
pub struct TargetListener {
    listener: TcpListener,
    config: TargetConfig,
    session_config: SessionConfig,
    reload: Arc<dyn ReloadManager>,
    catalog: Arc<dyn ModuleCatalog>,
    registry: Arc<Registry>,
    connected: watch::Sender<Option<Arc<TargetService>>>,
}

impl TargetListener {
    /// Bind to `config.listen`.
    ///
    /// # Errors
    /// Returns the bind error.
    pub async fn bind(
        config: TargetConfig,
        session_config: SessionConfig,
        reload: Arc<dyn ReloadManager>,
        catalog: Arc<dyn ModuleCatalog>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen.as_str()).await?;
        let (connected, _) = watch::channel(None);
        Ok(Self {
            listener,
            config,
            session_config,
            reload,
            catalog,
            registry: reload_registry(),
            connected,
        })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    /// Returns the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> { self.listener.local_addr() }

    /// The service of the most recent host connection.
    ///
    /// The application uses it to call the host, for example
    /// [`TargetService::request_command`].
    #[must_use]
    pub fn connected(&self) -> watch::Receiver<Option<Arc<TargetService>>> { self.connected.subscribe() }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Accept errors are logged and skipped.
    ///
    /// # Errors
    /// Returns an error if the bound address cannot be read.
    pub async fn run<F>(&self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let local = self.local_addr()?;
        info!(%local, "target listening");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut join_set = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                res = self.listener.accept() => {
                    self.handle_accept_result(res, &shutdown_rx, &mut join_set);
                }
            }
        }

        let _ = shutdown_tx.send(true);
        self.connected.send_replace(None);
        while let Some(res) = join_set.join_next().await {
            if let Err(err) = res {
                warn!(error = %err, "connection task failed");
            }
        }
        Ok(())
    }

    fn handle_accept_result(
        &self,
        res: io::Result<(TcpStream, SocketAddr)>,
        shutdown_rx: &watch::Receiver<bool>,
        join_set: &mut JoinSet<()>,
    ) {
        let (socket, peer) = match res {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                return;
            }
        };
        if let Err(err) = socket.set_nodelay(true) {
            debug!(%peer, error = %err, "could not disable Nagle");
        }
        info!(%peer, "host connected");

        let service = TargetService::new(
            self.config.clone(),
            Arc::clone(&self.reload),
            Arc::clone(&self.catalog),
        );
        let handler: Arc<dyn ServiceHandler> = service.clone();
        let session = Session::builder(Arc::clone(&self.registry))
            .config(self.session_config)
            .peer(peer.to_string())
            .handler(handler)
            .spawn(socket);
        self.connected.send_replace(Some(service));

        let mut shutdown = shutdown_rx.clone();
        join_set.spawn(async move {
            tokio::select! {
                () = session.closed() => {}
                _ = shutdown.changed() => {
                    session.shutdown();
                    session.closed().await;
                }
            }
            info!(%peer, "host disconnected");
        });
    }
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(err) = res {
                            warn!(error = %err, "failed to listen for Ctrl-C");
                        }
                    },
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                wait_for_ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        wait_for_ctrl_c().await;
    }
}

async fn wait_for_ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for Ctrl-C");
    }
}
