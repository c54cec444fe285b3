//! Channel lifecycle: connect, stay ready, reconnect.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ wait_for_connection ┌────────────┐  connected  ┌───────┐
//! │ Idle │────────────────────>│ Connecting │────────────>│ Ready │
//! └──────┘                     └────────────┘             └───────┘
//!                                ↑        │ error/timeout      │ session ended
//!                        backoff │        ↓                    ↓
//!                           ┌──────────────────┐          ┌──────────┐
//!                           │ TransientFailure │          │ Shutdown │
//!                           └──────────────────┘          └──────────┘
//! ```
//!
//! Connect attempts retry without limit; stopping is up to the caller.
//! Every transition is published, in order, to all subscribers.

mod connector;


use std::{
    fmt,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        Weak,
    },
    time::Duration,
};

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::{
    sync::{broadcast, oneshot, watch},
    time::{sleep, timeout},
};
use tracing::{info, warn};

pub use self::connector::{Connector, TcpConnector};
use crate::{
    dispatch::ServiceHandler,
    protocol::Registry,
    session::{Session, SessionConfig},
};

/// Default delay between failed connect attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);
/// Default bound on a single connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HISTORY_CAPACITY: usize = 64;

/// Connectivity of a reconnecting channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Nothing has been attempted yet.
    Idle,
    /// A connect attempt is in progress.
    Connecting,
    /// A Session is live.
    Ready,
    /// The last connect attempt failed; a retry follows after the backoff.
    TransientFailure,
    /// The live Session ended.
    Shutdown,
}

impl ChannelState {
    /// Whether an external waiter should stop waiting on this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Idle | Self::TransientFailure | Self::Shutdown)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::TransientFailure => "transient-failure",
            Self::Shutdown => "shutdown",
        })
    }
}

/// Retry policy and the configuration handed to each new Session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay after a failed attempt.
    pub backoff: Duration,
    /// Bound on a single attempt.
    pub connect_timeout: Duration,
    /// Configuration for every Session the reconnector creates.
    pub session: SessionConfig,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            session: SessionConfig::default(),
        }
    }
}

impl ReconnectConfig {
    /// Override the retry delay.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Override the per-attempt timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Override the Session configuration.
    #[must_use]
    pub const fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }
}

struct ReconnectorInner<C> {
    connector: C,
    registry: Arc<Registry>,
    handler: Option<Arc<dyn ServiceHandler>>,
    config: ReconnectConfig,
    state: watch::Sender<ChannelState>,
    history: broadcast::Sender<ChannelState>,
    /// Latest terminal state published after the first `Ready`.
    settled: watch::Sender<Option<ChannelState>>,
    /// Serialises transitions; holds whether `Ready` has been published.
    ready_seen: Mutex<bool>,
    session: Mutex<Option<Session>>,
    connecting: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<C> ReconnectorInner<C> {
    fn transition(&self, next: ChannelState) {
        let mut ready_seen = lock(&self.ready_seen);
        if next == ChannelState::Ready {
            *ready_seen = true;
        }
        let previous = self.state.send_replace(next);
        let _ = self.history.send(next);
        if *ready_seen && next.is_terminal() {
            self.settled.send_replace(Some(next));
        }
        info!(from = %previous, to = %next, "channel state changed");
    }

    fn current(&self) -> ChannelState { *self.state.borrow() }

    /// The current state if it is terminal and `Ready` came before it.
    fn settled_now(&self) -> Option<ChannelState> {
        let ready_seen = lock(&self.ready_seen);
        let current = self.current();
        (*ready_seen && current.is_terminal()).then_some(current)
    }

    fn session_ended(&self, ended: &Session) {
        {
            let mut slot = lock(&self.session);
            if slot.as_ref().is_some_and(|s| s.ptr_eq(ended)) {
                *slot = None;
            }
        }
        self.transition(ChannelState::Shutdown);
    }
}

/// Builds a [`Reconnector`].
pub struct ReconnectorBuilder<C> {
    connector: C,
    registry: Arc<Registry>,
    handler: Option<Arc<dyn ServiceHandler>>,
    config: ReconnectConfig,
}

impl<C: Connector> ReconnectorBuilder<C> {
    /// Serve requests from the peer with `handler` on every Session.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn ServiceHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Apply `config`.
    #[must_use]
    pub fn config(mut self, config: ReconnectConfig) -> Self {
        self.config = config;
        self
    }

    /// Finish building. The channel starts out [`ChannelState::Idle`].
    #[must_use]
    pub fn build(self) -> Reconnector<C> {
        let (state, _) = watch::channel(ChannelState::Idle);
        let (history, _) = broadcast::channel(HISTORY_CAPACITY);
        let (settled, _) = watch::channel(None);
        Reconnector {
            inner: Arc::new(ReconnectorInner {
                connector: self.connector,
                registry: self.registry,
                handler: self.handler,
                config: self.config,
                state,
                history,
                settled,
                ready_seen: Mutex::new(false),
                session: Mutex::new(None),
                connecting: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

/// Keeps one Session alive across connection failures.
pub struct Reconnector<C> {
    inner: Arc<ReconnectorInner<C>>,
}

impl<C> Clone for Reconnector<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> Reconnector<C> {
    /// Start building a reconnector that dials with `connector`.
    #[must_use]
    pub fn builder(connector: C, registry: Arc<Registry>) -> ReconnectorBuilder<C> {
        ReconnectorBuilder {
            connector,
            registry,
            handler: None,
            config: ReconnectConfig::default(),
        }
    }

    /// Return the live Session, connecting (and retrying forever) if there is
    /// none.
    ///
    /// Concurrent callers share one connect loop and receive the same
    /// Session. A Session that is shutting down is never handed out; the
    /// caller waits for it to finish and gets a fresh one.
    pub async fn wait_for_connection(&self) -> Session {
        let _connecting = self.inner.connecting.lock().await;
        let previous = lock(&self.inner.session).clone();
        if let Some(session) = previous {
            if !session.is_closing() {
                return session;
            }
            session.closed().await;
            // let the ended Session publish Shutdown before reconnecting
            let mut state = self.inner.state.subscribe();
            let _ = state.wait_for(|s| *s != ChannelState::Ready).await;
        }
        loop {
            self.inner.transition(ChannelState::Connecting);
            let attempt = timeout(self.inner.config.connect_timeout, self.inner.connector.connect());
            match attempt.await {
                Ok(Ok(io)) => return self.start_session(io),
                Ok(Err(err)) => {
                    warn!(peer = %self.inner.connector.describe(), error = %err, "connect failed");
                }
                Err(_) => {
                    warn!(peer = %self.inner.connector.describe(), "connect timed out");
                }
            }
            self.inner.transition(ChannelState::TransientFailure);
            sleep(self.inner.config.backoff).await;
        }
    }

    fn start_session(&self, io: C::Io) -> Session {
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let owner: Weak<ReconnectorInner<C>> = Arc::downgrade(&self.inner);
        let (session_tx, session_rx) = oneshot::channel::<Session>();
        let mut builder = Session::builder(Arc::clone(&self.inner.registry))
            .config(self.inner.config.session)
            .peer(self.inner.connector.describe())
            .on_disconnect(move || async move {
                // Shutdown must follow Ready even if the Session dies at once
                let _ = ready_rx.await;
                if let (Some(owner), Ok(ended)) = (owner.upgrade(), session_rx.await) {
                    owner.session_ended(&ended);
                }
            });
        if let Some(handler) = &self.inner.handler {
            builder = builder.handler(Arc::clone(handler));
        }
        let session = builder.spawn(io);
        *lock(&self.inner.session) = Some(session.clone());
        self.inner.transition(ChannelState::Ready);
        let _ = session_tx.send(session.clone());
        let _ = ready_tx.send(());
        session
    }

    /// Wait until the channel reaches a terminal state after having been
    /// [`ChannelState::Ready`] at least once, and return that state.
    pub async fn wait_for_terminal_state(&self) -> ChannelState {
        let mut settled = self.inner.settled.subscribe();
        if let Some(state) = self.inner.settled_now() {
            return state;
        }
        loop {
            if settled.changed().await.is_err() {
                return self.inner.current();
            }
            if let Some(state) = *settled.borrow_and_update() {
                return state;
            }
        }
    }

    /// Every state from now on, starting with the current one.
    ///
    /// Subscribers that fall far behind skip the states they missed.
    #[must_use]
    pub fn channel_state(&self) -> BoxStream<'static, ChannelState> {
        let history = self.inner.history.subscribe();
        let current = self.inner.current();
        stream::once(async move { current })
            .chain(stream::unfold(history, |mut history| async move {
                loop {
                    match history.recv().await {
                        Ok(state) => return Some((state, history)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "channel state observer lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }))
            .boxed()
    }

    /// Ordered receiver of future state transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelState> { self.inner.history.subscribe() }

    /// The state right now.
    #[must_use]
    pub fn current_state(&self) -> ChannelState { self.inner.current() }

    /// The live Session, if the channel is ready.
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        lock(&self.inner.session)
            .as_ref()
            .filter(|session| !session.is_closing())
            .cloned()
    }

    /// Shut the live Session down, if any.
    ///
    /// The channel moves to [`ChannelState::Shutdown`] once the Session has
    /// finished. A later [`wait_for_connection`](Self::wait_for_connection)
    /// waits for that and connects again.
    pub fn close(&self) {
        if let Some(session) = lock(&self.inner.session).as_ref() {
            session.shutdown();
        }
    }
}
