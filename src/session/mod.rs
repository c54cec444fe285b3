//! Connection engine: one live connection, symmetric request/response.
//!
//! A [`Session`] owns both halves of a byte stream. Its receive loop runs in
//! a dedicated Tokio task and never waits on a handler: every inbound request
//! is served in its own task, and every outbound frame goes through a single
//! write lock so concurrent senders cannot interleave partial frames.
//!
//! ```text
//!  caller ── send_request ──► [write lock] ──► peer
//!    ▲                                          │
//!    └── pending table ◄── receive loop ◄───────┘
//!                              │
//!                              └─► dispatch table ──► handler task ──► [write lock]
//! ```
//!
//! Once the stream ends, or [`Session::shutdown`] is called, the Session is
//! finished for good: waiting callers fail with
//! [`SessionError::Disconnected`] and new calls fail with
//! [`SessionError::Terminated`].

mod errors;
mod pending;
mod receive;

#[cfg(test)]
mod tests;

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use futures_util::{
    SinkExt,
    Stream,
    StreamExt,
    TryStreamExt,
    future::BoxFuture,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Mutex, broadcast, watch},
    time::timeout,
};
use tokio_util::codec::FramedWrite;
use tracing::{Instrument, info_span, warn};
use uuid::Uuid;

pub use self::errors::SessionError;
use self::pending::{PendingEntry, PendingRequests};
use crate::{
    dispatch::{DispatchTable, ServiceHandler},
    frame::{FrameEncoder, FrameError, FrameReader, MAX_PAYLOAD_SIZE, MessageKind, OutboundFrame},
    protocol::{EnvelopeHead, Payload, Registry, Request, Response, ResponseOutcome},
    serializer::{PayloadSerializer, SerializationFormat},
};

/// Default bound on a single frame write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default capacity of the receive-event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;
/// Requests kept in flight at once by [`Session::stream_requests`].
const STREAM_WINDOW: usize = 8;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type DisconnectCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Tunables for a Session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Payload encoding used for every envelope on the connection.
    pub serializer: SerializationFormat,
    /// Upper bound on a single frame write.
    pub write_timeout: Duration,
    /// Largest inbound payload that will be buffered.
    pub max_payload: usize,
    /// Capacity of the receive-event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            serializer: SerializationFormat::default(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_payload: MAX_PAYLOAD_SIZE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SessionConfig {
    /// Use `serializer` for envelopes.
    #[must_use]
    pub const fn with_serializer(mut self, serializer: SerializationFormat) -> Self {
        self.serializer = serializer;
        self
    }

    /// Override the write timeout.
    #[must_use]
    pub const fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Override the inbound payload limit.
    #[must_use]
    pub const fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }
}

/// What the receive loop did with an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiveOutcome {
    /// A request was dispatched or a response reached its caller.
    Success,
    /// The frame's kind, type id, length or envelope was not understood.
    ProtocolNotRecognised,
    /// No handler serves the request's payload type.
    RequestNotHandled,
    /// A response arrived that no caller is waiting for.
    WaywardMessage,
    /// The connection ended.
    Disconnect,
}

/// Published on the receive-event channel for every inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveEvent {
    /// What happened.
    pub outcome: ReceiveOutcome,
    /// Type id from the frame header, when a frame was read.
    pub type_id: Option<i32>,
    /// Identifier of the envelope, when it could be decoded.
    pub request_identifier: Option<String>,
}

impl ReceiveEvent {
    const fn disconnect() -> Self {
        Self {
            outcome: ReceiveOutcome::Disconnect,
            type_id: None,
            request_identifier: None,
        }
    }
}

struct SessionInner {
    peer: String,
    registry: Arc<Registry>,
    dispatch: DispatchTable,
    serializer: SerializationFormat,
    write_timeout: Duration,
    writer: Mutex<FramedWrite<BoxedWriter, FrameEncoder>>,
    pending: PendingRequests,
    events: broadcast::Sender<ReceiveEvent>,
    shutdown: watch::Sender<bool>,
    finished: watch::Sender<bool>,
}

impl SessionInner {
    /// Write one frame under the write lock.
    async fn write_frame(&self, frame: OutboundFrame) -> Result<(), FrameError> {
        let mut writer = self.writer.lock().await;
        let result = match timeout(self.write_timeout, writer.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(FrameError::Timeout),
        };
        drop(writer);
        if let Err(err) = &result {
            // a partial write leaves the stream misaligned
            warn!(peer = %self.peer, error = %err, "frame write failed; closing session");
            self.shutdown.send_replace(true);
        }
        result
    }

    fn publish(&self, event: ReceiveEvent) { let _ = self.events.send(event); }

    fn is_finished(&self) -> bool { *self.finished.borrow() }
}

/// Builds and starts a [`Session`].
pub struct SessionBuilder {
    registry: Arc<Registry>,
    config: SessionConfig,
    peer: String,
    handler: Option<Arc<dyn ServiceHandler>>,
    on_disconnect: Option<DisconnectCallback>,
}

impl SessionBuilder {
    /// Start a builder for the given protocol.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            config: SessionConfig::default(),
            peer: "peer".to_owned(),
            handler: None,
            on_disconnect: None,
        }
    }

    /// Serve inbound requests with `handler`.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn ServiceHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Apply `config`.
    #[must_use]
    pub const fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Label the connection in logs.
    #[must_use]
    pub fn peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    /// Run `callback` once the receive loop has ended and pending requests
    /// have been failed.
    #[must_use]
    pub fn on_disconnect<F, Fut>(mut self, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_disconnect = Some(Box::new(move || -> BoxFuture<'static, ()> {
            Box::pin(callback())
        }));
        self
    }

    /// Bind the Session to `io` and start its receive loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<IO>(self, io: IO) -> Session
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let reader: BoxedReader = Box::new(read_half);
        let writer: BoxedWriter = Box::new(write_half);
        let dispatch = self.handler.as_ref().map_or_else(DispatchTable::empty, |handler| {
            DispatchTable::from_handler(
                Arc::clone(handler),
                Arc::clone(&self.registry),
                self.config.serializer,
            )
        });
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (finished, _) = watch::channel(false);

        let inner = Arc::new(SessionInner {
            peer: self.peer,
            registry: self.registry,
            dispatch,
            serializer: self.config.serializer,
            write_timeout: self.config.write_timeout,
            writer: Mutex::new(FramedWrite::new(writer, FrameEncoder::new())),
            pending: PendingRequests::default(),
            events,
            shutdown,
            finished,
        });
        let session = Session { inner };
        if let Some(handler) = &self.handler {
            handler.attach(session.downgrade());
        }

        let span = info_span!("session", peer = %session.inner.peer);
        let frames = FrameReader::new(reader).with_max_payload(self.config.max_payload);
        tokio::spawn(
            receive::run(
                Arc::clone(&session.inner),
                frames,
                shutdown_rx,
                self.on_disconnect,
            )
            .instrument(span),
        );
        session
    }
}

/// Handle to a live (or finished) connection.
///
/// Cloning is cheap; all clones drive the same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Start building a Session for the given protocol.
    #[must_use]
    pub fn builder(registry: Arc<Registry>) -> SessionBuilder { SessionBuilder::new(registry) }

    /// Send `payload` to the peer and wait for its response.
    ///
    /// There is no implicit timeout; wrap the call if one is needed. Dropping
    /// the future stops waiting but does not cancel the request on the peer.
    ///
    /// # Errors
    /// - [`SessionError::Terminated`] if the Session has already finished.
    /// - [`SessionError::Disconnected`] if it finishes while waiting.
    /// - [`SessionError::Remote`] if the peer answers with a failure outcome.
    /// - [`SessionError::UnregisteredType`] if either type is outside the
    ///   protocol.
    /// - Serializer or frame errors from encoding, decoding and writing.
    pub async fn send_request<Req, Resp>(&self, payload: Req) -> Result<Resp, SessionError>
    where
        Req: Payload,
        Resp: Payload,
    {
        let inner = &self.inner;
        if inner.is_finished() {
            return Err(SessionError::Terminated);
        }
        let request_type = inner
            .registry
            .id_of::<Req>()
            .ok_or(SessionError::UnregisteredType(Req::NAME))?;
        let response_type = inner
            .registry
            .id_of::<Resp>()
            .ok_or(SessionError::UnregisteredType(Resp::NAME))?;

        let request_identifier = Uuid::new_v4().to_string();
        let envelope = inner
            .serializer
            .serialize(&Request::new(request_identifier.as_str(), payload))?;
        // register before writing so a fast reply cannot outrun the entry
        let entry = PendingEntry::new(&inner.pending, request_identifier)?;
        inner
            .write_frame(OutboundFrame::new(MessageKind::Request, request_type, envelope))
            .await?;

        let response = entry.wait().await?;
        let envelope: Response<Resp> = inner.serializer.deserialize(&response.envelope)?;
        match envelope.outcome {
            ResponseOutcome::Success if response.type_id != response_type => {
                Err(SessionError::UnexpectedResponseType {
                    expected: response_type,
                    actual: response.type_id,
                })
            }
            ResponseOutcome::Success => envelope.payload.ok_or(SessionError::MissingPayload),
            outcome => Err(SessionError::Remote {
                outcome,
                detail: envelope.error,
            }),
        }
    }

    /// Answer the request identified by `original` with `payload`.
    ///
    /// Safe to call while other requests and responses are in flight.
    ///
    /// # Errors
    /// Returns [`SessionError::Terminated`] if the Session has finished, and
    /// serializer, registry or frame errors otherwise.
    pub async fn send_response<Resp: Payload>(
        &self,
        original: &EnvelopeHead,
        payload: Resp,
    ) -> Result<(), SessionError> {
        let inner = &self.inner;
        if inner.is_finished() {
            return Err(SessionError::Terminated);
        }
        let response_type = inner
            .registry
            .id_of::<Resp>()
            .ok_or(SessionError::UnregisteredType(Resp::NAME))?;
        let envelope = inner.serializer.serialize(&Response::success(
            original.request_identifier.as_str(),
            payload,
        ))?;
        inner
            .write_frame(OutboundFrame::new(MessageKind::Response, response_type, envelope))
            .await?;
        Ok(())
    }

    /// Send every item of `items` as an independent request, keeping a small
    /// window in flight, and collect the responses in item order.
    ///
    /// # Errors
    /// Stops at and returns the first failed request.
    pub async fn stream_requests<Req, Resp, S>(&self, items: S) -> Result<Vec<Resp>, SessionError>
    where
        Req: Payload,
        Resp: Payload,
        S: Stream<Item = Req> + Send,
    {
        items
            .map(|item| self.send_request::<Req, Resp>(item))
            .buffered(STREAM_WINDOW)
            .try_collect()
            .await
    }

    /// Subscribe to receive-loop events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ReceiveEvent> { self.inner.events.subscribe() }

    /// Close the connection locally.
    ///
    /// The Session finishes exactly as if the peer had disconnected.
    pub fn shutdown(&self) { self.inner.shutdown.send_replace(true); }

    /// Resolve once the Session has finished.
    pub async fn closed(&self) {
        let mut finished = self.inner.finished.subscribe();
        let _finished = finished.wait_for(|done| *done).await;
    }

    /// Whether the receive loop has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool { self.inner.is_finished() }

    /// Whether shutdown was requested or the receive loop has already ended.
    ///
    /// A closing Session accepts no new work even while its receive loop is
    /// still winding down.
    #[must_use]
    pub fn is_closing(&self) -> bool { *self.inner.shutdown.borrow() || self.inner.is_finished() }

    /// Number of outbound requests still awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize { self.inner.pending.len() }

    /// Label given to the connection.
    #[must_use]
    pub fn peer(&self) -> &str { &self.inner.peer }

    /// Protocol registry shared by both peers.
    #[must_use]
    pub fn registry(&self) -> &Registry { &self.inner.registry }

    /// Payload encoding in use.
    #[must_use]
    pub fn serializer(&self) -> SerializationFormat { self.inner.serializer }

    /// Whether both handles drive the same connection.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.inner, &other.inner) }

    /// Create a handle that does not keep the Session alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.inner.peer)
            .field("serializer", &self.inner.serializer)
            .field("finished", &self.inner.is_finished())
            .finish_non_exhaustive()
    }
}

/// Non-owning handle to a [`Session`].
#[derive(Clone, Default)]
pub struct WeakSession {
    inner: Weak<SessionInner>,
}

impl WeakSession {
    /// Recover the Session if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Session> { self.inner.upgrade().map(|inner| Session { inner }) }
}

impl fmt::Debug for WeakSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakSession")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
