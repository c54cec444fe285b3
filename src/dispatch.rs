//! Maps inbound request payload types to the local functions that serve them.
//!
//! A handler object advertises its operations once, when a Session is
//! built, by implementing [`ServiceHandler::register`]. Each registration
//! stores a type-erased closure that decodes the typed request envelope,
//! awaits the handler and encodes the typed response envelope, so the
//! receive loop only ever moves bytes.

use std::{
    collections::{HashMap, hash_map::Entry},
    error::Error,
    future::Future,
    sync::Arc,
};

use futures_util::{FutureExt, future::BoxFuture};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    protocol::{Payload, Registry, Request, Response},
    serializer::{PayloadSerializer, SerializationFormat, SerializerError},
    session::WeakSession,
};

/// Error type returned by handler functions.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Errors raised at the dispatch boundary.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No operation is registered for the request's type id.
    #[error("no handler registered for type id {0}")]
    NotHandled(i32),
    /// The request envelope could not be decoded.
    #[error("failed to decode request: {0}")]
    Decode(#[source] SerializerError),
    /// The handler returned an error.
    #[error("{0}")]
    Handler(HandlerError),
    /// The response envelope could not be encoded.
    #[error("failed to encode response: {0}")]
    Encode(#[source] SerializerError),
}

/// An object that serves requests arriving on a Session.
pub trait ServiceHandler: Send + Sync + 'static {
    /// Register one operation per accepted request type.
    fn register(self: Arc<Self>, table: &mut DispatchTableBuilder);

    /// Receive a handle to the Session serving this handler.
    ///
    /// Called once, after the Session is built and before its receive loop
    /// starts. Handlers that need to call back into the peer keep the handle.
    fn attach(&self, session: WeakSession) { let _ = session; }
}

type ErasedHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, DispatchError>> + Send + Sync>;

#[derive(Clone)]
struct DispatchEntry {
    operation: &'static str,
    response_type: i32,
    handler: ErasedHandler,
}

/// A dispatched request, ready to be awaited.
pub struct DispatchCall {
    /// Name of the operation serving the request.
    pub operation: &'static str,
    /// Type id to put on the success response frame.
    pub response_type: i32,
    /// Resolves to the encoded response envelope.
    pub future: BoxFuture<'static, Result<Vec<u8>, DispatchError>>,
}

/// Collects operations while a [`DispatchTable`] is being built.
pub struct DispatchTableBuilder {
    registry: Arc<Registry>,
    serializer: SerializationFormat,
    entries: HashMap<i32, DispatchEntry>,
}

impl DispatchTableBuilder {
    /// Start an empty table for the given protocol and encoding.
    #[must_use]
    pub fn new(registry: Arc<Registry>, serializer: SerializationFormat) -> Self {
        Self {
            registry,
            serializer,
            entries: HashMap::new(),
        }
    }

    /// Register `handler` as the operation serving `Req`.
    ///
    /// The first registration for a request type wins; later ones are
    /// ignored. Operations whose types are missing from the registry are
    /// skipped with a warning, since the peer could never address them.
    pub fn operation<Req, Resp, F, Fut>(&mut self, name: &'static str, handler: F) -> &mut Self
    where
        Req: Payload,
        Resp: Payload,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        let (Some(request_type), Some(response_type)) =
            (self.registry.id_of::<Req>(), self.registry.id_of::<Resp>())
        else {
            warn!(
                operation = name,
                request = Req::NAME,
                response = Resp::NAME,
                "operation uses types outside the protocol; skipping"
            );
            return self;
        };

        match self.entries.entry(request_type) {
            Entry::Occupied(existing) => {
                debug!(
                    operation = name,
                    kept = existing.get().operation,
                    "duplicate operation for {}; keeping the first",
                    Req::NAME
                );
            }
            Entry::Vacant(slot) => {
                let serializer = self.serializer;
                let handler = Arc::new(handler);
                let erased: ErasedHandler = Arc::new(move |bytes: Vec<u8>| {
                    let handler = Arc::clone(&handler);
                    async move {
                        let request: Request<Req> = serializer
                            .deserialize(&bytes)
                            .map_err(DispatchError::Decode)?;
                        let payload = handler(request.payload)
                            .await
                            .map_err(DispatchError::Handler)?;
                        serializer
                            .serialize(&Response::success(request.request_identifier, payload))
                            .map_err(DispatchError::Encode)
                    }
                    .boxed()
                });
                slot.insert(DispatchEntry {
                    operation: name,
                    response_type,
                    handler: erased,
                });
            }
        }
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> DispatchTable {
        DispatchTable {
            entries: self.entries,
        }
    }
}

/// Immutable request-type to handler mapping owned by one Session.
#[derive(Clone, Default)]
pub struct DispatchTable {
    entries: HashMap<i32, DispatchEntry>,
}

impl DispatchTable {
    /// A table that serves nothing.
    #[must_use]
    pub fn empty() -> Self { Self::default() }

    /// Build a table from `handler`'s registrations.
    #[must_use]
    pub fn from_handler(
        handler: Arc<dyn ServiceHandler>,
        registry: Arc<Registry>,
        serializer: SerializationFormat,
    ) -> Self {
        let mut builder = DispatchTableBuilder::new(registry, serializer);
        handler.register(&mut builder);
        builder.build()
    }

    /// Whether a handler is registered for `request_type`.
    #[must_use]
    pub fn handles(&self, request_type: i32) -> bool { self.entries.contains_key(&request_type) }

    /// Number of registered operations.
    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    /// Whether no operations are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Route an encoded request envelope to its handler.
    ///
    /// # Errors
    /// Returns [`DispatchError::NotHandled`] when no operation serves
    /// `request_type`.
    pub fn dispatch(&self, request_type: i32, envelope: Vec<u8>) -> Result<DispatchCall, DispatchError> {
        let entry = self
            .entries
            .get(&request_type)
            .ok_or(DispatchError::NotHandled(request_type))?;
        Ok(DispatchCall {
            operation: entry.operation,
            response_type: entry.response_type,
            future: (entry.handler)(envelope),
        })
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut operations: Vec<_> = self.entries.values().map(|e| e.operation).collect();
        operations.sort_unstable();
        f.debug_struct("DispatchTable")
            .field("operations", &operations)
            .finish()
    }
}
