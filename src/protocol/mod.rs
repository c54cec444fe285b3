//! Shared protocol description, type-id registry and message envelopes.

pub mod envelope;
pub mod registry;

pub use envelope::{EnvelopeHead, Request, Response, ResponseOutcome};
pub use registry::{OperationDescriptor, Payload, ProtocolDescription, Registry};
