//! Bidirectional framed RPC over a single stream, and the hot-reload
//! protocol built on it.
//!
//! A [`Session`](session::Session) owns one connection and lets both peers
//! issue requests to each other over it. Frames carry a small header
//! ([`frame`]) around an envelope encoded by a pluggable
//! [`serializer`]. Payload types map to integer ids through a
//! [`protocol::Registry`] that both peers derive from the same protocol
//! description, and inbound requests reach local code through a
//! [`dispatch::DispatchTable`]. The [`lifecycle`] module keeps a Session
//! alive across network failures.
//!
//! The [`reload`] module defines the host and target of a hot-reload
//! channel on top of these pieces, and [`server`] hosts the binary's
//! command-line front end.

pub mod dispatch;
pub mod frame;
pub mod lifecycle;
pub mod protocol;
pub mod reload;
pub mod serializer;
pub mod server;
pub mod session;

pub use dispatch::{DispatchTable, DispatchTableBuilder, HandlerError, ServiceHandler};
pub use lifecycle::{ChannelState, Connector, ReconnectConfig, Reconnector, TcpConnector};
pub use protocol::{Payload, ProtocolDescription, Registry, ResponseOutcome};
pub use serializer::SerializationFormat;
pub use session::{ReceiveEvent, ReceiveOutcome, Session, SessionConfig, SessionError, WeakSession};
