//! Transport establishment for the reconnector.

use std::io;

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

/// Opens a fresh byte stream to the peer.
///
/// Called once per connect attempt. Implementations should not retry
/// internally; the reconnector owns the retry policy.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Stream type produced by a successful attempt.
    type Io: AsyncRead + AsyncWrite + Send + 'static;

    /// Make one connection attempt.
    async fn connect(&self) -> io::Result<Self::Io>;

    /// Human-readable peer address for logs.
    fn describe(&self) -> String;
}

/// Connects over TCP with Nagle's algorithm disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Connect to `addr` (`host:port`).
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self { Self { addr: addr.into() } }

    /// Target address.
    #[must_use]
    pub fn addr(&self) -> &str { &self.addr }
}

#[async_trait]
impl Connector for TcpConnector {
    type Io = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(self.addr.as_str()).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn describe(&self) -> String { self.addr.clone() }
}
