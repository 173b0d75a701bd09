//! Where connections come from.
//!
//! The client obtains its connections from a [`SocketFactory`]; the listener
//! obtains them from an [`Acceptor`].  Both are traits so that tests can
//! substitute failing or wrapped sockets; the TCP implementations here are
//! what production code uses.

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Creates connected streams to one fixed destination.
pub trait SocketFactory: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn create_socket(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Connects over TCP to a host name and port.
#[derive(Debug, Clone)]
pub struct TcpSocketFactory {
    host: String,
    port: u16,
}

impl TcpSocketFactory {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl SocketFactory for TcpSocketFactory {
    type Stream = TcpStream;

    async fn create_socket(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        // Requests and acks are tiny; don't let Nagle hold them back.
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl std::fmt::Display for TcpSocketFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Source of inbound connections for a listener.
pub trait Acceptor: Send + 'static {
    fn accept(&mut self) -> impl Future<Output = io::Result<TcpStream>> + Send;
}

impl Acceptor for TcpListener {
    async fn accept(&mut self) -> io::Result<TcpStream> {
        let (stream, _peer) = TcpListener::accept(self).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
