//! Stream factories for the link engine.
//!
//! The engine asks its [`Connector`] for a fresh stream every time it
//! (re)connects. Tests plug in in-memory duplex streams through the same
//! trait.

use std::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Produces byte streams to a device.
pub trait Connector: Send + 'static {
    /// Stream type produced on success.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new stream. Called again after every transport fault.
    fn connect(&mut self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Endpoint description for logs.
    fn describe(&self) -> String;
}

/// Client side TCP: dial a device.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    /// Dial `address` (`host:port`) on every connect.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&mut self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        debug!(address = %self.address, "TCP connection established");
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

/// Server side TCP: wait for a device to dial in.
///
/// The listener is bound on first use and kept across reconnects, so a
/// device that drops its connection can simply dial again.
#[derive(Debug)]
pub struct TcpAcceptor {
    port: u16,
    listener: Option<TcpListener>,
}

impl TcpAcceptor {
    /// Listen on all interfaces at `port`.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            listener: None,
        }
    }

    /// Use an already bound listener.
    #[must_use]
    pub fn from_listener(listener: TcpListener) -> Self {
        let port = listener.local_addr().map_or(0, |addr| addr.port());
        Self {
            port,
            listener: Some(listener),
        }
    }
}

impl Connector for TcpAcceptor {
    type Stream = TcpStream;

    async fn connect(&mut self) -> io::Result<TcpStream> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => {
                let bound = TcpListener::bind(("0.0.0.0", self.port)).await?;
                info!(port = self.port, "listening for device connection");
                bound
            }
        };
        let accepted = listener.accept().await;
        self.listener = Some(listener);
        let (stream, peer) = accepted?;
        stream.set_nodelay(true)?;
        info!(%peer, "device connected");
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("tcp://0.0.0.0:{} (accept)", self.port)
    }
}
