//! Consensus connections over the shared listener.
//!
//! Outbound dials lead with [`RAFT_RPC`] so the mux can route them, then
//! optionally upgrade to TLS with the peer trust domain. Inbound connections
//! must carry the same tag.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{TransportError, TransportResult};
use crate::mux::{BoxedStream, MuxListener};
use crate::tls;

/// First byte of every consensus connection.
pub const RAFT_RPC: u8 = 1;

pub struct StreamLayer {
    listener: Mutex<MuxListener>,
    server_tls: Option<TlsAcceptor>,
    peer_tls: Option<TlsConnector>,
    addr: SocketAddr,
}

impl StreamLayer {
    /// `listener` should be registered with `match_byte(RAFT_RPC)`.
    pub fn new(
        listener: MuxListener,
        server_tls: Option<TlsAcceptor>,
        peer_tls: Option<TlsConnector>,
    ) -> Self {
        let addr = listener.local_addr();
        Self {
            listener: Mutex::new(listener),
            server_tls,
            peer_tls,
            addr,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn dial(&self, addr: &str, timeout: Duration) -> TransportResult<BoxedStream> {
        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial {} timed out", addr),
                ))
            })??;
        stream.set_nodelay(true)?;
        stream.write_u8(RAFT_RPC).await?;

        match &self.peer_tls {
            Some(connector) => {
                let name = tls::server_name(addr)?;
                let stream = connector.connect(name, stream).await?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(stream)),
        }
    }

    /// Waits for the next consensus connection with its tag consumed. The TLS
    /// handshake is left to [`StreamLayer::secure`] so a slow peer does not
    /// stall the accept loop.
    pub async fn accept_tagged(&self) -> TransportResult<TcpStream> {
        let mut stream = self.listener.lock().await.accept().await?;
        let tag = stream.read_u8().await?;
        if tag != RAFT_RPC {
            return Err(TransportError::UnexpectedTag(tag));
        }
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    pub async fn secure(&self, stream: TcpStream) -> TransportResult<BoxedStream> {
        match &self.server_tls {
            Some(acceptor) => Ok(Box::new(acceptor.accept(stream).await?)),
            None => Ok(Box::new(stream)),
        }
    }

    pub async fn accept(&self) -> TransportResult<BoxedStream> {
        let stream = self.accept_tagged().await?;
        self.secure(stream).await
    }
}
