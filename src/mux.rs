//! One listening socket shared by consensus RPCs and client requests.
//!
//! The mux peeks at the first byte of every accepted connection and hands
//! the still-unread connection to the first listener whose matcher accepts
//! that byte. Matchers are tried in registration order.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::error::{TransportError, TransportResult};

const DEFAULT_PEEK_TIMEOUT: Duration = Duration::from_secs(5);
const LISTENER_BACKLOG: usize = 64;

/// Any bidirectional byte stream the transport can hand around.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Decides whether a connection belongs to a listener from its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matcher {
    Byte(u8),
    Any,
}

impl Matcher {
    fn matches(&self, first: u8) -> bool {
        match self {
            Matcher::Byte(tag) => *tag == first,
            Matcher::Any => true,
        }
    }
}

pub fn match_byte(tag: u8) -> Matcher {
    Matcher::Byte(tag)
}

pub fn match_any() -> Matcher {
    Matcher::Any
}

/// Connections routed to one matcher.
pub struct MuxListener {
    rx: mpsc::Receiver<TcpStream>,
    addr: SocketAddr,
}

impl MuxListener {
    pub async fn accept(&mut self) -> TransportResult<TcpStream> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

pub struct Mux {
    listener: TcpListener,
    addr: SocketAddr,
    routes: Vec<(Matcher, mpsc::Sender<TcpStream>)>,
    peek_timeout: Duration,
    span: Span,
}

impl Mux {
    pub async fn bind(addr: &str, span: Span) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!(parent: &span, "Mux listening on {}", addr);

        Ok(Self {
            listener,
            addr,
            routes: Vec::new(),
            peek_timeout: DEFAULT_PEEK_TIMEOUT,
            span,
        })
    }

    pub fn with_peek_timeout(mut self, timeout: Duration) -> Self {
        self.peek_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Registers a matcher. Earlier registrations win.
    pub fn listen(&mut self, matcher: Matcher) -> MuxListener {
        let (tx, rx) = mpsc::channel(LISTENER_BACKLOG);
        self.routes.push((matcher, tx));
        MuxListener {
            rx,
            addr: self.addr,
        }
    }

    /// Runs the accept loop until the returned handle is aborted. Aborting
    /// closes every [`MuxListener`].
    pub fn serve(self) -> JoinHandle<()> {
        let span = self.span.clone();
        tokio::spawn(self.run().instrument(span))
    }

    async fn run(self) {
        let Mux {
            listener,
            routes,
            peek_timeout,
            ..
        } = self;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let routes = routes.clone();
                    tokio::spawn(
                        async move {
                            if let Err(e) = route(stream, &routes, peek_timeout).await {
                                debug!("Dropped connection from {}: {}", peer, e);
                            }
                        }
                        .in_current_span(),
                    );
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn route(
    stream: TcpStream,
    routes: &[(Matcher, mpsc::Sender<TcpStream>)],
    peek_timeout: Duration,
) -> TransportResult<()> {
    let mut first = [0u8; 1];
    let n = tokio::time::timeout(peek_timeout, stream.peek(&mut first))
        .await
        .map_err(|_| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no data before peek timeout",
            ))
        })??;
    if n == 0 {
        return Err(TransportError::Closed);
    }

    let Some((_, tx)) = routes.iter().find(|(m, _)| m.matches(first[0])) else {
        warn!("No listener for stream tag {}", first[0]);
        return Err(TransportError::UnexpectedTag(first[0]));
    };

    tx.send(stream).await.map_err(|_| TransportError::Closed)
}
