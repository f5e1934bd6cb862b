//! Client request server.
//!
//! Serves bincode frames on connections the mux routes to it. Produce and
//! consume are checked against an [`Authorizer`] using the common name of
//! the client certificate as the subject.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{Instrument, Span, debug, info, warn};

use crate::api::{ClientRequest, ClientResponse, ServerInfo};
use crate::codec::{FrameReader, FrameWriter};
use crate::error::{ApiError, ClientError, ClientResult, TransportError, TransportResult};
use crate::log::Record;
use crate::mux::{BoxedStream, MuxListener};
use crate::tls;

pub const OBJECT_WILDCARD: &str = "*";
pub const PRODUCE_ACTION: &str = "produce";
pub const CONSUME_ACTION: &str = "consume";

/// Subject used for connections without a client certificate.
pub const ANONYMOUS: &str = "anonymous";

const CONSUME_STREAM_POLL: Duration = Duration::from_millis(100);

pub trait Authorizer: Send + Sync {
    fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<(), ApiError>;
}

/// Permits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _subject: &str, _object: &str, _action: &str) -> Result<(), ApiError> {
        Ok(())
    }
}

/// Allow-list of `(subject, object, action)` triples.
///
/// The policy file holds one rule per line, `subject, object, action`,
/// optionally prefixed by `p,`. Blank lines and `#` comments are skipped.
#[derive(Debug, Default, Clone)]
pub struct AclAuthorizer {
    rules: HashSet<(String, String, String)>,
}

impl AclAuthorizer {
    pub fn from_policy_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    pub fn parse(policy: &str) -> Self {
        let mut rules = HashSet::new();
        for line in policy.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() == 4 && fields[0] == "p" {
                fields.remove(0);
            }
            match fields.as_slice() {
                [subject, object, action] => {
                    rules.insert((subject.to_string(), object.to_string(), action.to_string()));
                }
                _ => warn!("Ignoring malformed policy line: {}", line),
            }
        }
        Self { rules }
    }

    pub fn allow(mut self, subject: &str, object: &str, action: &str) -> Self {
        self.rules
            .insert((subject.to_string(), object.to_string(), action.to_string()));
        self
    }
}

impl Authorizer for AclAuthorizer {
    fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<(), ApiError> {
        let key = (subject.to_string(), object.to_string(), action.to_string());
        if self.rules.contains(&key) {
            Ok(())
        } else {
            Err(ApiError::PermissionDenied {
                subject: subject.to_string(),
                object: object.to_string(),
                action: action.to_string(),
            })
        }
    }
}

/// The commit log operations the server exposes.
#[async_trait]
pub trait CommitLogService: Send + Sync {
    async fn append(&self, record: Record) -> ClientResult<u64>;

    async fn read(&self, offset: u64) -> ClientResult<Record>;
}

/// Source of the cluster view answered to `GetServers`.
#[async_trait]
pub trait ServerDirectory: Send + Sync {
    async fn get_servers(&self) -> ClientResult<Vec<ServerInfo>>;
}

pub struct LogServer {
    log: Arc<dyn CommitLogService>,
    directory: Arc<dyn ServerDirectory>,
    authorizer: Arc<dyn Authorizer>,
    tls: Option<TlsAcceptor>,
    span: Span,
}

impl LogServer {
    pub fn new(
        log: Arc<dyn CommitLogService>,
        directory: Arc<dyn ServerDirectory>,
        span: Span,
    ) -> Self {
        Self {
            log,
            directory,
            authorizer: Arc::new(AllowAll),
            tls: None,
            span,
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Serves connections until the listener closes.
    pub async fn serve(self: Arc<Self>, mut listener: MuxListener) {
        info!(parent: &self.span, "Log server accepting on {}", listener.local_addr());
        loop {
            match listener.accept().await {
                Ok(stream) => {
                    let peer = stream.peer_addr().ok();
                    debug!(parent: &self.span, "New client connection from {:?}", peer);
                    let server = self.clone();
                    tokio::spawn(
                        async move {
                            if let Err(e) = server.handle_client(stream).await {
                                warn!("Error handling client {:?}: {}", peer, e);
                            }
                        }
                        .instrument(self.span.clone()),
                    );
                }
                Err(TransportError::Closed) => {
                    info!(parent: &self.span, "Log server listener closed");
                    return;
                }
                Err(e) => {
                    warn!(parent: &self.span, "Failed to accept client: {}", e);
                }
            }
        }
    }

    async fn handle_client(&self, stream: TcpStream) -> TransportResult<()> {
        let (stream, subject): (BoxedStream, String) = match &self.tls {
            Some(acceptor) => {
                let stream = acceptor.accept(stream).await?;
                let subject = tls::peer_common_name(stream.get_ref().1.peer_certificates())
                    .unwrap_or_else(|| ANONYMOUS.to_string());
                (Box::new(stream), subject)
            }
            None => (Box::new(stream), ANONYMOUS.to_string()),
        };

        let (reader, writer) = tokio::io::split(stream);
        let mut reader = FrameReader::new(reader);
        let mut writer = FrameWriter::new(writer);

        while let Some(request) = reader.read_bincode::<ClientRequest>().await? {
            if let ClientRequest::ConsumeStream { offset } = request {
                return self
                    .consume_stream(&subject, offset, &mut reader, &mut writer)
                    .await;
            }
            let response = self.handle(&subject, request).await;
            writer.write_bincode(&response).await?;
        }
        Ok(())
    }

    /// Sends records from `offset` on as they become readable. Ends when the
    /// client closes its side or sends anything more, or when a read fails for
    /// a reason other than the offset not existing yet.
    async fn consume_stream<R, W>(
        &self,
        subject: &str,
        mut offset: u64,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> TransportResult<()>
    where
        R: tokio::io::AsyncRead + Unpin,
        W: tokio::io::AsyncWrite + Unpin,
    {
        if let Err(e) = self
            .authorizer
            .authorize(subject, OBJECT_WILDCARD, CONSUME_ACTION)
        {
            return writer.write_bincode(&ClientResponse::Error(e)).await;
        }

        // One read outlives every poll so no partial frame is dropped.
        let closed = reader.read_frame();
        tokio::pin!(closed);

        loop {
            match self.log.read(offset).await {
                Ok(record) => {
                    writer
                        .write_bincode(&ClientResponse::Consumed { record })
                        .await?;
                    offset += 1;
                }
                Err(ClientError::Log(e)) if e.is_out_of_range() => {
                    tokio::select! {
                        _ = tokio::time::sleep(CONSUME_STREAM_POLL) => {}
                        frame = &mut closed => {
                            debug!("Consume stream at offset {} closed by client", offset);
                            return frame.map(|_| ());
                        }
                    }
                }
                Err(e) => {
                    return writer
                        .write_bincode(&ClientResponse::Error(e.into()))
                        .await;
                }
            }
        }
    }

    /// Handles one request on behalf of `subject`.
    pub async fn handle(&self, subject: &str, request: ClientRequest) -> ClientResponse {
        match request {
            ClientRequest::Produce { record } => {
                if let Err(e) = self
                    .authorizer
                    .authorize(subject, OBJECT_WILDCARD, PRODUCE_ACTION)
                {
                    return e.into();
                }
                match self.log.append(record).await {
                    Ok(offset) => ClientResponse::Produced { offset },
                    Err(e) => ApiError::from(e).into(),
                }
            }
            ClientRequest::Consume { offset } | ClientRequest::ConsumeStream { offset } => {
                if let Err(e) = self
                    .authorizer
                    .authorize(subject, OBJECT_WILDCARD, CONSUME_ACTION)
                {
                    return e.into();
                }
                match self.log.read(offset).await {
                    Ok(record) => ClientResponse::Consumed { record },
                    Err(e) => ApiError::from(e).into(),
                }
            }
            ClientRequest::GetServers => match self.directory.get_servers().await {
                Ok(servers) => ClientResponse::Servers { servers },
                Err(e) => ApiError::from(e).into(),
            },
        }
    }
}
