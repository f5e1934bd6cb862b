use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::api::{ClientRequest, ClientResponse};
use crate::codec::{FrameReader, FrameWriter};
use crate::error::{RouterError, RouterResult, TransportError, TransportResult};
use crate::log::Record;
use crate::mux::BoxedStream;
use crate::tls;

struct Framed {
    reader: FrameReader<ReadHalf<BoxedStream>>,
    writer: FrameWriter<WriteHalf<BoxedStream>>,
}

/// Client side TLS for request connections.
#[derive(Clone)]
pub struct ClientTls {
    pub connector: TlsConnector,
    /// Name the servers' certificates are issued for. Defaults to the host
    /// part of each address.
    pub server_name: Option<String>,
}

/// A lazily dialed request connection to one server.
pub struct Conn {
    addr: String,
    dial_timeout: Duration,
    tls: Option<ClientTls>,
    framed: Mutex<Option<Framed>>,
}

impl Conn {
    pub fn new(addr: impl Into<String>, dial_timeout: Duration, tls: Option<ClientTls>) -> Self {
        Self {
            addr: addr.into(),
            dial_timeout,
            tls,
            framed: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn dial(&self) -> TransportResult<Framed> {
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial {} timed out", self.addr),
                ))
            })??;
        stream.set_nodelay(true)?;

        let stream: BoxedStream = match &self.tls {
            Some(client_tls) => {
                let name = tls::server_name(client_tls.server_name.as_deref().unwrap_or(&self.addr))?;
                Box::new(client_tls.connector.connect(name, stream).await?)
            }
            None => Box::new(stream),
        };

        let (reader, writer) = tokio::io::split(stream);
        Ok(Framed {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        })
    }

    /// Sends one request and waits for its response. A failed exchange drops
    /// the connection; the next call redials.
    pub async fn call(&self, request: &ClientRequest) -> RouterResult<ClientResponse> {
        let mut guard = self.framed.lock().await;
        if guard.is_none() {
            *guard = Some(self.dial().await.map_err(RouterError::Dial)?);
        }
        let Some(framed) = guard.as_mut() else {
            return Err(TransportError::Closed.into());
        };

        let result = async {
            framed.writer.write_bincode(request).await?;
            framed
                .reader
                .read_bincode::<ClientResponse>()
                .await?
                .ok_or(TransportError::Closed)
        }
        .await;

        if let Err(e) = &result {
            debug!("Dropping connection to {}: {}", self.addr, e);
            *guard = None;
        }
        Ok(result?)
    }

    /// Opens a dedicated connection streaming records from `offset` on.
    pub async fn consume_stream(&self, offset: u64) -> RouterResult<RecordStream> {
        let mut framed = self.dial().await.map_err(RouterError::Dial)?;
        framed
            .writer
            .write_bincode(&ClientRequest::ConsumeStream { offset })
            .await?;
        Ok(RecordStream { framed })
    }
}

/// Records pushed by the server after a `ConsumeStream` request.
pub struct RecordStream {
    framed: Framed,
}

impl RecordStream {
    /// Next record, or `None` once the server closes the stream.
    pub async fn next(&mut self) -> RouterResult<Option<Record>> {
        match self.framed.reader.read_bincode::<ClientResponse>().await? {
            Some(ClientResponse::Consumed { record }) => Ok(Some(record)),
            Some(ClientResponse::Error(e)) => Err(e.into()),
            Some(other) => Err(TransportError::Codec(format!(
                "unexpected stream response {:?}",
                other
            ))
            .into()),
            None => Ok(None),
        }
    }
}
