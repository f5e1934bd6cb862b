use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{Span, debug, warn};

use crate::api::{ClientRequest, ClientResponse, ServerInfo};
use crate::error::{RouterError, RouterResult, TransportError};
use crate::log::Record;

use super::ClientOptions;
use super::conn::{Conn, RecordStream};
use super::picker::{self, Picker, SubConn};
use super::resolver::{Address, Resolver};

/// Leader-aware client for a proglog cluster.
pub struct LogClient {
    resolver: Resolver,
    conns: Mutex<HashMap<String, Arc<Conn>>>,
    picker: RwLock<Arc<Picker<Arc<Conn>>>>,
    options: ClientOptions,
    span: Span,
}

impl LogClient {
    /// Resolves the cluster through `endpoint`, any reachable member.
    pub async fn connect(endpoint: &str, options: ClientOptions, span: Span) -> Self {
        let resolver = Resolver::build(endpoint, &options, span.clone()).await;
        let client = Self {
            picker: RwLock::new(Arc::new(Picker::build(Vec::new(), &span))),
            resolver,
            conns: Mutex::new(HashMap::new()),
            options,
            span,
        };
        client.update(client.resolver.addresses());
        client
    }

    /// Rebuilds the picker, reusing connections to addresses still present.
    fn update(&self, addresses: Vec<Address>) {
        let mut conns = self.conns.lock();
        conns.retain(|addr, _| addresses.iter().any(|a| &a.addr == addr));

        let subconns: Vec<SubConn<Arc<Conn>>> = addresses
            .into_iter()
            .map(|address| {
                let conn = conns
                    .entry(address.addr.clone())
                    .or_insert_with(|| {
                        Arc::new(Conn::new(
                            address.addr.clone(),
                            self.options.dial_timeout,
                            self.options.tls.clone(),
                        ))
                    })
                    .clone();
                SubConn {
                    addr: address.addr,
                    is_leader: address.is_leader,
                    conn,
                }
            })
            .collect();

        *self.picker.write() = Arc::new(Picker::build(subconns, &self.span));
    }

    pub async fn refresh(&self) -> RouterResult<()> {
        let addresses = self.resolver.resolve_now().await?;
        self.update(addresses);
        Ok(())
    }

    fn pick(&self, method: &str) -> RouterResult<Arc<Conn>> {
        let picker = self.picker.read().clone();
        picker.pick(method)
    }

    async fn try_call(&self, request: &ClientRequest) -> RouterResult<ClientResponse> {
        let conn = self.pick(request.method_name())?;
        match conn.call(request).await? {
            ClientResponse::Error(e) => Err(e.into()),
            response => Ok(response),
        }
    }

    /// Sends `request` to the connection the picker chooses. Retryable
    /// failures re-resolve the cluster and try again; a write that may have
    /// reached the leader is never sent twice.
    pub async fn call(&self, request: ClientRequest) -> RouterResult<ClientResponse> {
        let write = picker::is_write(request.method_name());
        let mut attempt = 0;
        loop {
            match self.try_call(&request).await {
                Err(e) if e.is_retryable(write) && attempt < self.options.max_retries => {
                    attempt += 1;
                    debug!(
                        parent: &self.span,
                        "{} failed ({}), retrying ({}/{})",
                        request.method_name(),
                        e,
                        attempt,
                        self.options.max_retries
                    );
                    tokio::time::sleep(self.options.retry_backoff).await;
                    if let Err(e) = self.refresh().await {
                        warn!(parent: &self.span, "Failed to re-resolve servers: {}", e);
                    }
                }
                result => return result,
            }
        }
    }

    pub async fn produce(&self, record: Record) -> RouterResult<u64> {
        match self.call(ClientRequest::Produce { record }).await? {
            ClientResponse::Produced { offset } => Ok(offset),
            other => Err(unexpected("Produce", other)),
        }
    }

    pub async fn consume(&self, offset: u64) -> RouterResult<Record> {
        match self.call(ClientRequest::Consume { offset }).await? {
            ClientResponse::Consumed { record } => Ok(record),
            other => Err(unexpected("Consume", other)),
        }
    }

    pub async fn get_servers(&self) -> RouterResult<Vec<ServerInfo>> {
        match self.call(ClientRequest::GetServers).await? {
            ClientResponse::Servers { servers } => Ok(servers),
            other => Err(unexpected("GetServers", other)),
        }
    }

    /// Streams records from `offset` on from a read replica.
    pub async fn consume_stream(&self, offset: u64) -> RouterResult<RecordStream> {
        let method = ClientRequest::ConsumeStream { offset }.method_name();
        self.pick(method)?.consume_stream(offset).await
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }
}

fn unexpected(method: &str, response: ClientResponse) -> RouterError {
    TransportError::Codec(format!("unexpected response to {}: {:?}", method, response)).into()
}
