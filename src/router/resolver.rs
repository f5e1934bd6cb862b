//! Discovers the cluster by asking one known endpoint for its servers.

use tokio::sync::watch;
use tracing::{Span, debug, error};

use crate::api::{ClientRequest, ClientResponse, ServerInfo};
use crate::error::{RouterError, RouterResult};

use super::ClientOptions;
use super::conn::Conn;

/// A server address with leader attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub addr: String,
    pub is_leader: Option<bool>,
}

impl From<ServerInfo> for Address {
    fn from(server: ServerInfo) -> Self {
        Self {
            addr: server.rpc_addr,
            is_leader: Some(server.is_leader),
        }
    }
}

pub struct Resolver {
    conn: Conn,
    state: watch::Sender<Vec<Address>>,
    span: Span,
}

impl Resolver {
    /// Connects to `endpoint` and resolves once. A failed first resolution
    /// is logged and leaves the address pool empty.
    pub async fn build(endpoint: &str, options: &ClientOptions, span: Span) -> Self {
        let (state, _) = watch::channel(Vec::new());
        let resolver = Self {
            conn: Conn::new(endpoint, options.dial_timeout, options.tls.clone()),
            state,
            span,
        };
        if let Err(e) = resolver.resolve_now().await {
            error!(parent: &resolver.span, "Failed to resolve servers: {}", e);
        }
        resolver
    }

    /// Queries the endpoint and publishes the result.
    pub async fn resolve_now(&self) -> RouterResult<Vec<Address>> {
        let servers = match self.conn.call(&ClientRequest::GetServers).await? {
            ClientResponse::Servers { servers } => servers,
            ClientResponse::Error(e) => return Err(e.into()),
            other => {
                return Err(RouterError::Resolve(format!(
                    "unexpected response to GetServers: {:?}",
                    other
                )));
            }
        };

        let addresses: Vec<Address> = servers.into_iter().map(Address::from).collect();
        debug!(parent: &self.span, "Resolved {} servers from {}", addresses.len(), self.conn.addr());
        self.state.send_replace(addresses.clone());
        Ok(addresses)
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Address>> {
        self.state.subscribe()
    }

    pub fn endpoint(&self) -> &str {
        self.conn.addr()
    }
}
