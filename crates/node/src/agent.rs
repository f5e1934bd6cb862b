//! One proglog node: mux, consensus, request server and gossip wired
//! together.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use proglog::membership::{Membership, RaftMembershipHandler};
use proglog::mux::{Mux, match_any, match_byte};
use proglog::raft::DistributedLog;
use proglog::raft::stream_layer::{RAFT_RPC, StreamLayer};
use proglog::server::{AclAuthorizer, LogServer};
use proglog::tls;
use tokio::task::JoinHandle;
use tracing::{Span, info, info_span, warn};

use crate::config::Config;

pub struct Agent {
    config: Config,
    rpc_addr: String,
    log: Arc<DistributedLog>,
    membership: Membership,
    mux: JoinHandle<()>,
    server: JoinHandle<()>,
    shut_down: AtomicBool,
    span: Span,
}

impl Agent {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let span = info_span!("node", id = config.node_id);
        let rpc_addr = config.rpc_addr()?;
        let raft_options = config.raft_options()?;
        let membership_config = config.membership_config()?;
        let authorizer = match &config.acl_policy_file {
            Some(path) => Some(
                AclAuthorizer::from_policy_file(path)
                    .with_context(|| format!("failed to read ACL policy {}", path.display()))?,
            ),
            None => None,
        };

        let mut mux = Mux::bind(&rpc_addr, span.clone())
            .await
            .with_context(|| format!("failed to listen on {}", rpc_addr))?;
        let raft_listener = mux.listen(match_byte(RAFT_RPC));
        let client_listener = mux.listen(match_any());

        let server_tls = config
            .server_tls()
            .map(|args| tls::acceptor(&args))
            .transpose()?;
        let peer_tls = config
            .peer_tls()?
            .map(|args| tls::connector(&args))
            .transpose()?;
        let stream_layer = Arc::new(StreamLayer::new(
            raft_listener,
            server_tls.clone(),
            peer_tls,
        ));
        let mux = mux.serve();

        let opened =
            DistributedLog::open(&config.data_dir, raft_options, stream_layer, span.clone()).await;
        let log = match opened {
            Ok(log) => Arc::new(log),
            Err(e) => {
                mux.abort();
                return Err(e.into());
            }
        };

        let mut server = LogServer::new(log.clone(), log.clone(), span.clone());
        if let Some(authorizer) = authorizer {
            server = server.with_authorizer(Arc::new(authorizer));
        }
        if let Some(acceptor) = server_tls {
            server = server.with_tls(acceptor);
        }
        let server = tokio::spawn(Arc::new(server).serve(client_listener));

        let handler = Arc::new(RaftMembershipHandler::new(
            log.clone(),
            config.reconcile_timeout(),
        ));
        let membership = match Membership::start(membership_config, handler, span.clone()).await {
            Ok(membership) => membership,
            Err(e) => {
                server.abort();
                mux.abort();
                if let Err(shutdown_err) = log.shutdown().await {
                    warn!(parent: &span, "Failed to shut down log: {}", shutdown_err);
                }
                return Err(e.into());
            }
        };

        info!(
            parent: &span,
            "Node {} serving RPCs on {}, gossip on {}",
            config.node_id,
            rpc_addr,
            config.bind_addr
        );

        Ok(Self {
            config,
            rpc_addr,
            log,
            membership,
            mux,
            server,
            shut_down: AtomicBool::new(false),
            span,
        })
    }

    pub fn log(&self) -> &Arc<DistributedLog> {
        &self.log
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn rpc_addr(&self) -> &str {
        &self.rpc_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Leaves gossip, stops serving and shuts the log down. Later calls do
    /// nothing.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(parent: &self.span, "Shutting down node {}", self.config.node_id);

        if let Err(e) = self.membership.leave().await {
            warn!(parent: &self.span, "Failed to leave cluster: {}", e);
        }
        self.server.abort();
        self.mux.abort();
        self.log.shutdown().await?;
        Ok(())
    }
}
