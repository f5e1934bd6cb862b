//! Replicated log on top of openraft.
//!
//! Two [`Log`] instances back one node: the user-data log, mutated only by
//! applying committed proposals ([`fsm`]), and the consensus engine's own
//! replication log ([`log_store`]). [`DistributedLog`] ties them to an
//! openraft instance and the multiplexed stream layer.

pub mod fsm;
pub mod log_store;
pub mod network;
pub mod storage;
pub mod stream_layer;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::storage::Adaptor;
use openraft::{BasicNode, ChangeMembers, Config, Raft, SnapshotPolicy};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, Span, debug, info, warn};

use crate::NodeId;
use crate::api::ServerInfo;
use crate::error::{ClientError, ClientResult, MembershipError, MembershipResult};
use crate::log::{Log, LogConfig, Record};
use crate::server::{CommitLogService, ServerDirectory};
use crate::traits::LogStorage;

use self::network::{NetworkFactory, RaftRpcServer};
use self::storage::RaftStore;
use self::stream_layer::StreamLayer;

openraft::declare_raft_types!(
    /// Type configuration for the replicated commit log.
    pub TypeConfig:
        D = Proposal,
        R = ApplyResponse,
        NodeId = NodeId,
        Node = BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = tokio::fs::File,
        AsyncRuntime = openraft::TokioRuntime,
);

pub type LogRaft = Raft<TypeConfig>;

/// Operation tag leading every proposal payload.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Append = 0,
}

impl TryFrom<u8> for RequestType {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(RequestType::Append),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceRequest {
    pub record: Record,
}

/// A replicated command: one tag byte followed by a bincode request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub data: Vec<u8>,
}

impl Proposal {
    pub fn append(record: Record) -> ClientResult<Self> {
        let body = bincode::serialize(&ProduceRequest { record })?;
        let mut data = Vec::with_capacity(body.len() + 1);
        data.push(RequestType::Append as u8);
        data.extend_from_slice(&body);
        Ok(Self { data })
    }

    /// Splits the payload into its tag and body.
    pub fn split(&self) -> Option<(u8, &[u8])> {
        self.data.split_first().map(|(tag, body)| (*tag, body))
    }
}

/// Result of applying one committed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyResponse {
    Appended { offset: u64 },
    Failed { reason: String },
    /// Blank and membership entries carry no user payload.
    Skipped,
}

/// Options for one consensus node.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub node_id: NodeId,
    /// Multiplexed RPC address other nodes dial to reach this one.
    pub rpc_addr: String,
    pub bootstrap: bool,
    pub log: LogConfig,
    pub heartbeat_interval: Duration,
    pub election_timeout: Duration,
    pub snapshot_threshold: u64,
    pub apply_timeout: Duration,
    pub bootstrap_timeout: Duration,
    pub dial_timeout: Duration,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            node_id: 0,
            rpc_addr: "127.0.0.1:8400".to_string(),
            bootstrap: false,
            log: LogConfig::default(),
            heartbeat_interval: Duration::from_millis(50),
            election_timeout: Duration::from_millis(300),
            snapshot_threshold: 1024,
            apply_timeout: Duration::from_secs(10),
            bootstrap_timeout: Duration::from_secs(3),
            dial_timeout: Duration::from_secs(1),
        }
    }
}

impl RaftOptions {
    fn engine_config(&self) -> ClientResult<Config> {
        let heartbeat = self.heartbeat_interval.as_millis() as u64;
        let election = (self.election_timeout.as_millis() as u64).max(heartbeat * 2 + 1);
        Config {
            cluster_name: "proglog".to_string(),
            heartbeat_interval: heartbeat,
            election_timeout_min: election,
            election_timeout_max: election * 2,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            max_in_snapshot_log_to_keep: 0,
            ..Default::default()
        }
        .validate()
        .map_err(|e| ClientError::Consensus(e.to_string()))
    }
}

/// A commit log replicated through openraft.
pub struct DistributedLog<S: LogStorage = Log> {
    options: RaftOptions,
    log: Arc<S>,
    raft_log: Arc<S>,
    raft: LogRaft,
    rpc_server: tokio::task::JoinHandle<()>,
    span: Span,
}

impl DistributedLog<Log> {
    /// Opens `<data_dir>/log` and `<data_dir>/raft/log` and starts the engine.
    pub async fn open(
        data_dir: impl AsRef<Path>,
        options: RaftOptions,
        stream_layer: Arc<StreamLayer>,
        span: Span,
    ) -> ClientResult<Self> {
        let data_dir = data_dir.as_ref();
        let log = Log::open(data_dir.join("log"), options.log.clone())?;

        // The consensus log starts at index 0 like openraft's own numbering.
        let raft_log_config = LogConfig {
            initial_offset: 0,
            ..options.log.clone()
        };
        let raft_log = Log::open(data_dir.join("raft").join("log"), raft_log_config)?;

        Self::with_logs(
            data_dir.to_path_buf(),
            Arc::new(log),
            Arc::new(raft_log),
            options,
            stream_layer,
            span,
        )
        .await
    }
}

impl<S: LogStorage> DistributedLog<S> {
    pub async fn with_logs(
        data_dir: PathBuf,
        log: Arc<S>,
        raft_log: Arc<S>,
        options: RaftOptions,
        stream_layer: Arc<StreamLayer>,
        span: Span,
    ) -> ClientResult<Self> {
        let config = Arc::new(options.engine_config()?);

        let store = RaftStore::open(
            log.clone(),
            raft_log.clone(),
            &data_dir.join("raft"),
            &data_dir,
            span.clone(),
        )?;
        let (log_store, state_machine) = Adaptor::new(store);
        let network = NetworkFactory::new(stream_layer.clone(), options.dial_timeout, span.clone());

        let raft = Raft::new(options.node_id, config, network, log_store, state_machine)
            .await
            .map_err(|e| ClientError::Consensus(e.to_string()))?;

        let rpc_server = RaftRpcServer::new(raft.clone(), stream_layer, span.clone());
        let rpc_server = tokio::spawn(rpc_server.serve().instrument(span.clone()));

        let distributed = Self {
            options,
            log,
            raft_log,
            raft,
            rpc_server,
            span,
        };

        if distributed.options.bootstrap {
            distributed.bootstrap().await?;
        }
        Ok(distributed)
    }

    /// Initializes a single-voter cluster made of this node and waits for it
    /// to elect itself.
    async fn bootstrap(&self) -> ClientResult<()> {
        let mut members = BTreeMap::new();
        members.insert(
            self.options.node_id,
            BasicNode::new(self.options.rpc_addr.clone()),
        );

        match self.raft.initialize(members).await {
            Ok(()) => {
                info!(parent: &self.span, "Bootstrapped cluster with node {}", self.options.node_id)
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                debug!(parent: &self.span, "Cluster already initialized, skipping bootstrap")
            }
            Err(e) => return Err(ClientError::Consensus(e.to_string())),
        }

        self.wait_for_leader(self.options.bootstrap_timeout).await
    }

    /// Waits until the engine reports a leader.
    pub async fn wait_for_leader(&self, timeout: Duration) -> ClientResult<()> {
        let mut metrics = self.raft.metrics();
        let wait = async {
            loop {
                if metrics.borrow().current_leader.is_some() {
                    return Ok(());
                }
                if metrics.changed().await.is_err() {
                    return Err(ClientError::Consensus("raft stopped".to_string()));
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Consensus(format!("no leader elected within {:?}", timeout)))?
    }

    /// Proposes `record` and returns the offset it was given once committed
    /// and applied.
    pub async fn append(&self, record: Record) -> ClientResult<u64> {
        let proposal = Proposal::append(record)?;
        let timeout = self.options.apply_timeout;

        let result = tokio::time::timeout(timeout, self.raft.client_write(proposal))
            .await
            .map_err(|_| ClientError::ProposalTimeout(timeout))?;

        let response = match result {
            Ok(response) => response,
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward))) => {
                return Err(ClientError::NotLeader {
                    leader: forward.leader_id,
                });
            }
            Err(e) => return Err(ClientError::Consensus(e.to_string())),
        };

        match response.data {
            ApplyResponse::Appended { offset } => Ok(offset),
            ApplyResponse::Failed { reason } => Err(ClientError::Apply(reason)),
            ApplyResponse::Skipped => Err(ClientError::Apply(
                "proposal applied without producing a record".to_string(),
            )),
        }
    }

    /// Reads from the local copy of the log.
    pub fn read(&self, offset: u64) -> ClientResult<Record> {
        Ok(self.log.read(offset)?)
    }

    /// Every node in the current configuration with its leader flag.
    pub fn get_servers(&self) -> Vec<ServerInfo> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader;

        metrics
            .membership_config
            .membership()
            .nodes()
            .map(|(id, node)| ServerInfo {
                id: *id,
                rpc_addr: node.addr.clone(),
                is_leader: leader == Some(*id),
            })
            .collect()
    }

    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.options.node_id)
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// Adds `id` at `addr` as a voter, replacing any stale entry that shares
    /// its id or its address.
    pub async fn join(&self, id: NodeId, addr: &str) -> MembershipResult<()> {
        let metrics = self.raft.metrics().borrow().clone();
        let membership = metrics.membership_config.membership().clone();

        let mut stale = BTreeSet::new();
        for (node_id, node) in membership.nodes() {
            let same_id = *node_id == id;
            let same_addr = node.addr == addr;
            if same_id && same_addr {
                if membership.voter_ids().any(|v| v == id) {
                    debug!(parent: &self.span, "Node {} at {} is already a voter", id, addr);
                    return Ok(());
                }
            } else if same_id || same_addr {
                stale.insert(*node_id);
            }
        }

        if !stale.is_empty() {
            info!(parent: &self.span, "Removing stale servers {:?} before adding {} at {}", stale, id, addr);
            self.raft
                .change_membership(ChangeMembers::RemoveVoters(stale.clone()), false)
                .await
                .map_err(membership_error)?;
            self.raft
                .change_membership(ChangeMembers::RemoveNodes(stale), false)
                .await
                .map_err(membership_error)?;
        }

        self.raft
            .add_learner(id, BasicNode::new(addr), true)
            .await
            .map_err(membership_error)?;
        self.raft
            .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([id])), false)
            .await
            .map_err(membership_error)?;

        info!(parent: &self.span, "Added voter {} at {}", id, addr);
        Ok(())
    }

    /// Removes `id` from the voter set.
    pub async fn leave(&self, id: NodeId) -> MembershipResult<()> {
        let is_member = self
            .raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .nodes()
            .any(|(node_id, _)| *node_id == id);
        if !is_member {
            return Ok(());
        }

        self.raft
            .change_membership(ChangeMembers::RemoveVoters(BTreeSet::from([id])), false)
            .await
            .map_err(membership_error)?;

        info!(parent: &self.span, "Removed voter {}", id);
        Ok(())
    }

    pub fn raft(&self) -> &LogRaft {
        &self.raft
    }

    pub fn node_id(&self) -> NodeId {
        self.options.node_id
    }

    /// Stops the engine and closes both logs.
    pub async fn shutdown(&self) -> ClientResult<()> {
        self.rpc_server.abort();
        if let Err(e) = self.raft.shutdown().await {
            warn!(parent: &self.span, "Failed to shut down raft: {}", e);
        }

        self.log.close()?;
        self.raft_log.close()?;
        info!(parent: &self.span, "Distributed log shut down");
        Ok(())
    }
}

fn membership_error(err: RaftError<NodeId, ClientWriteError<NodeId, BasicNode>>) -> MembershipError {
    match err {
        RaftError::APIError(ClientWriteError::ForwardToLeader(_)) => MembershipError::NotLeader,
        other => MembershipError::Reconcile(other.to_string()),
    }
}

#[async_trait]
impl<S: LogStorage> CommitLogService for DistributedLog<S> {
    async fn append(&self, record: Record) -> ClientResult<u64> {
        DistributedLog::append(self, record).await
    }

    async fn read(&self, offset: u64) -> ClientResult<Record> {
        DistributedLog::read(self, offset)
    }
}

#[async_trait]
impl<S: LogStorage> ServerDirectory for DistributedLog<S> {
    async fn get_servers(&self) -> ClientResult<Vec<ServerInfo>> {
        Ok(DistributedLog::get_servers(self))
    }
}
