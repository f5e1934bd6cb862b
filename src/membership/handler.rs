use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{Span, debug, error, warn};

use crate::NodeId;
use crate::error::{MembershipError, MembershipResult};
use crate::log::Log;
use crate::raft::DistributedLog;
use crate::traits::LogStorage;

use super::RPC_ADDR_TAG;
use super::gossip::{Member, MembershipEvent};

/// Reacts to remote members joining or leaving.
#[async_trait]
pub trait MembershipHandler: Send + Sync {
    async fn join(&self, name: &str, rpc_addr: &str) -> MembershipResult<()>;

    async fn leave(&self, name: &str) -> MembershipResult<()>;
}

/// Feeds events to `handler` one at a time, in arrival order.
pub(crate) async fn dispatch(
    mut events: mpsc::UnboundedReceiver<MembershipEvent>,
    handler: Arc<dyn MembershipHandler>,
    span: Span,
) {
    while let Some(event) = events.recv().await {
        match &event {
            MembershipEvent::Join(member) => {
                let Some(rpc_addr) = member.tags.get(RPC_ADDR_TAG) else {
                    warn!(parent: &span, "Member {} joined without an {} tag", member.name, RPC_ADDR_TAG);
                    continue;
                };
                if let Err(e) = handler.join(&member.name, rpc_addr).await {
                    log_error(&span, &e, "Failed to join", member);
                }
            }
            MembershipEvent::Leave(member) | MembershipEvent::Failed(member) => {
                if let Err(e) = handler.leave(&member.name).await {
                    log_error(&span, &e, "Failed to leave", member);
                }
            }
        }
    }
    debug!(parent: &span, "Membership event channel closed");
}

fn log_error(span: &Span, err: &MembershipError, msg: &str, member: &Member) {
    let rpc_addr = member.tags.get(RPC_ADDR_TAG).map(String::as_str).unwrap_or("");
    match err {
        MembershipError::NotLeader => {
            debug!(parent: span, "{} {} ({}): {}", msg, member.name, rpc_addr, err)
        }
        _ => error!(parent: span, "{} {} ({}): {}", msg, member.name, rpc_addr, err),
    }
}

/// Reconciles the consensus voter set with gossip membership.
pub struct RaftMembershipHandler<S: LogStorage = Log> {
    log: Arc<DistributedLog<S>>,
    timeout: Duration,
}

impl<S: LogStorage> RaftMembershipHandler<S> {
    pub fn new(log: Arc<DistributedLog<S>>, timeout: Duration) -> Self {
        Self { log, timeout }
    }
}

fn parse_node_id(name: &str) -> MembershipResult<NodeId> {
    name.parse()
        .map_err(|_| MembershipError::Reconcile(format!("member name {:?} is not a node id", name)))
}

#[async_trait]
impl<S: LogStorage> MembershipHandler for RaftMembershipHandler<S> {
    async fn join(&self, name: &str, rpc_addr: &str) -> MembershipResult<()> {
        let id = parse_node_id(name)?;
        tokio::time::timeout(self.timeout, self.log.join(id, rpc_addr))
            .await
            .map_err(|_| MembershipError::Timeout)?
    }

    async fn leave(&self, name: &str) -> MembershipResult<()> {
        let id = parse_node_id(name)?;
        tokio::time::timeout(self.timeout, self.log.leave(id))
            .await
            .map_err(|_| MembershipError::Timeout)?
    }
}
