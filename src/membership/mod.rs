//! Cluster membership.
//!
//! [`Membership`] runs UDP gossip and feeds every remote join, leave or
//! failure through one worker task into a [`MembershipHandler`], which by
//! default reconciles the consensus voter set.

mod gossip;
mod handler;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, info};

use crate::error::MembershipResult;

use self::gossip::Gossip;
pub use self::gossip::{Member, MemberStatus, MembershipEvent};
pub use self::handler::{MembershipHandler, RaftMembershipHandler};

/// Tag under which members advertise their multiplexed RPC address.
pub const RPC_ADDR_TAG: &str = "rpc_addr";

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Unique member name; the node id in decimal.
    pub node_name: String,
    /// UDP address gossip binds to.
    pub bind_addr: String,
    pub tags: BTreeMap<String, String>,
    /// Seeds contacted on start. Empty means start a new cluster.
    pub start_join_addrs: Vec<String>,
    pub gossip_interval: Duration,
    pub fanout: usize,
    pub suspect_timeout: Duration,
    pub reap_timeout: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            node_name: "0".to_string(),
            bind_addr: "127.0.0.1:8401".to_string(),
            tags: BTreeMap::new(),
            start_join_addrs: Vec::new(),
            gossip_interval: Duration::from_millis(200),
            fanout: 3,
            suspect_timeout: Duration::from_secs(5),
            reap_timeout: Duration::from_secs(30),
        }
    }
}

impl MembershipConfig {
    pub fn with_rpc_addr(mut self, rpc_addr: impl Into<String>) -> Self {
        self.tags.insert(RPC_ADDR_TAG.to_string(), rpc_addr.into());
        self
    }
}

pub struct Membership {
    gossip: Arc<Gossip>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    span: Span,
}

impl Membership {
    /// Binds gossip, starts the event worker and contacts the seeds.
    pub async fn start(
        config: MembershipConfig,
        handler: Arc<dyn MembershipHandler>,
        span: Span,
    ) -> MembershipResult<Self> {
        let interval = config.gossip_interval;
        let (tx, rx) = mpsc::unbounded_channel();
        let gossip = Gossip::bind(config, tx, span.clone()).await?;

        let mut tasks = Vec::with_capacity(3);
        tasks.push(tokio::spawn(
            handler::dispatch(rx, handler, span.clone()).instrument(span.clone()),
        ));
        tasks.push(tokio::spawn(
            gossip.clone().receive_loop().instrument(span.clone()),
        ));

        if let Err(e) = gossip.contact_seeds().await {
            tasks.iter().for_each(JoinHandle::abort);
            return Err(e);
        }

        let ticker = gossip.clone();
        tasks.push(tokio::spawn(
            async move {
                let mut timer = tokio::time::interval(interval);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    timer.tick().await;
                    ticker.tick().await;
                }
            }
            .instrument(span.clone()),
        ));

        Ok(Self {
            gossip,
            tasks: Mutex::new(tasks),
            span,
        })
    }

    /// Every known member with its status, including the local one and
    /// departed members that have not been reaped yet.
    pub fn members(&self) -> Vec<Member> {
        self.gossip.members()
    }

    pub fn local_name(&self) -> &str {
        self.gossip.local_name()
    }

    pub fn local_addr(&self) -> MembershipResult<std::net::SocketAddr> {
        self.gossip.local_addr()
    }

    /// Announces departure and stops gossip. Consensus membership is left
    /// untouched; the remaining leader removes this node when it hears.
    pub async fn leave(&self) -> MembershipResult<()> {
        let result = self.gossip.leave().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(parent: &self.span, "Gossip stopped");
        result
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests;
