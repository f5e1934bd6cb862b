//! Push gossip over UDP.
//!
//! Every member owns a heartbeat counter that only it increments. Peers
//! exchange their whole member table and keep, per member, the entry with
//! the highest heartbeat. A member whose heartbeat stops advancing for
//! `suspect_timeout` is marked failed locally; failure is never gossiped,
//! only a member's own `Left` status is.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{Span, debug, info, trace, warn};

use crate::error::{MembershipError, MembershipResult};

use super::MembershipConfig;

/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Alive,
    Left,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    /// Gossip address.
    pub addr: SocketAddr,
    pub tags: BTreeMap<String, String>,
    pub heartbeat: u64,
    pub status: MemberStatus,
}

/// A change in cluster membership, as seen by the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Join(Member),
    Leave(Member),
    Failed(Member),
}

impl MembershipEvent {
    pub fn member(&self) -> &Member {
        match self {
            MembershipEvent::Join(m) | MembershipEvent::Leave(m) | MembershipEvent::Failed(m) => m,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Push {
    members: Vec<Member>,
    /// Ask the receiver to push its table back.
    reply: bool,
}

struct Entry {
    member: Member,
    /// Last time the heartbeat advanced, or the status changed.
    updated: Instant,
}

pub(crate) struct Gossip {
    socket: UdpSocket,
    local_name: String,
    config: MembershipConfig,
    table: Mutex<BTreeMap<String, Entry>>,
    events: mpsc::UnboundedSender<MembershipEvent>,
    span: Span,
}

impl Gossip {
    pub(crate) async fn bind(
        config: MembershipConfig,
        events: mpsc::UnboundedSender<MembershipEvent>,
        span: Span,
    ) -> MembershipResult<Arc<Self>> {
        let socket = UdpSocket::bind(&config.bind_addr).await?;
        let addr = socket.local_addr()?;
        info!(parent: &span, "Gossip for {} bound to {}", config.node_name, addr);

        let local = Member {
            name: config.node_name.clone(),
            addr,
            tags: config.tags.clone(),
            heartbeat: 1,
            status: MemberStatus::Alive,
        };
        let mut table = BTreeMap::new();
        table.insert(
            local.name.clone(),
            Entry {
                member: local,
                updated: Instant::now(),
            },
        );

        Ok(Arc::new(Self {
            socket,
            local_name: config.node_name.clone(),
            config,
            table: Mutex::new(table),
            events,
            span,
        }))
    }

    pub(crate) fn local_addr(&self) -> MembershipResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub(crate) fn local_name(&self) -> &str {
        &self.local_name
    }

    pub(crate) fn members(&self) -> Vec<Member> {
        self.table.lock().values().map(|e| e.member.clone()).collect()
    }

    fn live_peers(&self) -> Vec<SocketAddr> {
        self.table
            .lock()
            .values()
            .filter(|e| e.member.name != self.local_name && e.member.status == MemberStatus::Alive)
            .map(|e| e.member.addr)
            .collect()
    }

    /// Pushes the table to every seed, asking for theirs back. Fails only if
    /// no seed address could even be resolved and sent to.
    pub(crate) async fn contact_seeds(&self) -> MembershipResult<()> {
        if self.config.start_join_addrs.is_empty() {
            return Ok(());
        }
        let mut sent = 0;
        for seed in &self.config.start_join_addrs {
            match self.send_to(seed.as_str(), true).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(parent: &self.span, "Failed to contact seed {}: {}", seed, e),
            }
        }
        if sent == 0 {
            return Err(MembershipError::NoSeedReachable);
        }
        Ok(())
    }

    async fn send_to(
        &self,
        target: impl tokio::net::ToSocketAddrs,
        reply: bool,
    ) -> MembershipResult<()> {
        let push = Push {
            members: self.members(),
            reply,
        };
        let data = bincode::serialize(&push)?;
        self.socket.send_to(&data, target).await?;
        Ok(())
    }

    /// One gossip round: bump our heartbeat, expire silent members, and push
    /// to a few random live peers (or the seeds when we know nobody).
    pub(crate) async fn tick(&self) {
        let now = Instant::now();
        {
            let mut table = self.table.lock();
            if let Some(local) = table.get_mut(&self.local_name) {
                local.member.heartbeat += 1;
                local.updated = now;
            }
            self.expire(&mut table, now);
        }

        let peers = self.live_peers();
        if peers.is_empty() {
            if let Err(e) = self.contact_seeds().await {
                trace!(parent: &self.span, "No seed reachable: {}", e);
            }
            return;
        }

        let targets = peers
            .into_iter()
            .choose_multiple(&mut rand::rng(), self.config.fanout.max(1));
        let sends = targets.iter().map(|target| self.send_to(*target, false));
        for (target, result) in targets.iter().zip(join_all(sends).await) {
            if let Err(e) = result {
                debug!(parent: &self.span, "Failed to gossip to {}: {}", target, e);
            }
        }
    }

    fn expire(&self, table: &mut BTreeMap<String, Entry>, now: Instant) {
        let mut reaped = Vec::new();
        for (name, entry) in table.iter_mut() {
            if *name == self.local_name {
                continue;
            }
            let idle = now.duration_since(entry.updated);
            match entry.member.status {
                MemberStatus::Alive if idle >= self.config.suspect_timeout => {
                    info!(parent: &self.span, "Member {} failed after {:?} of silence", name, idle);
                    entry.member.status = MemberStatus::Failed;
                    entry.updated = now;
                    self.emit(MembershipEvent::Failed(entry.member.clone()));
                }
                MemberStatus::Left | MemberStatus::Failed if idle >= self.config.reap_timeout => {
                    reaped.push(name.clone());
                }
                _ => {}
            }
        }
        for name in reaped {
            debug!(parent: &self.span, "Reaping member {}", name);
            table.remove(&name);
        }
    }

    /// Merges a received table into ours and reports the resulting changes.
    pub(crate) fn merge(&self, members: Vec<Member>) {
        let now = Instant::now();
        let mut table = self.table.lock();

        for remote in members {
            if remote.name == self.local_name || remote.status == MemberStatus::Failed {
                continue;
            }

            match table.get_mut(&remote.name) {
                None => {
                    if remote.status == MemberStatus::Alive {
                        info!(parent: &self.span, "Member {} joined at {}", remote.name, remote.addr);
                        self.emit(MembershipEvent::Join(remote.clone()));
                    }
                    table.insert(
                        remote.name.clone(),
                        Entry {
                            member: remote,
                            updated: now,
                        },
                    );
                }
                Some(entry) if remote.heartbeat > entry.member.heartbeat => {
                    let before = entry.member.status;
                    entry.member = remote;
                    entry.updated = now;

                    match (before, entry.member.status) {
                        (MemberStatus::Alive, MemberStatus::Left) => {
                            info!(parent: &self.span, "Member {} left", entry.member.name);
                            self.emit(MembershipEvent::Leave(entry.member.clone()));
                        }
                        (MemberStatus::Left | MemberStatus::Failed, MemberStatus::Alive) => {
                            info!(parent: &self.span, "Member {} rejoined", entry.member.name);
                            self.emit(MembershipEvent::Join(entry.member.clone()));
                        }
                        _ => {}
                    }
                }
                Some(_) => {}
            }
        }
    }

    fn emit(&self, event: MembershipEvent) {
        if event.member().name == self.local_name {
            return;
        }
        if self.events.send(event).is_err() {
            debug!(parent: &self.span, "Membership event dropped, handler stopped");
        }
    }

    /// Receives datagrams until the socket fails.
    pub(crate) async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!(parent: &self.span, "Gossip receive failed: {}", e);
                    continue;
                }
            };

            let push: Push = match bincode::deserialize(&buf[..len]) {
                Ok(push) => push,
                Err(e) => {
                    warn!(parent: &self.span, "Malformed gossip from {}: {}", from, e);
                    continue;
                }
            };

            let reply = push.reply;
            self.merge(push.members);
            if reply {
                if let Err(e) = self.send_to(from, false).await {
                    debug!(parent: &self.span, "Failed to answer {}: {}", from, e);
                }
            }
        }
    }

    /// Marks the local member left and tells every live peer.
    pub(crate) async fn leave(&self) -> MembershipResult<()> {
        {
            let mut table = self.table.lock();
            if let Some(local) = table.get_mut(&self.local_name) {
                local.member.heartbeat += 1;
                local.member.status = MemberStatus::Left;
                local.updated = Instant::now();
            }
        }

        let peers = self.live_peers();
        let sends = peers.iter().map(|peer| self.send_to(*peer, false));
        for (peer, result) in peers.iter().zip(join_all(sends).await) {
            if let Err(e) = result {
                warn!(parent: &self.span, "Failed to announce leave to {}: {}", peer, e);
            }
        }
        info!(parent: &self.span, "Member {} left the cluster", self.local_name);
        Ok(())
    }
}
