//! proglog - a replicated commit log.
//!
//! Records are appended to a segmented on-disk [`log::Log`], replicated
//! through openraft ([`raft::DistributedLog`]), and served to clients over a
//! socket shared with consensus traffic ([`mux`]). Gossip [`membership`]
//! keeps the voter set in step with the live nodes, and the [`router`] sends
//! writes to the leader and reads to followers.

pub mod api;
pub mod codec;
pub mod error;
pub mod log;
pub mod membership;
pub mod mux;
pub mod raft;
pub mod router;
pub mod server;
pub mod tls;
pub mod traits;

#[cfg(test)]
pub(crate) mod mock;

pub type NodeId = u64;

pub use api::{ClientRequest, ClientResponse, ServerInfo};
pub use error::{ApiError, ClientError, LogError, MembershipError, RouterError, TransportError};
pub use log::{Log, LogConfig, Record};
pub use membership::{Membership, MembershipConfig};
pub use raft::{DistributedLog, RaftOptions};
pub use router::{ClientOptions, LogClient};
pub use server::LogServer;
pub use traits::LogStorage;
