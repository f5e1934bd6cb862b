use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::NodeId;

pub type LogResult<T> = Result<T, LogError>;
pub type ClientResult<T> = Result<T, ClientError>;
pub type MembershipResult<T> = Result<T, MembershipError>;
pub type RouterResult<T> = Result<T, RouterError>;
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised by the segmented log and everything below it.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("offset out of range: {offset}")]
    OffsetOutOfRange { offset: u64 },

    #[error("storage corruption: {0}")]
    Corruption(String),

    #[error("index full at {size} bytes")]
    IndexFull { size: u64 },

    #[error("unsupported delete range [{min}, {max}] (log holds [{first}, {last}])")]
    UnsupportedRange {
        min: u64,
        max: u64,
        first: u64,
        last: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(String),
}

impl LogError {
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, LogError::OffsetOutOfRange { .. })
    }
}

impl From<bincode::Error> for LogError {
    fn from(err: bincode::Error) -> Self {
        LogError::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for LogError {
    fn from(err: serde_json::Error) -> Self {
        LogError::Codec(err.to_string())
    }
}

/// Errors surfaced to callers of the replicated log.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("proposal did not commit within {0:?}; outcome is indeterminate")]
    ProposalTimeout(std::time::Duration),

    #[error("apply failed: {0}")]
    Apply(String),

    #[error("consensus error: {0}")]
    Consensus(String),

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("codec error: {0}")]
    Codec(String),
}

impl From<bincode::Error> for ClientError {
    fn from(err: bincode::Error) -> Self {
        ClientError::Codec(err.to_string())
    }
}

/// Errors from membership reconciliation and the gossip layer.
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("not the consensus leader")]
    NotLeader,

    #[error("reconcile failed: {0}")]
    Reconcile(String),

    #[error("reconcile timed out")]
    Timeout,

    #[error("no seed address could be contacted")]
    NoSeedReachable,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Errors from client side routing.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no connection available")]
    NoConnectionAvailable,

    #[error("resolve failed: {0}")]
    Resolve(String),

    /// The connection could not be opened, so no request was sent.
    #[error("dial failed: {0}")]
    Dial(TransportError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("server error: {0}")]
    Api(#[from] ApiError),
}

impl RouterError {
    /// Whether re-resolving membership and trying again may succeed.
    ///
    /// A write is only retried when no server can have applied it: nothing
    /// was picked, the dial failed, or a follower turned it away.
    pub fn is_retryable(&self, write: bool) -> bool {
        match self {
            RouterError::NoConnectionAvailable | RouterError::Dial(_) => true,
            RouterError::Transport(_) => !write,
            RouterError::Api(ApiError::NotLeader { .. }) => true,
            RouterError::Api(ApiError::Unavailable(_)) => !write,
            RouterError::Api(_) | RouterError::Resolve(_) => false,
        }
    }
}

/// Errors from framing, the multiplexer and the stream layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("not a raft rpc (tag {0})")]
    UnexpectedTag(u8),

    #[error("listener closed")]
    Closed,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl From<bincode::Error> for TransportError {
    fn from(err: bincode::Error) -> Self {
        TransportError::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Codec(err.to_string())
    }
}

/// Error carried inside a client protocol response.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("offset out of range: {offset}")]
    OffsetOutOfRange { offset: u64 },

    #[error("not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("{subject} not permitted to {action} to {object}")]
    PermissionDenied {
        subject: String,
        object: String,
        action: String,
    },

    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The write may or may not have been applied.
    #[error("indeterminate: {0}")]
    Indeterminate(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ClientError> for ApiError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::NotLeader { leader } => ApiError::NotLeader { leader },
            ClientError::Log(LogError::OffsetOutOfRange { offset }) => {
                ApiError::OffsetOutOfRange { offset }
            }
            ClientError::ProposalTimeout(elapsed) => {
                ApiError::Indeterminate(format!("proposal timed out after {elapsed:?}"))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<LogError> for ApiError {
    fn from(err: LogError) -> Self {
        ClientError::Log(err).into()
    }
}
