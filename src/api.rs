//! Client protocol messages, carried as bincode frames.

use serde::{Deserialize, Serialize};

use crate::NodeId;
use crate::error::ApiError;
use crate::log::Record;

/// One member of the consensus group as seen by the node answering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: NodeId,
    pub rpc_addr: String,
    pub is_leader: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    Produce { record: Record },
    Consume { offset: u64 },
    /// Streams records from `offset` on, waiting for new ones at the end of
    /// the log. Occupies the connection until either side closes it.
    ConsumeStream { offset: u64 },
    GetServers,
}

impl ClientRequest {
    /// Name the router classifies requests by.
    pub fn method_name(&self) -> &'static str {
        match self {
            ClientRequest::Produce { .. } => "Produce",
            ClientRequest::Consume { .. } => "Consume",
            ClientRequest::ConsumeStream { .. } => "ConsumeStream",
            ClientRequest::GetServers => "GetServers",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientResponse {
    Produced { offset: u64 },
    Consumed { record: Record },
    Servers { servers: Vec<ServerInfo> },
    Error(ApiError),
}

impl From<ApiError> for ClientResponse {
    fn from(err: ApiError) -> Self {
        ClientResponse::Error(err)
    }
}
