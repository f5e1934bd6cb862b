//! Consensus RPCs as JSON frames over the stream layer.
//!
//! Each peer gets one cached connection that carries request/reply pairs in
//! lock step. Any failure drops the connection and the next call redials.

use std::sync::Arc;
use std::time::Duration;

use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use serde::{Deserialize, Serialize};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{Instrument, Span, debug, info, warn};

use crate::NodeId;
use crate::codec::{FrameReader, FrameWriter};
use crate::error::{TransportError, TransportResult};
use crate::mux::BoxedStream;

use super::stream_layer::StreamLayer;
use super::{LogRaft, TypeConfig};

#[derive(Debug, Serialize, Deserialize)]
pub enum RaftRequest {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<NodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

impl RaftRequest {
    fn name(&self) -> &'static str {
        match self {
            RaftRequest::AppendEntries(_) => "AppendEntries",
            RaftRequest::Vote(_) => "Vote",
            RaftRequest::InstallSnapshot(_) => "InstallSnapshot",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RaftReply {
    AppendEntries(Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>),
    Vote(Result<VoteResponse<NodeId>, RaftError<NodeId>>),
    InstallSnapshot(
        Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>,
    ),
}

type RpcError<E = RaftError<NodeId>> = RPCError<NodeId, BasicNode, E>;

/// Hands out one [`Network`] per target node.
pub struct NetworkFactory {
    stream_layer: Arc<StreamLayer>,
    dial_timeout: Duration,
    span: Span,
}

impl NetworkFactory {
    pub fn new(stream_layer: Arc<StreamLayer>, dial_timeout: Duration, span: Span) -> Self {
        Self {
            stream_layer,
            dial_timeout,
            span,
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for NetworkFactory {
    type Network = Network;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        Network {
            target,
            addr: node.addr.clone(),
            stream_layer: self.stream_layer.clone(),
            dial_timeout: self.dial_timeout,
            conn: None,
            span: self.span.clone(),
        }
    }
}

struct PeerConn {
    reader: FrameReader<ReadHalf<BoxedStream>>,
    writer: FrameWriter<WriteHalf<BoxedStream>>,
}

/// Why a call failed: the peer could not be dialed at all, or the
/// connection broke mid-call.
enum CallError {
    Unreachable(TransportError),
    Network(TransportError),
}

impl CallError {
    fn into_rpc<E: std::error::Error>(self) -> RpcError<E> {
        match self {
            CallError::Unreachable(e) => RPCError::Unreachable(Unreachable::new(&e)),
            CallError::Network(e) => RPCError::Network(NetworkError::new(&e)),
        }
    }
}

pub struct Network {
    target: NodeId,
    addr: String,
    stream_layer: Arc<StreamLayer>,
    dial_timeout: Duration,
    conn: Option<PeerConn>,
    span: Span,
}

impl Network {
    async fn connection(&mut self) -> Result<&mut PeerConn, CallError> {
        if self.conn.is_none() {
            let stream = self
                .stream_layer
                .dial(&self.addr, self.dial_timeout)
                .await
                .map_err(CallError::Unreachable)?;
            debug!(parent: &self.span, "Connected to node {} at {}", self.target, self.addr);

            let (reader, writer) = tokio::io::split(stream);
            self.conn = Some(PeerConn {
                reader: FrameReader::new(reader),
                writer: FrameWriter::new(writer),
            });
        }
        self.conn.as_mut().ok_or(CallError::Network(TransportError::Closed))
    }

    async fn call(&mut self, request: RaftRequest, ttl: Duration) -> Result<RaftReply, CallError> {
        let name = request.name();
        let exchange = async {
            let conn = self.connection().await?;
            conn.writer
                .write_json(&request)
                .await
                .map_err(CallError::Network)?;
            conn.reader
                .read_json::<RaftReply>()
                .await
                .map_err(CallError::Network)?
                .ok_or(CallError::Network(TransportError::Closed))
        };

        let result = match tokio::time::timeout(ttl, exchange).await {
            Ok(result) => result,
            Err(_) => Err(CallError::Network(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{} timed out after {:?}", name, ttl),
            )))),
        };

        if let Err(CallError::Network(e) | CallError::Unreachable(e)) = &result {
            debug!(parent: &self.span, "{} to node {} failed: {}", name, self.target, e);
            self.conn = None;
        }
        result
    }

    fn unexpected<E: std::error::Error>(&mut self, expected: &str) -> RpcError<E> {
        self.conn = None;
        let e = TransportError::Codec(format!("expected {} reply", expected));
        RPCError::Network(NetworkError::new(&e))
    }
}

impl RaftNetwork<TypeConfig> for Network {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RpcError> {
        match self
            .call(RaftRequest::AppendEntries(rpc), option.hard_ttl())
            .await
            .map_err(CallError::into_rpc::<RaftError<NodeId>>)?
        {
            RaftReply::AppendEntries(reply) => {
                reply.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
            }
            _ => Err(self.unexpected("AppendEntries")),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<InstallSnapshotResponse<NodeId>, RpcError<RaftError<NodeId, InstallSnapshotError>>>
    {
        match self
            .call(RaftRequest::InstallSnapshot(rpc), option.hard_ttl())
            .await
            .map_err(CallError::into_rpc::<RaftError<NodeId, InstallSnapshotError>>)?
        {
            RaftReply::InstallSnapshot(reply) => {
                reply.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
            }
            _ => Err(self.unexpected("InstallSnapshot")),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RpcError> {
        match self
            .call(RaftRequest::Vote(rpc), option.hard_ttl())
            .await
            .map_err(CallError::into_rpc::<RaftError<NodeId>>)?
        {
            RaftReply::Vote(reply) => {
                reply.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
            }
            _ => Err(self.unexpected("Vote")),
        }
    }
}

/// Accepts consensus connections from the stream layer and feeds them to the
/// local engine.
pub struct RaftRpcServer {
    raft: LogRaft,
    stream_layer: Arc<StreamLayer>,
    span: Span,
}

impl RaftRpcServer {
    pub fn new(raft: LogRaft, stream_layer: Arc<StreamLayer>, span: Span) -> Self {
        Self {
            raft,
            stream_layer,
            span,
        }
    }

    pub async fn serve(self) {
        loop {
            match self.stream_layer.accept_tagged().await {
                Ok(stream) => {
                    let raft = self.raft.clone();
                    let stream_layer = self.stream_layer.clone();
                    let peer = stream.peer_addr().ok();
                    tokio::spawn(
                        async move {
                            if let Err(e) = handle_peer(raft, stream_layer, stream).await {
                                warn!("Error handling consensus peer {:?}: {}", peer, e);
                            }
                        }
                        .instrument(self.span.clone()),
                    );
                }
                Err(TransportError::Closed) => {
                    info!(parent: &self.span, "Consensus listener closed");
                    return;
                }
                Err(e) => {
                    warn!(parent: &self.span, "Rejected consensus connection: {}", e);
                }
            }
        }
    }
}

async fn handle_peer(
    raft: LogRaft,
    stream_layer: Arc<StreamLayer>,
    stream: TcpStream,
) -> TransportResult<()> {
    let stream = stream_layer.secure(stream).await?;
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = FrameReader::new(reader);
    let mut writer = FrameWriter::new(writer);

    while let Some(request) = reader.read_json::<RaftRequest>().await? {
        let reply = match request {
            RaftRequest::AppendEntries(rpc) => RaftReply::AppendEntries(raft.append_entries(rpc).await),
            RaftRequest::Vote(rpc) => RaftReply::Vote(raft.vote(rpc).await),
            RaftRequest::InstallSnapshot(rpc) => {
                RaftReply::InstallSnapshot(raft.install_snapshot(rpc).await)
            }
        };
        writer.write_json(&reply).await?;
    }
    Ok(())
}
