use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::NodeId;
use crate::api::ServerInfo;
use crate::error::{ClientError, ClientResult, LogError};
use crate::log::Record;
use crate::server::{CommitLogService, ServerDirectory};

/// In-memory commit log for request-path tests.
#[derive(Default)]
pub struct MemoryLog {
    records: Mutex<Vec<Record>>,
    /// When set, appends fail as if this node were a follower of `leader`.
    follower_of: Mutex<Option<Option<NodeId>>>,
    /// Appends never commit in time.
    timing_out: bool,
    appends: AtomicUsize,
}

impl MemoryLog {
    pub fn follower(leader: Option<NodeId>) -> Self {
        Self {
            follower_of: Mutex::new(Some(leader)),
            ..Default::default()
        }
    }

    pub fn timing_out() -> Self {
        Self {
            timing_out: true,
            ..Default::default()
        }
    }

    /// Number of append calls received, successful or not.
    pub fn appends(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }
}

#[async_trait]
impl CommitLogService for MemoryLog {
    async fn append(&self, mut record: Record) -> ClientResult<u64> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        if self.timing_out {
            return Err(ClientError::ProposalTimeout(Duration::from_millis(10)));
        }
        if let Some(leader) = *self.follower_of.lock() {
            return Err(ClientError::NotLeader { leader });
        }
        let mut records = self.records.lock();
        let offset = records.len() as u64;
        record.offset = offset;
        records.push(record);
        Ok(offset)
    }

    async fn read(&self, offset: u64) -> ClientResult<Record> {
        self.records
            .lock()
            .get(offset as usize)
            .cloned()
            .ok_or(ClientError::Log(LogError::OffsetOutOfRange { offset }))
    }
}

/// Server directory whose answer the test controls.
#[derive(Default)]
pub struct StaticDirectory {
    servers: Mutex<Vec<ServerInfo>>,
    /// Answers handed out before falling back to `servers`.
    queued: Mutex<Vec<Vec<ServerInfo>>>,
}

impl StaticDirectory {
    pub fn new(servers: Vec<ServerInfo>) -> Self {
        Self {
            servers: Mutex::new(servers),
            ..Default::default()
        }
    }

    pub fn set(&self, servers: Vec<ServerInfo>) {
        *self.servers.lock() = servers;
    }

    /// Makes the next `get_servers` return `servers` once.
    pub fn answer_once(&self, servers: Vec<ServerInfo>) {
        self.queued.lock().push(servers);
    }
}

#[async_trait]
impl ServerDirectory for StaticDirectory {
    async fn get_servers(&self) -> ClientResult<Vec<ServerInfo>> {
        if let Some(servers) = self.queued.lock().pop() {
            return Ok(servers);
        }
        Ok(self.servers.lock().clone())
    }
}

pub fn server(id: NodeId, rpc_addr: impl Into<String>, is_leader: bool) -> ServerInfo {
    ServerInfo {
        id,
        rpc_addr: rpc_addr.into(),
        is_leader,
    }
}
