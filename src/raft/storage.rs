use std::fmt::Debug;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use openraft::storage::{LogState, RaftLogReader, Snapshot};
use openraft::{
    AnyError, BasicNode, ErrorSubject, ErrorVerb, LogId, OptionalSend, RaftStorage, SnapshotMeta,
    StorageError, StorageIOError, StoredMembership, Vote,
};
use tracing::{Span, debug};

use crate::NodeId;
use crate::error::{LogError, LogResult};
use crate::traits::LogStorage;

use super::fsm::{LogSnapshotBuilder, LogStateMachine};
use super::log_store::{ConsensusLog, Entry};
use super::{ApplyResponse, TypeConfig};

pub(crate) fn storage_error(
    subject: ErrorSubject<NodeId>,
    verb: ErrorVerb,
    err: &LogError,
) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::new(subject, verb, AnyError::new(err)),
    }
}

/// Consensus storage: the replication log plus the user-data state machine.
///
/// openraft's [`openraft::storage::Adaptor`] splits this into the log-storage
/// and state-machine halves the engine drives.
pub struct RaftStore<S> {
    log: Arc<ConsensusLog<S>>,
    state_machine: LogStateMachine<S>,
}

impl<S: LogStorage> RaftStore<S> {
    pub fn open(
        user_log: Arc<S>,
        raft_log: Arc<S>,
        raft_dir: &Path,
        data_dir: &Path,
        span: Span,
    ) -> LogResult<Self> {
        let log = ConsensusLog::open(raft_log, raft_dir, span.clone())?;
        let state_machine = LogStateMachine::open(user_log, data_dir, span)?;
        Ok(Self {
            log: Arc::new(log),
            state_machine,
        })
    }
}

/// Read handle over the consensus log handed out to replication tasks.
pub struct ConsensusLogReader<S> {
    log: Arc<ConsensusLog<S>>,
}

impl<S: LogStorage> RaftLogReader<TypeConfig> for ConsensusLogReader<S> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry>, StorageError<NodeId>> {
        self.log
            .entries(range)
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Read, &e))
    }
}

impl<S: LogStorage> RaftLogReader<TypeConfig> for RaftStore<S> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry>, StorageError<NodeId>> {
        self.log
            .entries(range)
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Read, &e))
    }
}

#[allow(deprecated)]
impl<S: LogStorage> RaftStorage<TypeConfig> for RaftStore<S> {
    type LogReader = ConsensusLogReader<S>;
    type SnapshotBuilder = LogSnapshotBuilder;

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log
            .save_vote(vote)
            .map_err(|e| storage_error(ErrorSubject::Vote, ErrorVerb::Write, &e))
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.log.read_vote())
    }

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_log_id = self
            .log
            .last_log_id()
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Read, &e))?;

        Ok(LogState {
            last_purged_log_id: self.log.last_purged(),
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        ConsensusLogReader {
            log: self.log.clone(),
        }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry> + OptionalSend,
    {
        let entries: Vec<Entry> = entries.into_iter().collect();
        self.log
            .store_logs(&entries)
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Write, &e))
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        debug!("Deleting conflicting consensus logs since {}", log_id);
        self.log
            .delete_from(log_id.index)
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Delete, &e))
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        debug!("Purging consensus logs up to {}", log_id);
        self.log
            .purge(log_id)
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Delete, &e))
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        Ok(self.state_machine.applied_state())
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry],
    ) -> Result<Vec<ApplyResponse>, StorageError<NodeId>> {
        self.state_machine
            .apply(entries)
            .map_err(|e| storage_error(ErrorSubject::StateMachine, ErrorVerb::Write, &e))
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.state_machine.snapshot_builder()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<tokio::fs::File>, StorageError<NodeId>> {
        let file = self.state_machine.begin_receiving().map_err(|e| {
            storage_error(ErrorSubject::Snapshot(None), ErrorVerb::Write, &e)
        })?;
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<tokio::fs::File>,
    ) -> Result<(), StorageError<NodeId>> {
        let file = snapshot.into_std().await;
        self.state_machine
            .install_snapshot(meta, file)
            .map_err(|e| {
                storage_error(
                    ErrorSubject::Snapshot(Some(meta.signature())),
                    ErrorVerb::Write,
                    &e,
                )
            })
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let current = self
            .state_machine
            .current_snapshot()
            .map_err(|e| storage_error(ErrorSubject::Snapshot(None), ErrorVerb::Read, &e))?;
        Ok(current.map(|(meta, file)| Snapshot {
            meta,
            snapshot: Box::new(tokio::fs::File::from_std(file)),
        }))
    }
}
