use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;

use openraft::storage::RaftSnapshotBuilder;
use openraft::{BasicNode, CommittedLeaderId, EntryPayload, LogId, Membership, Vote};
use tempfile::TempDir;
use tracing::Span;

use super::fsm::LogStateMachine;
use super::log_store::{ConsensusLog, ENTRY_COMMAND, ENTRY_CONFIGURATION, Entry};
use super::{ApplyResponse, Proposal};
use crate::NodeId;
use crate::error::LogError;
use crate::log::record::LEN_WIDTH;
use crate::log::{Log, LogConfig, Record};

fn log_id(term: u64, index: u64) -> LogId<NodeId> {
    LogId::new(CommittedLeaderId::new(term, 1), index)
}

fn normal(term: u64, index: u64, value: &str) -> Entry {
    Entry {
        log_id: log_id(term, index),
        payload: EntryPayload::Normal(Proposal::append(Record::new(value)).unwrap()),
    }
}

fn blank(term: u64, index: u64) -> Entry {
    Entry {
        log_id: log_id(term, index),
        payload: EntryPayload::Blank,
    }
}

fn membership(term: u64, index: u64) -> Entry {
    let nodes = BTreeMap::from([(1, BasicNode::new("127.0.0.1:8400"))]);
    Entry {
        log_id: log_id(term, index),
        payload: EntryPayload::Membership(Membership::new(vec![BTreeSet::from([1])], nodes)),
    }
}

fn open_log(dir: &Path, config: LogConfig) -> Arc<Log> {
    Arc::new(Log::open(dir, config).unwrap())
}

mod state_machine {
    use super::*;

    #[test]
    fn test_apply_committed_entries() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir.path().join("log"), LogConfig::default());
        let mut fsm = LogStateMachine::open(log.clone(), dir.path(), Span::none()).unwrap();

        let responses = fsm
            .apply(&[
                membership(1, 0),
                blank(1, 1),
                normal(1, 2, "first"),
                normal(1, 3, "second"),
            ])
            .unwrap();
        assert_eq!(
            responses,
            vec![
                ApplyResponse::Skipped,
                ApplyResponse::Skipped,
                ApplyResponse::Appended { offset: 0 },
                ApplyResponse::Appended { offset: 1 },
            ]
        );
        assert_eq!(log.read(1).unwrap().value, b"second");

        let (last_applied, last_membership) = fsm.applied_state();
        assert_eq!(last_applied, Some(log_id(1, 3)));
        assert_eq!(last_membership.log_id(), &Some(log_id(1, 0)));

        // Applied state survives a restart.
        drop(fsm);
        let fsm = LogStateMachine::open(log, dir.path(), Span::none()).unwrap();
        assert_eq!(fsm.applied_state().0, Some(log_id(1, 3)));
    }

    #[test]
    fn test_apply_malformed_proposal() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir.path().join("log"), LogConfig::default());
        let mut fsm = LogStateMachine::open(log.clone(), dir.path(), Span::none()).unwrap();

        let entries = [
            Entry {
                log_id: log_id(1, 0),
                payload: EntryPayload::Normal(Proposal { data: Vec::new() }),
            },
            Entry {
                log_id: log_id(1, 1),
                payload: EntryPayload::Normal(Proposal { data: vec![7, 1, 2] }),
            },
        ];
        let responses = fsm.apply(&entries).unwrap();
        assert!(responses.iter().all(|r| matches!(r, ApplyResponse::Failed { .. })));
        assert_eq!(log.next_offset(), 0);
        assert_eq!(fsm.applied_state().0, Some(log_id(1, 1)));
    }

    #[test]
    fn test_snapshot_restore() {
        let dir = TempDir::new().unwrap();
        let config = LogConfig {
            max_store_bytes: 64,
            initial_offset: 5,
            ..Default::default()
        };
        let source = open_log(&dir.path().join("source"), config.clone());
        for value in ["a", "b", "c", "d"] {
            source.append(Record::new(value)).unwrap();
        }
        let fsm = LogStateMachine::open(source, &dir.path().join("sm-a"), Span::none()).unwrap();
        let mut data = Vec::new();
        fsm.snapshot().unwrap().read_to_end(&mut data).unwrap();

        let target = open_log(&dir.path().join("target"), LogConfig::default());
        target.append(Record::new("stale")).unwrap();
        let restorer =
            LogStateMachine::open(target.clone(), &dir.path().join("sm-b"), Span::none()).unwrap();

        assert_eq!(restorer.restore(Cursor::new(data)).unwrap(), 4);
        assert_eq!(target.lowest_offset(), 5);
        assert_eq!(target.highest_offset(), 8);
        assert_eq!(target.read(5).unwrap().value, b"a");
        assert_eq!(target.read(8).unwrap().value, b"d");
        assert!(target.read(4).is_err());
    }

    #[test]
    fn test_restore_rejects_gaps() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir.path().join("log"), LogConfig::default());
        let fsm = LogStateMachine::open(log, dir.path(), Span::none()).unwrap();

        let mut data = Vec::new();
        for offset in [0u64, 2] {
            let record = Record {
                offset,
                ..Record::new("x")
            };
            let encoded = record.encode().unwrap();
            data.extend_from_slice(&(encoded.len() as u64).to_be_bytes());
            data.extend_from_slice(&encoded);
        }

        let err = fsm.restore(Cursor::new(data)).unwrap_err();
        assert!(matches!(err, LogError::Corruption(_)));
    }

    #[test]
    fn test_restore_truncated_length_prefix() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir.path().join("log"), LogConfig::default());
        let fsm = LogStateMachine::open(log, dir.path(), Span::none()).unwrap();

        let err = fsm
            .restore(Cursor::new(vec![0u8; LEN_WIDTH - 3]))
            .unwrap_err();
        assert!(matches!(err, LogError::Corruption(_)));
    }

    #[test]
    fn test_restore_rejects_oversized_length_prefix() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir.path().join("log"), LogConfig::default());
        let fsm = LogStateMachine::open(log, dir.path(), Span::none()).unwrap();

        let mut data = vec![0xFFu8; LEN_WIDTH];
        data.extend_from_slice(b"abc");
        let err = fsm.restore(Cursor::new(data)).unwrap_err();
        assert!(matches!(err, LogError::Corruption(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_build_and_install_snapshot() {
        let dir = TempDir::new().unwrap();
        let leader_log = open_log(&dir.path().join("leader"), LogConfig::default());
        let leader_dir = dir.path().join("sm-leader");
        let mut leader =
            LogStateMachine::open(leader_log.clone(), &leader_dir, Span::none()).unwrap();
        leader
            .apply(&[membership(1, 0), normal(1, 1, "x"), normal(1, 2, "y")])
            .unwrap();

        let snapshot = leader.snapshot_builder().build_snapshot().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id, Some(log_id(1, 2)));
        assert!(leader_dir.join("snapshots").join("current.snap").exists());

        // The snapshot file holds exactly the log's raw bytes.
        let mut expected = Vec::new();
        leader_log.reader().unwrap().read_to_end(&mut expected).unwrap();
        let (meta, mut file) = leader.current_snapshot().unwrap().unwrap();
        assert_eq!(meta.snapshot_id, snapshot.meta.snapshot_id);
        let mut sent = Vec::new();
        file.read_to_end(&mut sent).unwrap();
        assert_eq!(sent, expected);

        let follower_log = open_log(&dir.path().join("follower"), LogConfig::default());
        let mut follower = LogStateMachine::open(
            follower_log.clone(),
            &dir.path().join("sm-follower"),
            Span::none(),
        )
        .unwrap();
        let mut incoming = follower.begin_receiving().unwrap();
        incoming.write_all(&sent).unwrap();
        follower.install_snapshot(&snapshot.meta, incoming).unwrap();

        assert_eq!(follower.applied_state().0, Some(log_id(1, 2)));
        assert_eq!(follower_log.read(1).unwrap().value, b"y");
        let (meta, _) = follower.current_snapshot().unwrap().unwrap();
        assert_eq!(meta.snapshot_id, snapshot.meta.snapshot_id);
    }

    #[tokio::test]
    async fn test_current_snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir.path().join("log"), LogConfig::default());
        let sm_dir = dir.path().join("sm");
        let mut fsm = LogStateMachine::open(log.clone(), &sm_dir, Span::none()).unwrap();
        assert!(fsm.current_snapshot().unwrap().is_none());

        fsm.apply(&[normal(1, 1, "x")]).unwrap();
        let snapshot = fsm.snapshot_builder().build_snapshot().await.unwrap();
        drop(fsm);

        let fsm = LogStateMachine::open(log, &sm_dir, Span::none()).unwrap();
        let (meta, _) = fsm.current_snapshot().unwrap().unwrap();
        assert_eq!(meta, snapshot.meta);
    }
}

mod consensus_log {
    use super::*;

    fn open(dir: &TempDir) -> ConsensusLog<Log> {
        let log = open_log(&dir.path().join("log"), LogConfig::default());
        ConsensusLog::open(log, dir.path(), Span::none()).unwrap()
    }

    #[test]
    fn test_store_and_get() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert_eq!(store.last_log_id().unwrap(), None);

        let entries: Vec<Entry> = (0..5).map(|i| normal(1, i, "v")).collect();
        store.store_logs(&entries).unwrap();

        assert_eq!(store.first_index(), 0);
        assert_eq!(store.last_index(), 4);
        assert_eq!(store.get_log(3).unwrap().log_id, log_id(1, 3));
        assert_eq!(store.last_log_id().unwrap(), Some(log_id(1, 4)));

        let range = store.entries(1..3).unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].log_id.index, 1);

        // Stored records mirror the entry's term and type.
        store.store_log(&membership(2, 5)).unwrap();
        drop(store);
        let store_log = open_log(&dir.path().join("log"), LogConfig::default());
        let record = store_log.read(5).unwrap();
        assert_eq!(record.term, 2);
        assert_eq!(record.record_type, ENTRY_CONFIGURATION);
        assert_eq!(store_log.read(0).unwrap().record_type, ENTRY_COMMAND);
    }

    #[test]
    fn test_overwrite_conflicting_suffix() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let entries: Vec<Entry> = (0..5).map(|i| normal(1, i, "old")).collect();
        store.store_logs(&entries).unwrap();

        store.store_log(&normal(2, 3, "new")).unwrap();
        assert_eq!(store.last_index(), 3);
        assert_eq!(store.get_log(3).unwrap().log_id, log_id(2, 3));
        assert!(store.get_log(4).is_err());
    }

    #[test]
    fn test_gap_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.store_log(&normal(1, 0, "v")).unwrap();

        let err = store.store_log(&normal(1, 2, "v")).unwrap_err();
        assert!(matches!(err, LogError::Corruption(_)));
    }

    #[test]
    fn test_delete_range() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let entries: Vec<Entry> = (0..6).map(|i| normal(1, i, "v")).collect();
        store.store_logs(&entries).unwrap();

        let err = store.delete_range(2, 3).unwrap_err();
        assert!(matches!(
            err,
            LogError::UnsupportedRange {
                min: 2,
                max: 3,
                first: 0,
                last: 5
            }
        ));

        store.delete_range(4, 5).unwrap();
        assert_eq!(store.last_index(), 3);
        assert_eq!(store.last_log_id().unwrap(), Some(log_id(1, 3)));
    }

    #[test]
    fn test_purge() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let entries: Vec<Entry> = (0..5).map(|i| normal(1, i, "v")).collect();
        store.store_logs(&entries).unwrap();

        store.purge(log_id(1, 2)).unwrap();
        assert_eq!(store.last_purged(), Some(log_id(1, 2)));
        assert!(matches!(
            store.get_log(1).unwrap_err(),
            LogError::OffsetOutOfRange { offset: 1 }
        ));
        let live = store.entries(..).unwrap();
        assert_eq!(
            live.iter().map(|e| e.log_id.index).collect::<Vec<_>>(),
            vec![3, 4]
        );

        // Purging everything leaves the purge point as the last log id.
        store.purge(log_id(1, 4)).unwrap();
        assert_eq!(store.last_log_id().unwrap(), Some(log_id(1, 4)));

        // The next entry continues after the purge point.
        store.store_log(&normal(1, 5, "v")).unwrap();
        assert_eq!(store.get_log(5).unwrap().log_id, log_id(1, 5));
    }

    #[test]
    fn test_meta_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let entries: Vec<Entry> = (0..3).map(|i| normal(1, i, "v")).collect();
        store.store_logs(&entries).unwrap();

        let vote = Vote::new(3, 2);
        store.save_vote(&vote).unwrap();
        store.purge(log_id(1, 0)).unwrap();
        drop(store);

        let store = open(&dir);
        assert_eq!(store.read_vote(), Some(vote));
        assert_eq!(store.last_purged(), Some(log_id(1, 0)));
        assert_eq!(store.last_log_id().unwrap(), Some(log_id(1, 2)));
    }
}
