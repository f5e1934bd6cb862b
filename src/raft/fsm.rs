use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use openraft::storage::{RaftSnapshotBuilder, Snapshot};
use openraft::{
    BasicNode, EntryPayload, ErrorSubject, ErrorVerb, LogId, SnapshotMeta, StorageError,
    StoredMembership,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{Span, debug, error, info};

use crate::NodeId;
use crate::error::{LogError, LogResult};
use crate::log::record::LEN_WIDTH;
use crate::log::{LogReader, Record};
use crate::traits::LogStorage;

use super::storage::storage_error;
use super::{ApplyResponse, ProduceRequest, Proposal, RequestType, TypeConfig};

const META_FILE: &str = "sm-meta.json";
const SNAPSHOT_DIR: &str = "snapshots";
const CURRENT_SNAPSHOT: &str = "current.snap";
const CURRENT_SNAPSHOT_META: &str = "current.json";
const INCOMING_SNAPSHOT: &str = "incoming.snap";

type Entry = openraft::Entry<TypeConfig>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateMachineMeta {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
}

type CurrentSnapshot = Arc<Mutex<Option<SnapshotMeta<NodeId, BasicNode>>>>;

/// Applies committed proposals to the user-data log.
///
/// A snapshot is the log's raw store bytes, kept in a file under
/// `snapshots/`; restoring one rebuilds the log record by record at the
/// original offsets. Only the current snapshot's meta stays in memory.
pub struct LogStateMachine<S> {
    log: Arc<S>,
    meta_path: PathBuf,
    meta: StateMachineMeta,
    snapshot_dir: PathBuf,
    current: CurrentSnapshot,
    span: Span,
}

impl<S: LogStorage> LogStateMachine<S> {
    pub fn open(log: Arc<S>, dir: &Path, span: Span) -> LogResult<Self> {
        fs::create_dir_all(dir)?;
        let meta_path = dir.join(META_FILE);

        let meta: StateMachineMeta = read_json(&meta_path)?.unwrap_or_default();

        let snapshot_dir = dir.join(SNAPSHOT_DIR);
        fs::create_dir_all(&snapshot_dir)?;
        let current: Option<SnapshotMeta<NodeId, BasicNode>> =
            match read_json(&snapshot_dir.join(CURRENT_SNAPSHOT_META))? {
                Some(snapshot) if snapshot_dir.join(CURRENT_SNAPSHOT).exists() => Some(snapshot),
                _ => None,
            };

        Ok(Self {
            log,
            meta_path,
            meta,
            snapshot_dir,
            current: Arc::new(Mutex::new(current)),
            span,
        })
    }

    pub fn applied_state(&self) -> (Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>) {
        (self.meta.last_applied, self.meta.last_membership.clone())
    }

    /// Applies a batch of committed entries in order.
    pub fn apply(&mut self, entries: &[Entry]) -> LogResult<Vec<ApplyResponse>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            self.meta.last_applied = Some(entry.log_id);

            let response = match &entry.payload {
                EntryPayload::Blank => ApplyResponse::Skipped,
                EntryPayload::Normal(proposal) => self.apply_proposal(proposal),
                EntryPayload::Membership(membership) => {
                    self.meta.last_membership =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    ApplyResponse::Skipped
                }
            };
            responses.push(response);
        }

        if !entries.is_empty() {
            self.log.flush()?;
            self.persist_meta()?;
        }
        Ok(responses)
    }

    fn apply_proposal(&self, proposal: &Proposal) -> ApplyResponse {
        let Some((tag, body)) = proposal.split() else {
            return ApplyResponse::Failed {
                reason: "empty proposal".to_string(),
            };
        };

        match RequestType::try_from(tag) {
            Ok(RequestType::Append) => {
                let request: ProduceRequest = match bincode::deserialize(body) {
                    Ok(request) => request,
                    Err(e) => {
                        return ApplyResponse::Failed {
                            reason: format!("malformed produce request: {}", e),
                        };
                    }
                };

                match self.log.append(request.record) {
                    Ok(offset) => ApplyResponse::Appended { offset },
                    Err(e) => {
                        error!(parent: &self.span, "Failed to append committed record: {}", e);
                        ApplyResponse::Failed {
                            reason: e.to_string(),
                        }
                    }
                }
            }
            Err(tag) => ApplyResponse::Failed {
                reason: format!("unknown request type {}", tag),
            },
        }
    }

    /// A point-in-time reader over the log's raw bytes.
    pub fn snapshot(&self) -> LogResult<LogReader> {
        self.log.reader()
    }

    /// Replaces the log's contents with the records in `reader`.
    ///
    /// The first record's offset becomes the log's initial offset; every
    /// following record must carry the next consecutive offset.
    pub fn restore(&self, mut reader: impl Read) -> LogResult<u64> {
        let mut restored = 0u64;

        while let Some(len) = read_len(&mut reader)? {
            // The length comes off the wire; only trust bytes that arrive.
            let mut buf = Vec::new();
            reader.by_ref().take(len).read_to_end(&mut buf)?;
            if (buf.len() as u64) < len {
                return Err(LogError::Corruption(format!(
                    "truncated snapshot record: {} of {} bytes",
                    buf.len(),
                    len
                )));
            }
            let record = Record::decode(&buf)?;

            if restored == 0 {
                self.log.reset_to(record.offset)?;
            }

            let expected = self.log.next_offset();
            if record.offset != expected {
                return Err(LogError::Corruption(format!(
                    "snapshot is not contiguous: expected offset {}, found {}",
                    expected, record.offset
                )));
            }

            self.log.append(record)?;
            restored += 1;
        }

        if restored == 0 {
            let initial = self.log.lowest_offset();
            self.log.reset_to(initial)?;
        }
        self.log.flush()?;
        Ok(restored)
    }

    pub fn snapshot_builder(&self) -> LogSnapshotBuilder {
        LogSnapshotBuilder {
            reader: Some(self.snapshot()),
            last_applied: self.meta.last_applied,
            last_membership: self.meta.last_membership.clone(),
            snapshot_dir: self.snapshot_dir.clone(),
            current: self.current.clone(),
            span: self.span.clone(),
        }
    }

    /// An empty file for a snapshot streamed in from the leader.
    pub fn begin_receiving(&self) -> LogResult<File> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.snapshot_dir.join(INCOMING_SNAPSHOT))?;
        Ok(file)
    }

    /// Installs a snapshot received from the leader into the file handed out
    /// by [`Self::begin_receiving`].
    pub fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        mut file: File,
    ) -> LogResult<()> {
        file.seek(SeekFrom::Start(0))?;
        let restored = self.restore(BufReader::new(file))?;
        info!(
            parent: &self.span,
            "Installed snapshot {} with {} record(s)", meta.snapshot_id, restored
        );

        self.meta.last_applied = meta.last_log_id;
        self.meta.last_membership = meta.last_membership.clone();
        self.persist_meta()?;

        let mut current = self.current.lock();
        promote_snapshot(
            &self.snapshot_dir,
            &self.snapshot_dir.join(INCOMING_SNAPSHOT),
            meta,
        )?;
        *current = Some(meta.clone());
        Ok(())
    }

    /// The latest snapshot's meta and a handle on its data file.
    pub fn current_snapshot(&self) -> LogResult<Option<(SnapshotMeta<NodeId, BasicNode>, File)>> {
        let current = self.current.lock();
        let Some(meta) = current.as_ref() else {
            return Ok(None);
        };
        let file = File::open(self.snapshot_dir.join(CURRENT_SNAPSHOT))?;
        Ok(Some((meta.clone(), file)))
    }

    fn persist_meta(&self) -> LogResult<()> {
        write_json(&self.meta_path, &self.meta)
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> LogResult<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> LogResult<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Makes `data` the current snapshot file and records its meta. Callers hold
/// the current-snapshot lock.
fn promote_snapshot(
    snapshot_dir: &Path,
    data: &Path,
    meta: &SnapshotMeta<NodeId, BasicNode>,
) -> LogResult<()> {
    fs::rename(data, snapshot_dir.join(CURRENT_SNAPSHOT))?;
    write_json(&snapshot_dir.join(CURRENT_SNAPSHOT_META), meta)
}

/// Reads one 8-byte big-endian length, or `None` at a clean end of stream.
fn read_len(reader: &mut impl Read) -> LogResult<Option<u64>> {
    let mut buf = [0u8; LEN_WIDTH];
    let mut filled = 0;
    while filled < LEN_WIDTH {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(LogError::Corruption(
                    "truncated snapshot length prefix".to_string(),
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(u64::from_be_bytes(buf)))
}

/// Builds a snapshot from a log reader captured alongside the applied state
/// it corresponds to.
pub struct LogSnapshotBuilder {
    reader: Option<LogResult<LogReader>>,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    snapshot_dir: PathBuf,
    current: CurrentSnapshot,
    span: Span,
}

impl LogSnapshotBuilder {
    /// Streams the log into a new snapshot file and makes it current.
    fn write_snapshot(
        &self,
        reader: &mut LogReader,
        meta: &SnapshotMeta<NodeId, BasicNode>,
    ) -> LogResult<(File, u64)> {
        let building = self
            .snapshot_dir
            .join(format!("{}.snap.tmp", meta.snapshot_id));
        let mut file = File::create(&building)?;
        let written = io::copy(reader, &mut file)?;
        file.flush()?;
        file.sync_data()?;
        drop(file);

        let mut current = self.current.lock();
        promote_snapshot(&self.snapshot_dir, &building, meta)?;
        *current = Some(meta.clone());

        let file = File::open(self.snapshot_dir.join(CURRENT_SNAPSHOT))?;
        Ok((file, written))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for LogSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let subject = ErrorSubject::Snapshot(None);

        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| {
                storage_error(
                    subject.clone(),
                    ErrorVerb::Read,
                    &LogError::Corruption("snapshot builder already used".to_string()),
                )
            })?
            .map_err(|e| storage_error(subject.clone(), ErrorVerb::Read, &e))?;

        let snapshot_id = match self.last_applied {
            Some(log_id) => format!(
                "{}-{}-{:x}",
                log_id.leader_id.term,
                log_id.index,
                rand::random::<u32>()
            ),
            None => format!("0-0-{:x}", rand::random::<u32>()),
        };

        let meta = SnapshotMeta {
            last_log_id: self.last_applied,
            last_membership: self.last_membership.clone(),
            snapshot_id,
        };

        let (file, written) = self
            .write_snapshot(&mut reader, &meta)
            .map_err(|e| storage_error(subject, ErrorVerb::Write, &e))?;
        debug!(
            parent: &self.span,
            "Built snapshot {} ({} bytes)", meta.snapshot_id, written
        );

        Ok(Snapshot {
            meta,
            snapshot: Box::new(tokio::fs::File::from_std(file)),
        })
    }
}
