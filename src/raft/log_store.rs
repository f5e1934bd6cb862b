use std::fs;
use std::io;
use std::ops::{Bound, RangeBounds};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use openraft::{EntryPayload, LogId, Vote};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{Span, debug};

use crate::NodeId;
use crate::error::{LogError, LogResult};
use crate::log::Record;
use crate::traits::LogStorage;

use super::TypeConfig;

const META_FILE: &str = "raft-meta.json";

/// Record type stored for entries carrying a proposal.
pub const ENTRY_COMMAND: u32 = 0;
/// Record type stored for blank entries a new leader appends.
pub const ENTRY_NOOP: u32 = 1;
/// Record type stored for membership changes.
pub const ENTRY_CONFIGURATION: u32 = 5;

pub type Entry = openraft::Entry<TypeConfig>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RaftMeta {
    vote: Option<Vote<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
}

/// The consensus engine's replication log, kept in its own [`LogStorage`].
///
/// Entry `i` is the record at offset `i`. The record value is the
/// JSON-encoded entry; its term and type mirror the entry's.
pub struct ConsensusLog<S> {
    log: Arc<S>,
    meta_path: PathBuf,
    meta: Mutex<RaftMeta>,
    span: Span,
}

impl<S: LogStorage> ConsensusLog<S> {
    pub fn open(log: Arc<S>, dir: &Path, span: Span) -> LogResult<Self> {
        fs::create_dir_all(dir)?;
        let meta_path = dir.join(META_FILE);

        let meta = match fs::read(&meta_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => RaftMeta::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            log,
            meta_path,
            meta: Mutex::new(meta),
            span,
        })
    }

    pub fn first_index(&self) -> u64 {
        self.log.lowest_offset()
    }

    pub fn last_index(&self) -> u64 {
        self.log.highest_offset()
    }

    /// Lowest index that still holds a live entry.
    fn first_live_index(&self) -> u64 {
        let purged = self.meta.lock().last_purged.map(|id| id.index + 1).unwrap_or(0);
        self.first_index().max(purged)
    }

    fn has_entries(&self) -> bool {
        self.log.next_offset() > self.first_live_index()
    }

    pub fn get_log(&self, index: u64) -> LogResult<Entry> {
        if index < self.first_live_index() {
            return Err(LogError::OffsetOutOfRange { offset: index });
        }
        let record = self.log.read(index)?;
        Ok(serde_json::from_slice(&record.value)?)
    }

    pub fn entries<RB: RangeBounds<u64>>(&self, range: RB) -> LogResult<Vec<Entry>> {
        let start = match range.start_bound() {
            Bound::Included(&i) => i,
            Bound::Excluded(&i) => i.saturating_add(1),
            Bound::Unbounded => 0,
        }
        .max(self.first_live_index());
        let end = match range.end_bound() {
            Bound::Included(&i) => i.saturating_add(1),
            Bound::Excluded(&i) => i,
            Bound::Unbounded => u64::MAX,
        }
        .min(self.log.next_offset());

        (start..end).map(|index| self.get_log(index)).collect()
    }

    pub fn last_log_id(&self) -> LogResult<Option<LogId<NodeId>>> {
        if !self.has_entries() {
            return Ok(self.last_purged());
        }
        Ok(Some(self.get_log(self.last_index())?.log_id))
    }

    pub fn store_log(&self, entry: &Entry) -> LogResult<()> {
        self.store_logs(std::slice::from_ref(entry))
    }

    /// Appends `entries`, which must continue the log without gaps. An entry
    /// at an index already in the log replaces it and everything after it.
    pub fn store_logs<'a>(&self, entries: impl IntoIterator<Item = &'a Entry>) -> LogResult<()> {
        for entry in entries {
            let index = entry.log_id.index;
            let next = self.log.next_offset();

            if index < next {
                debug!(parent: &self.span, "Overwriting consensus log from index {}", index);
                self.log.truncate_suffix(index)?;
            } else if index > next {
                if self.has_entries() {
                    return Err(LogError::Corruption(format!(
                        "consensus entry {} leaves a gap after {}",
                        index,
                        next.saturating_sub(1)
                    )));
                }
                self.log.reset_to(index)?;
            }

            let record = Record::new(serde_json::to_vec(entry)?)
                .with_term(entry.log_id.leader_id.term, entry_type(entry));
            let offset = self.log.append(record)?;
            if offset != index {
                return Err(LogError::Corruption(format!(
                    "consensus entry {} stored at offset {}",
                    index, offset
                )));
            }
        }
        self.log.flush()
    }

    /// Deletes `[min, max]`. Only a prefix or a suffix of the log can go.
    pub fn delete_range(&self, min: u64, max: u64) -> LogResult<()> {
        let first = self.first_index();
        let last = self.last_index();

        if min <= first {
            self.log.truncate(max)
        } else if max >= last {
            self.log.truncate_suffix(min)
        } else {
            Err(LogError::UnsupportedRange {
                min,
                max,
                first,
                last,
            })
        }
    }

    /// Removes conflicting entries from `index` on.
    pub fn delete_from(&self, index: u64) -> LogResult<()> {
        self.log.truncate_suffix(index)?;
        self.log.flush()
    }

    /// Discards everything up to and including `log_id`.
    pub fn purge(&self, log_id: LogId<NodeId>) -> LogResult<()> {
        self.delete_range(self.first_index(), log_id.index)?;
        self.update_meta(|meta| meta.last_purged = Some(log_id))
    }

    pub fn last_purged(&self) -> Option<LogId<NodeId>> {
        self.meta.lock().last_purged
    }

    pub fn save_vote(&self, vote: &Vote<NodeId>) -> LogResult<()> {
        self.update_meta(|meta| meta.vote = Some(*vote))
    }

    pub fn read_vote(&self) -> Option<Vote<NodeId>> {
        self.meta.lock().vote
    }

    fn update_meta(&self, f: impl FnOnce(&mut RaftMeta)) -> LogResult<()> {
        let mut meta = self.meta.lock();
        f(&mut meta);

        let tmp = self.meta_path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&*meta)?)?;
        fs::rename(&tmp, &self.meta_path)?;
        Ok(())
    }
}

fn entry_type(entry: &Entry) -> u32 {
    match entry.payload {
        EntryPayload::Normal(_) => ENTRY_COMMAND,
        EntryPayload::Blank => ENTRY_NOOP,
        EntryPayload::Membership(_) => ENTRY_CONFIGURATION,
    }
}
