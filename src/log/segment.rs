use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::debug;

use crate::error::{LogError, LogResult};

use super::{
    LogConfig,
    index::{self, Index},
    record::Record,
    store::Store,
};

pub const STORE_EXT: &str = "store";
pub const INDEX_EXT: &str = "index";

/// A store plus its index covering offsets `[base_offset, next_offset)`.
pub struct Segment {
    store: Arc<Store>,
    index: Index,
    base_offset: u64,
    next_offset: u64,
    config: LogConfig,
}

impl Segment {
    pub fn open(dir: &Path, base_offset: u64, config: &LogConfig) -> LogResult<Self> {
        let store = Store::open(segment_path(dir, base_offset, STORE_EXT))?;
        let index = Index::open(
            segment_path(dir, base_offset, INDEX_EXT),
            config.max_index_bytes,
        )?;

        let next_offset = match index.read(-1) {
            Ok((rel, _)) => base_offset + rel as u64 + 1,
            Err(e) if index::is_end_of_index(&e) => base_offset,
            Err(e) => return Err(e),
        };

        debug!(
            "Opened segment {} with next offset {} ({} store bytes)",
            base_offset,
            next_offset,
            store.size()
        );

        Ok(Self {
            store: Arc::new(store),
            index,
            base_offset,
            next_offset,
            config: config.clone(),
        })
    }

    /// Stamps `record` with the next offset, stores it and indexes it.
    pub fn append(&mut self, mut record: Record) -> LogResult<u64> {
        if self.index.is_full() {
            return Err(LogError::IndexFull {
                size: self.index.size(),
            });
        }

        let offset = self.next_offset;
        record.offset = offset;
        let data = record.encode()?;

        let (_, pos) = self.store.append(&data)?;
        self.index.write((offset - self.base_offset) as u32, pos)?;

        self.next_offset += 1;
        Ok(offset)
    }

    pub fn read(&self, offset: u64) -> LogResult<Record> {
        if !self.contains(offset) {
            return Err(LogError::OffsetOutOfRange { offset });
        }

        let (_, pos) = self
            .index
            .read((offset - self.base_offset) as i64)
            .map_err(|e| {
                if index::is_end_of_index(&e) {
                    LogError::OffsetOutOfRange { offset }
                } else {
                    e
                }
            })?;

        let data = self.store.read(pos)?;
        Record::decode(&data)
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.base_offset <= offset && offset < self.next_offset
    }

    /// Either the store or the index has reached its configured limit.
    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.max_store_bytes
            || self.index.size() >= self.config.max_index_bytes
            || self.index.is_full()
    }

    /// Drops every record at or after `offset`.
    pub fn truncate_from(&mut self, offset: u64) -> LogResult<()> {
        if offset >= self.next_offset {
            return Ok(());
        }
        let offset = offset.max(self.base_offset);
        let rel = offset - self.base_offset;

        let cut = match self.index.read(rel as i64) {
            Ok((_, pos)) => pos,
            Err(e) if index::is_end_of_index(&e) => return Ok(()),
            Err(e) => return Err(e),
        };

        self.store.truncate(cut)?;
        self.index.truncate(rel);
        self.next_offset = offset;
        Ok(())
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn is_empty(&self) -> bool {
        self.next_offset == self.base_offset
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn flush(&self) -> LogResult<()> {
        self.store.flush()
    }

    pub fn sync(&self) -> LogResult<()> {
        self.store.sync()
    }

    pub fn close(&mut self) -> LogResult<()> {
        self.index.close()?;
        self.store.close()
    }

    pub fn remove(mut self) -> LogResult<()> {
        self.close()?;
        fs::remove_file(self.index.path())?;
        fs::remove_file(self.store.path())?;
        Ok(())
    }
}

pub fn segment_path(dir: &Path, base_offset: u64, ext: &str) -> PathBuf {
    dir.join(format!("{}.{}", base_offset, ext))
}

/// Parses `<base_offset>.store` / `<base_offset>.index` file names.
pub fn parse_segment_file(path: &Path) -> Option<u64> {
    let ext = path.extension()?.to_str()?;
    if ext != STORE_EXT && ext != INDEX_EXT {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}
