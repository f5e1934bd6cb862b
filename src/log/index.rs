use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use memmap2::{MmapMut, MmapOptions};
use tracing::warn;

use crate::error::{LogError, LogResult};

const OFFSET_WIDTH: u64 = 4;
const POS_WIDTH: u64 = 8;

/// Width of one index entry: relative offset (u32 BE) + store position (u64 BE).
pub const ENTRY_WIDTH: u64 = OFFSET_WIDTH + POS_WIDTH;

/// Memory-mapped, fixed-width index from relative offset to store position.
///
/// The backing file is grown to `capacity` while open so it can be mapped,
/// and shrunk back to the logical size on close.
pub struct Index {
    path: PathBuf,
    file: File,
    mmap: Option<MmapMut>,
    size: u64,
    capacity: u64,
}

impl Index {
    pub fn open(path: impl AsRef<Path>, max_index_bytes: u64) -> LogResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let size = file.metadata()?.len();
        if size % ENTRY_WIDTH != 0 {
            return Err(LogError::Corruption(format!(
                "index {} has {} bytes, not a multiple of {}",
                path.display(),
                size,
                ENTRY_WIDTH
            )));
        }

        let capacity = max_index_bytes.max(size);
        file.set_len(capacity)?;
        // SAFETY: the index file belongs to this segment alone, and it is only
        // resized after the map is dropped in `close`.
        let mmap = unsafe { MmapOptions::new().len(capacity as usize).map_mut(&file)? };

        Ok(Self {
            path,
            file,
            mmap: Some(mmap),
            size,
            capacity,
        })
    }

    /// Reads entry `rel`; `-1` reads the last entry.
    pub fn read(&self, rel: i64) -> LogResult<(u32, u64)> {
        if self.size == 0 {
            return Err(end_of_index());
        }

        let entry = if rel == -1 {
            self.size / ENTRY_WIDTH - 1
        } else if rel < 0 {
            return Err(end_of_index());
        } else {
            rel as u64
        };

        let pos = entry * ENTRY_WIDTH;
        if self.size < pos + ENTRY_WIDTH {
            return Err(end_of_index());
        }

        let mmap = self.mapped()?;
        let pos = pos as usize;
        let mut off_buf = [0u8; OFFSET_WIDTH as usize];
        off_buf.copy_from_slice(&mmap[pos..pos + OFFSET_WIDTH as usize]);
        let mut pos_buf = [0u8; POS_WIDTH as usize];
        pos_buf.copy_from_slice(&mmap[pos + OFFSET_WIDTH as usize..pos + ENTRY_WIDTH as usize]);

        Ok((u32::from_be_bytes(off_buf), u64::from_be_bytes(pos_buf)))
    }

    pub fn write(&mut self, rel: u32, position: u64) -> LogResult<()> {
        if self.is_full() {
            return Err(LogError::IndexFull { size: self.size });
        }

        let start = self.size as usize;
        let mmap = self
            .mmap
            .as_mut()
            .ok_or_else(|| LogError::Io(io::Error::other("index closed")))?;
        mmap[start..start + OFFSET_WIDTH as usize].copy_from_slice(&rel.to_be_bytes());
        mmap[start + OFFSET_WIDTH as usize..start + ENTRY_WIDTH as usize]
            .copy_from_slice(&position.to_be_bytes());

        self.size += ENTRY_WIDTH;
        Ok(())
    }

    /// No room for another entry.
    pub fn is_full(&self) -> bool {
        self.size + ENTRY_WIDTH > self.capacity
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn entries(&self) -> u64 {
        self.size / ENTRY_WIDTH
    }

    /// Keeps only the first `entries` entries.
    pub fn truncate(&mut self, entries: u64) {
        self.size = self.size.min(entries * ENTRY_WIDTH);
    }

    pub fn close(&mut self) -> LogResult<()> {
        let Some(mmap) = self.mmap.take() else {
            return Ok(());
        };
        mmap.flush()?;
        drop(mmap);

        self.file.set_len(self.size)?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mapped(&self) -> LogResult<&MmapMut> {
        self.mmap
            .as_ref()
            .ok_or_else(|| LogError::Io(io::Error::other("index closed")))
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close index {}: {}", self.path.display(), e);
        }
    }
}

fn end_of_index() -> LogError {
    LogError::Io(io::Error::from(io::ErrorKind::UnexpectedEof))
}

/// Whether `err` is the index's end-of-data condition.
pub fn is_end_of_index(err: &LogError) -> bool {
    matches!(err, LogError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
}
