use std::{
    collections::BTreeSet,
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{LogError, LogResult};

use super::{
    LogConfig,
    record::Record,
    segment::{self, Segment},
    store::Store,
};

struct LogInner {
    config: LogConfig,
    // Ordered by base offset; the last one is the active segment.
    segments: Vec<Segment>,
}

/// Segmented, offset-addressed commit log rooted at a directory.
pub struct Log {
    dir: PathBuf,
    inner: RwLock<LogInner>,
}

impl Log {
    pub fn open(dir: impl AsRef<Path>, config: LogConfig) -> LogResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let config = config.normalized();
        let segments = load_segments(&dir, &config)?;

        info!(
            "Opened log at {} with {} segment(s)",
            dir.display(),
            segments.len()
        );

        Ok(Self {
            dir,
            inner: RwLock::new(LogInner { config, segments }),
        })
    }

    /// Appends `record` and returns the offset it was assigned.
    ///
    /// A maxed active segment is rolled over on the next append, so the new
    /// segment's base is always the previous append's offset plus one.
    pub fn append(&self, record: Record) -> LogResult<u64> {
        let mut inner = self.inner.write();

        if inner.active()?.is_maxed() {
            let next = inner.active()?.next_offset();
            debug!("Rolling over to new segment at offset {}", next);
            inner.new_segment(&self.dir, next)?;
        }

        inner.active_mut()?.append(record)
    }

    pub fn read(&self, offset: u64) -> LogResult<Record> {
        let inner = self.inner.read();
        inner
            .segments
            .iter()
            .find(|s| s.contains(offset))
            .ok_or(LogError::OffsetOutOfRange { offset })?
            .read(offset)
    }

    pub fn lowest_offset(&self) -> u64 {
        let inner = self.inner.read();
        inner
            .segments
            .first()
            .map_or(inner.config.initial_offset, |s| s.base_offset())
    }

    pub fn highest_offset(&self) -> u64 {
        self.next_offset().saturating_sub(1)
    }

    /// Offset the next append will receive.
    pub fn next_offset(&self) -> u64 {
        let inner = self.inner.read();
        inner
            .segments
            .last()
            .map_or(inner.config.initial_offset, |s| s.next_offset())
    }

    /// Removes every segment whose records all sit at or below `lowest`.
    ///
    /// Segments above `lowest` stay in place even when removing an older one
    /// fails, and the log always keeps an active segment.
    pub fn truncate(&self, lowest: u64) -> LogResult<()> {
        let mut inner = self.inner.write();
        let boundary = lowest + 1;

        let mut cut = inner
            .segments
            .partition_point(|s| s.next_offset() <= boundary);
        if cut == inner.segments.len() {
            if inner.active()?.base_offset() == boundary {
                // Already an empty segment at the boundary; reuse it.
                cut -= 1;
            } else {
                inner.new_segment(&self.dir, boundary)?;
            }
        }

        let removed: Vec<Segment> = inner.segments.drain(..cut).collect();
        remove_segments(removed)
    }

    /// Removes every record at or after `from`.
    pub fn truncate_suffix(&self, from: u64) -> LogResult<()> {
        let mut inner = self.inner.write();

        while inner.segments.len() > 1 && inner.active()?.base_offset() >= from {
            if let Some(segment) = inner.segments.pop() {
                segment.remove()?;
            }
        }

        if inner.active()?.base_offset() > from {
            // The only segment left starts past `from`: replace it.
            inner.new_segment(&self.dir, from)?;
            let stale = inner.segments.remove(0);
            stale.remove()
        } else {
            inner.active_mut()?.truncate_from(from)
        }
    }

    /// Wipes the log and starts again at the configured initial offset.
    pub fn reset(&self) -> LogResult<()> {
        let mut inner = self.inner.write();
        inner.reset(&self.dir)
    }

    /// Wipes the log and starts again at `initial_offset`.
    pub fn reset_to(&self, initial_offset: u64) -> LogResult<()> {
        let mut inner = self.inner.write();
        inner.config.initial_offset = initial_offset;
        inner.reset(&self.dir)
    }

    /// A sequential reader over the raw store bytes of every segment, oldest
    /// first, as of the time of the call.
    pub fn reader(&self) -> LogResult<LogReader> {
        let inner = self.inner.read();
        let mut parts = Vec::with_capacity(inner.segments.len());
        for segment in &inner.segments {
            segment.flush()?;
            parts.push((segment.store().clone(), segment.store().size()));
        }
        Ok(LogReader {
            parts,
            current: 0,
            pos: 0,
        })
    }

    pub fn segment_count(&self) -> usize {
        self.inner.read().segments.len()
    }

    pub fn flush(&self) -> LogResult<()> {
        self.inner.read().segments.iter().try_for_each(|s| s.flush())
    }

    pub fn sync(&self) -> LogResult<()> {
        self.inner.read().active()?.sync()
    }

    pub fn close(&self) -> LogResult<()> {
        let mut inner = self.inner.write();
        for segment in inner.segments.iter_mut() {
            segment.close()?;
        }
        Ok(())
    }

    /// Closes the log and deletes its directory.
    pub fn remove(&self) -> LogResult<()> {
        self.close()?;
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> LogConfig {
        self.inner.read().config.clone()
    }
}

impl LogInner {
    fn active(&self) -> LogResult<&Segment> {
        self.segments.last().ok_or_else(no_active_segment)
    }

    fn active_mut(&mut self) -> LogResult<&mut Segment> {
        self.segments.last_mut().ok_or_else(no_active_segment)
    }

    fn new_segment(&mut self, dir: &Path, base_offset: u64) -> LogResult<()> {
        let segment = Segment::open(dir, base_offset, &self.config)?;
        self.segments.push(segment);
        Ok(())
    }

    fn reset(&mut self, dir: &Path) -> LogResult<()> {
        // Dropping the segments unmaps their indexes; the wipe deletes the files.
        self.segments.clear();
        let wiped = wipe_dir(dir);

        // Reload whatever is on disk so a failed wipe still leaves an active
        // segment.
        self.segments = load_segments(dir, &self.config)?;
        wiped?;
        info!(
            "Reset log at {} to offset {}",
            dir.display(),
            self.config.initial_offset
        );
        Ok(())
    }
}

fn no_active_segment() -> LogError {
    LogError::Io(io::Error::other("log has no active segment"))
}

/// Removes every segment, reporting the first failure after trying them all.
fn remove_segments(segments: Vec<Segment>) -> LogResult<()> {
    let mut result = Ok(());
    for segment in segments {
        let base = segment.base_offset();
        if let Err(e) = segment.remove() {
            warn!("Failed to remove segment {}: {}", base, e);
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    result
}

fn wipe_dir(dir: &Path) -> LogResult<()> {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != io::ErrorKind::NotFound {
            return Err(e.into());
        }
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

fn load_segments(dir: &Path, config: &LogConfig) -> LogResult<Vec<Segment>> {
    let mut base_offsets = BTreeSet::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        match segment::parse_segment_file(&path) {
            Some(base) => {
                base_offsets.insert(base);
            }
            None => warn!("Ignoring unexpected file in log dir: {}", path.display()),
        }
    }

    let mut segments = Vec::with_capacity(base_offsets.len().max(1));
    for base in base_offsets {
        segments.push(Segment::open(dir, base, config)?);
    }
    if segments.is_empty() {
        segments.push(Segment::open(dir, config.initial_offset, config)?);
    }
    Ok(segments)
}

/// Streams the concatenated store files of a log, oldest segment first.
pub struct LogReader {
    parts: Vec<(Arc<Store>, u64)>,
    current: usize,
    pos: u64,
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while let Some((store, end)) = self.parts.get(self.current) {
            if self.pos >= *end || buf.is_empty() {
                if buf.is_empty() {
                    return Ok(0);
                }
                self.current += 1;
                self.pos = 0;
                continue;
            }

            let want = buf.len().min((*end - self.pos) as usize);
            let n = store.read_at(&mut buf[..want], self.pos)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("store {} shrank while reading", store.path().display()),
                ));
            }
            self.pos += n as u64;
            return Ok(n);
        }
        Ok(0)
    }
}
