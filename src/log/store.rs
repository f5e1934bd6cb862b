use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{LogError, LogResult};

use super::record::LEN_WIDTH;

// Store file format:
// | len (u64 BE) | record bytes | len (u64 BE) | record bytes | ...

struct StoreWriter {
    buf: BufWriter<File>,
    size: u64,
}

/// Append-only file of length-prefixed record payloads.
pub struct Store {
    path: PathBuf,
    file: File,
    writer: Mutex<StoreWriter>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> LogResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        let reader = file.try_clone()?;

        Ok(Self {
            path,
            file: reader,
            writer: Mutex::new(StoreWriter {
                buf: BufWriter::new(file),
                size,
            }),
        })
    }

    /// Appends one payload and returns `(bytes_written, position)`.
    pub fn append(&self, data: &[u8]) -> LogResult<(u64, u64)> {
        let mut writer = self.writer.lock();
        let pos = writer.size;

        writer.buf.write_all(&(data.len() as u64).to_be_bytes())?;
        writer.buf.write_all(data)?;

        let written = (LEN_WIDTH + data.len()) as u64;
        writer.size += written;
        Ok((written, pos))
    }

    pub fn read(&self, pos: u64) -> LogResult<Vec<u8>> {
        self.flush()?;

        let mut len_buf = [0u8; LEN_WIDTH];
        self.file
            .read_exact_at(&mut len_buf, pos)
            .map_err(|e| self.short_read(e, pos, "length prefix"))?;

        let len = u64::from_be_bytes(len_buf);
        let end = self.size();
        let record_end = (pos + LEN_WIDTH as u64).checked_add(len);
        if record_end.is_none_or(|record_end| record_end > end) {
            return Err(LogError::Corruption(format!(
                "record at {} in {} claims {} bytes past end {}",
                pos,
                self.path.display(),
                len,
                end
            )));
        }

        let mut data = vec![0u8; len as usize];
        self.file
            .read_exact_at(&mut data, pos + LEN_WIDTH as u64)
            .map_err(|e| self.short_read(e, pos, "payload"))?;
        Ok(data)
    }

    /// Raw positional read over the flushed file, used for full log streaming.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<usize> {
        self.file.read_at(buf, off)
    }

    pub fn size(&self) -> u64 {
        self.writer.lock().size
    }

    pub fn flush(&self) -> LogResult<()> {
        self.writer.lock().buf.flush()?;
        Ok(())
    }

    pub fn sync(&self) -> LogResult<()> {
        let mut writer = self.writer.lock();
        writer.buf.flush()?;
        writer.buf.get_ref().sync_data()?;
        Ok(())
    }

    /// Cuts the store back to `pos`; everything at or after it is discarded.
    pub fn truncate(&self, pos: u64) -> LogResult<()> {
        let mut writer = self.writer.lock();
        writer.buf.flush()?;
        writer.buf.get_ref().set_len(pos)?;
        writer.size = pos;
        Ok(())
    }

    pub fn close(&self) -> LogResult<()> {
        self.sync().map_err(|e| {
            warn!("Failed to sync store {}: {}", self.path.display(), e);
            e
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn short_read(&self, err: io::Error, pos: u64, what: &str) -> LogError {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            LogError::Corruption(format!(
                "truncated {} at {} in {}",
                what,
                pos,
                self.path.display()
            ))
        } else {
            err.into()
        }
    }
}
