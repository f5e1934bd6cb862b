//! Length-prefixed framing shared by the client protocol and consensus RPCs.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes.
//! Frames are capped at [`MAX_FRAME_SIZE`], so the first byte of any frame is
//! always zero and can never be mistaken for a stream tag by the mux.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::error::{TransportError, TransportResult};

/// Largest accepted frame: 8 MiB.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

pub struct FrameReader<R: AsyncRead + Unpin> {
    reader: BufReader<R>,
    max_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_bytes(reader, MAX_FRAME_SIZE)
    }

    pub fn with_max_bytes(reader: R, max_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_bytes,
        }
    }

    /// Reads the next frame; `None` means the peer closed the stream between
    /// frames.
    pub async fn read_frame(&mut self) -> TransportResult<Option<Vec<u8>>> {
        let len = match self.reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len > self.max_bytes {
            return Err(TransportError::FrameTooLarge {
                size: len,
                limit: self.max_bytes,
            });
        }

        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }

    pub async fn read_bincode<T: DeserializeOwned>(&mut self) -> TransportResult<Option<T>> {
        match self.read_frame().await? {
            Some(frame) => Ok(Some(bincode::deserialize(&frame)?)),
            None => Ok(None),
        }
    }

    pub async fn read_json<T: DeserializeOwned>(&mut self) -> TransportResult<Option<T>> {
        match self.read_frame().await? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

pub struct FrameWriter<W: AsyncWrite + Unpin> {
    writer: BufWriter<W>,
    max_bytes: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            max_bytes: MAX_FRAME_SIZE,
        }
    }

    pub async fn write_frame(&mut self, data: &[u8]) -> TransportResult<()> {
        if data.len() > self.max_bytes {
            return Err(TransportError::FrameTooLarge {
                size: data.len(),
                limit: self.max_bytes,
            });
        }
        self.writer.write_u32(data.len() as u32).await?;
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn write_bincode<T: Serialize>(&mut self, value: &T) -> TransportResult<()> {
        let data = bincode::serialize(value)?;
        self.write_frame(&data).await
    }

    pub async fn write_json<T: Serialize>(&mut self, value: &T) -> TransportResult<()> {
        let data = serde_json::to_vec(value)?;
        self.write_frame(&data).await
    }

    pub async fn shutdown(&mut self) -> TransportResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
