//! Frame transport layer
//!
//! Frames are self-delimiting via the `body_len` field in the 8-byte
//! header, so reading a frame means buffering the header, then buffering
//! the advertised body length.

use crate::error::{MiddlewareError, Result};
use bytes::{Bytes, BytesMut};
use scopes_wire::{Frame, FrameHeader, WireError, DEFAULT_MAX_FRAME_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Transport for reading/writing frames over a byte stream
pub struct FrameTransport<T> {
    inner: T,
    max_frame_size: usize,
    read_buf: BytesMut,
}

impl<T> FrameTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn with_max_frame_size(mut self, max_size: usize) -> Self {
        self.max_frame_size = max_size;
        self
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead + Unpin> FrameTransport<T> {
    /// Read a complete frame (header plus body)
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        while self.read_buf.len() < FrameHeader::SIZE {
            let n = self.inner.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Err(MiddlewareError::ConnectionClosed);
                }
                return Err(MiddlewareError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "incomplete frame header",
                )));
            }
        }

        let header = FrameHeader::peek(&self.read_buf)?;
        let total = FrameHeader::SIZE + header.body_len as usize;
        if total > self.max_frame_size {
            return Err(MiddlewareError::Wire(WireError::FrameTooLarge {
                size: total,
                max: self.max_frame_size,
            }));
        }

        while self.read_buf.len() < total {
            let n = self.inner.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(MiddlewareError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "incomplete frame: expected {} bytes, got {}",
                        total,
                        self.read_buf.len()
                    ),
                )));
            }
        }

        Ok(self.read_buf.split_to(total).freeze())
    }

    /// Read and decode a complete frame
    pub async fn read_frame_decoded(&mut self) -> Result<Frame> {
        let data = self.read_frame().await?;
        Ok(Frame::decode(&data)?)
    }
}

impl<T: AsyncWrite + Unpin> FrameTransport<T> {
    /// Write a complete (already encoded) frame
    pub async fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
