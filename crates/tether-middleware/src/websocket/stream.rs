//! Frame streams over a byte transport.
//!
//! A connection is split into a reading half and a writing half so that a
//! slow peer on one direction never stalls the other. The basic halves do
//! plain RFC6455 framing; [`super::deflate`] wraps them to add
//! permessage-deflate.

use async_trait::async_trait;
use tether_types::{Result, TetherError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::frame::{WebSocketFrame, WebSocketFrameParser, encode_frames};

/// Size of each socket read.
pub const READ_BUFFER_SIZE: usize = 4096;

#[async_trait]
pub trait FrameReader: Send {
    /// Wait for at least one complete frame.
    ///
    /// A clean end of stream is reported as a connection-closed network
    /// error, never as an empty batch.
    async fn read_frames(&mut self) -> Result<Vec<WebSocketFrame>>;
}

#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frames(&mut self, frames: Vec<WebSocketFrame>) -> Result<()>;

    /// Flush and shut the write direction down.
    async fn close(&mut self) -> Result<()>;
}

pub struct BasicFrameReader<R> {
    inner: R,
    parser: WebSocketFrameParser,
    read_buffer: Box<[u8]>,
    prefix: Vec<u8>,
}

impl<R> BasicFrameReader<R> {
    pub fn new(inner: R, max_payload: usize) -> Self {
        Self {
            inner,
            parser: WebSocketFrameParser::new(max_payload),
            read_buffer: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            prefix: Vec::new(),
        }
    }

    /// Start with bytes the handshake already pulled off the socket.
    pub fn with_prefix(inner: R, max_payload: usize, prefix: Vec<u8>) -> Self {
        let mut reader = Self::new(inner, max_payload);
        reader.prefix = prefix;
        reader
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameReader for BasicFrameReader<R> {
    async fn read_frames(&mut self) -> Result<Vec<WebSocketFrame>> {
        if !self.prefix.is_empty() {
            let prefix = std::mem::take(&mut self.prefix);
            let frames = self.parser.decode(&prefix)?;
            if !frames.is_empty() {
                return Ok(frames);
            }
        }
        loop {
            let n = self.inner.read(&mut self.read_buffer).await?;
            if n == 0 {
                return Err(TetherError::connection_closed());
            }
            let frames = self.parser.decode(&self.read_buffer[..n])?;
            if !frames.is_empty() {
                return Ok(frames);
            }
        }
    }
}

pub struct BasicFrameWriter<W> {
    inner: W,
}

impl<W> BasicFrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWriter for BasicFrameWriter<W> {
    async fn write_frames(&mut self, frames: Vec<WebSocketFrame>) -> Result<()> {
        let bytes = encode_frames(&frames);
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
