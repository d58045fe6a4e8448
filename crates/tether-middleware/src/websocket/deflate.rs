//! permessage-deflate (RFC7692) on top of the basic frame streams.
//!
//! Outgoing data messages are compressed whole with a raw DEFLATE stream,
//! flushed with `Z_SYNC_FLUSH` and stripped of the trailing `00 00 ff ff`.
//! Messages that do not shrink go out uncompressed. Incoming compressed
//! messages are inflated and re-split into frames of at most
//! [`INFLATE_CHUNK_SIZE`] bytes.

use async_trait::async_trait;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tether_types::{Result, TetherError};

use super::extension::DeflateParameters;
use super::frame::{OpCode, WebSocketFrame};
use super::stream::{FrameReader, FrameWriter};

pub const INFLATE_CHUNK_SIZE: usize = 4096;
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
// zlib refuses an 8-bit window for raw deflate streams.
const MIN_ZLIB_WINDOW_BITS: u8 = 9;
const MAX_WINDOW_BITS: u8 = 15;

fn zlib_error(e: impl std::fmt::Display) -> TetherError {
    TetherError::Protocol(format!("permessage-deflate: {e}"))
}

pub struct Deflater {
    compress: Compress,
    no_context_takeover: bool,
}

impl Deflater {
    pub fn new(window_bits: u8, no_context_takeover: bool) -> Self {
        let bits = window_bits.clamp(MIN_ZLIB_WINDOW_BITS, MAX_WINDOW_BITS);
        Self {
            compress: Compress::new_with_window_bits(Compression::default(), false, bits),
            no_context_takeover,
        }
    }

    pub fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let mut input = data;
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(INFLATE_CHUNK_SIZE);
            }
            let before = self.compress.total_in();
            self.compress
                .compress_vec(input, &mut out, FlushCompress::Sync)
                .map_err(zlib_error)?;
            let consumed = (self.compress.total_in() - before) as usize;
            input = &input[consumed..];
            if input.is_empty() && out.len() < out.capacity() {
                break;
            }
        }
        if out.ends_with(&DEFLATE_TAIL) {
            out.truncate(out.len() - DEFLATE_TAIL.len());
        }
        if self.no_context_takeover {
            self.compress.reset();
        }
        Ok(out)
    }
}

pub struct Inflater {
    decompress: Decompress,
    no_context_takeover: bool,
    max_message_size: usize,
}

impl Inflater {
    pub fn new(no_context_takeover: bool, max_message_size: usize) -> Self {
        Self {
            // The largest window inflates anything a peer may send.
            decompress: Decompress::new_with_window_bits(false, MAX_WINDOW_BITS),
            no_context_takeover,
            max_message_size,
        }
    }

    pub fn inflate(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut input = Vec::with_capacity(data.len() + DEFLATE_TAIL.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&DEFLATE_TAIL);

        let mut out = Vec::with_capacity(data.len() * 2 + 64);
        let mut remaining = &input[..];
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(INFLATE_CHUNK_SIZE);
            }
            let before = self.decompress.total_in();
            let status = self
                .decompress
                .decompress_vec(remaining, &mut out, FlushDecompress::Sync)
                .map_err(zlib_error)?;
            let consumed = (self.decompress.total_in() - before) as usize;
            remaining = &remaining[consumed..];
            if out.len() > self.max_message_size {
                return Err(TetherError::Protocol(format!(
                    "inflated message exceeds {} bytes",
                    self.max_message_size
                )));
            }
            if status == Status::StreamEnd || (remaining.is_empty() && out.len() < out.capacity()) {
                break;
            }
        }
        if self.no_context_takeover {
            self.decompress.reset(false);
        }
        Ok(out)
    }
}

/// Writer half that compresses complete data messages.
pub struct DeflateFrameWriter {
    inner: Box<dyn FrameWriter>,
    deflater: Deflater,
    pending: Vec<WebSocketFrame>,
}

impl DeflateFrameWriter {
    pub fn new(inner: Box<dyn FrameWriter>, params: &DeflateParameters) -> Self {
        Self {
            inner,
            deflater: Deflater::new(params.server_max_window_bits, params.server_no_context_takeover),
            pending: Vec::new(),
        }
    }

    fn finish_message(&mut self, out: &mut Vec<WebSocketFrame>) -> Result<()> {
        let frames = std::mem::take(&mut self.pending);
        let Some(first) = frames.first() else {
            return Ok(());
        };
        let opcode = first.opcode();
        let original_len: usize = frames.iter().map(|f| f.payload.len()).sum();
        let mut message = Vec::with_capacity(original_len);
        for frame in &frames {
            message.extend_from_slice(&frame.payload);
        }
        let compressed = self.deflater.compress(&message)?;
        if compressed.len() >= original_len {
            out.extend(frames);
            return Ok(());
        }
        let mut frame = WebSocketFrame::new(opcode, true, compressed);
        frame.header.rsv1 = true;
        out.push(frame);
        Ok(())
    }
}

#[async_trait]
impl FrameWriter for DeflateFrameWriter {
    async fn write_frames(&mut self, frames: Vec<WebSocketFrame>) -> Result<()> {
        let mut out = Vec::with_capacity(frames.len());
        for frame in frames {
            if frame.opcode().is_control() {
                out.push(frame);
                continue;
            }
            let fin = frame.is_final();
            self.pending.push(frame);
            if fin {
                self.finish_message(&mut out)?;
            }
        }
        if out.is_empty() {
            return Ok(());
        }
        self.inner.write_frames(out).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

struct CompressedMessage {
    opcode: OpCode,
    payload: Vec<u8>,
}

/// Reader half that inflates RSV1 messages.
pub struct DeflateFrameReader {
    inner: Box<dyn FrameReader>,
    inflater: Inflater,
    current: Option<CompressedMessage>,
    in_uncompressed_message: bool,
}

impl DeflateFrameReader {
    pub fn new(inner: Box<dyn FrameReader>, params: &DeflateParameters, max_message_size: usize) -> Self {
        Self {
            inner,
            inflater: Inflater::new(params.client_no_context_takeover, max_message_size),
            current: None,
            in_uncompressed_message: false,
        }
    }

    fn handle_frame(&mut self, mut frame: WebSocketFrame, out: &mut Vec<WebSocketFrame>) -> Result<()> {
        let opcode = frame.opcode();
        if opcode.is_control() {
            if frame.header.rsv1 {
                return Err(TetherError::Protocol("RSV1 set on a control frame".into()));
            }
            out.push(frame);
            return Ok(());
        }

        match opcode {
            OpCode::Text | OpCode::Binary => {
                if self.current.is_some() || self.in_uncompressed_message {
                    return Err(TetherError::Protocol(
                        "new data frame while a fragmented message is in progress".into(),
                    ));
                }
                if frame.header.rsv1 {
                    self.current = Some(CompressedMessage {
                        opcode,
                        payload: std::mem::take(&mut frame.payload),
                    });
                } else {
                    self.in_uncompressed_message = !frame.is_final();
                    out.push(frame);
                    return Ok(());
                }
            }
            OpCode::Continuation => {
                if frame.header.rsv1 {
                    return Err(TetherError::Protocol("RSV1 set on a continuation frame".into()));
                }
                match self.current.as_mut() {
                    Some(message) => message.payload.extend_from_slice(&frame.payload),
                    None => {
                        self.in_uncompressed_message = !frame.is_final();
                        out.push(frame);
                        return Ok(());
                    }
                }
            }
            // Unknown opcodes are left for the channel to reject.
            _ => {
                out.push(frame);
                return Ok(());
            }
        }

        if frame.is_final() {
            if let Some(message) = self.current.take() {
                let inflated = self.inflater.inflate(&message.payload)?;
                split_into_frames(message.opcode, inflated, out);
            }
        }
        Ok(())
    }
}

fn split_into_frames(opcode: OpCode, data: Vec<u8>, out: &mut Vec<WebSocketFrame>) {
    if data.len() <= INFLATE_CHUNK_SIZE {
        out.push(WebSocketFrame::new(opcode, true, data));
        return;
    }
    let chunks: Vec<&[u8]> = data.chunks(INFLATE_CHUNK_SIZE).collect();
    let last = chunks.len() - 1;
    for (i, chunk) in chunks.into_iter().enumerate() {
        let frame_opcode = if i == 0 { opcode } else { OpCode::Continuation };
        out.push(WebSocketFrame::new(frame_opcode, i == last, chunk.to_vec()));
    }
}

#[async_trait]
impl FrameReader for DeflateFrameReader {
    async fn read_frames(&mut self) -> Result<Vec<WebSocketFrame>> {
        loop {
            let frames = self.inner.read_frames().await?;
            let mut out = Vec::with_capacity(frames.len());
            for frame in frames {
                self.handle_frame(frame, &mut out)?;
            }
            if !out.is_empty() {
                return Ok(out);
            }
        }
    }
}
