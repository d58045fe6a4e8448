//! RFC6455 frame representation, incremental parser and serializer.

use tether_types::{Result, TetherError};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_FRAME_PAYLOAD: usize = 125;

const FIN_BIT: u8 = 0x80;
const RSV1_BIT: u8 = 0x40;
const RSV2_BIT: u8 = 0x20;
const RSV3_BIT: u8 = 0x10;
const OPCODE_MASK: u8 = 0x0f;
const MASK_BIT: u8 = 0x80;
const PAYLOAD_LENGTH_MASK: u8 = 0x7f;
const PAYLOAD_LENGTH_16: u8 = 126;
const PAYLOAD_LENGTH_64: u8 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Any opcode RFC6455 leaves unassigned.
    Reserved(u8),
}

impl OpCode {
    pub fn from_u8(value: u8) -> Self {
        match value & OPCODE_MASK {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xa => OpCode::Pong,
            other => OpCode::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xa,
            OpCode::Reserved(v) => v & OPCODE_MASK,
        }
    }

    pub fn is_control(self) -> bool {
        self.as_u8() & 0x8 != 0
    }

    pub fn is_known_data(self) -> bool {
        matches!(self, OpCode::Continuation | OpCode::Text | OpCode::Binary)
    }

    pub fn is_known_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Human readable family name used in failure messages.
    pub fn frame_type_name(self) -> &'static str {
        match self {
            OpCode::Continuation | OpCode::Text | OpCode::Binary => "Data frame",
            OpCode::Ping => "Ping",
            OpCode::Pong => "Pong",
            OpCode::Close => "Close",
            OpCode::Reserved(_) => "Unknown frame type",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebSocketFrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    pub masked: bool,
    pub masking_key: [u8; 4],
    pub payload_length: u64,
}

impl WebSocketFrameHeader {
    pub fn new(opcode: OpCode) -> Self {
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            masked: false,
            masking_key: [0; 4],
            payload_length: 0,
        }
    }

    pub fn has_reserved_bits(&self) -> bool {
        self.rsv1 || self.rsv2 || self.rsv3
    }

    /// Bytes the serialized header occupies.
    pub fn encoded_len(&self) -> usize {
        let length_bytes = match self.payload_length {
            0..=125 => 0,
            126..=0xffff => 2,
            _ => 8,
        };
        2 + length_bytes + if self.masked { 4 } else { 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketFrame {
    pub header: WebSocketFrameHeader,
    pub payload: Vec<u8>,
}

impl WebSocketFrame {
    pub fn new(opcode: OpCode, fin: bool, payload: Vec<u8>) -> Self {
        let mut header = WebSocketFrameHeader::new(opcode);
        header.fin = fin;
        header.payload_length = payload.len() as u64;
        Self { header, payload }
    }

    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    pub fn is_final(&self) -> bool {
        self.header.fin
    }

    /// Mark this frame as masked with `key` (client role).
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.header.masked = true;
        self.header.masking_key = key;
        self
    }

    /// Append the wire encoding of this frame to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let header = &self.header;
        let len = self.payload.len() as u64;
        out.reserve(header.encoded_len() + self.payload.len());

        let mut b0 = header.opcode.as_u8();
        if header.fin {
            b0 |= FIN_BIT;
        }
        if header.rsv1 {
            b0 |= RSV1_BIT;
        }
        if header.rsv2 {
            b0 |= RSV2_BIT;
        }
        if header.rsv3 {
            b0 |= RSV3_BIT;
        }
        out.push(b0);

        let mask = if header.masked { MASK_BIT } else { 0 };
        match len {
            0..=125 => out.push(mask | len as u8),
            126..=0xffff => {
                out.push(mask | PAYLOAD_LENGTH_16);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
            _ => {
                out.push(mask | PAYLOAD_LENGTH_64);
                out.extend_from_slice(&len.to_be_bytes());
            }
        }

        if header.masked {
            out.extend_from_slice(&header.masking_key);
            let start = out.len();
            out.extend_from_slice(&self.payload);
            apply_mask(header.masking_key, 0, &mut out[start..]);
        } else {
            out.extend_from_slice(&self.payload);
        }
    }
}

/// XOR `data` with `key`, starting `offset` bytes into the key stream.
pub fn apply_mask(key: [u8; 4], offset: usize, data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[(offset + i) % 4];
    }
}

/// Serialize a batch of frames into one contiguous buffer.
pub fn encode_frames(frames: &[WebSocketFrame]) -> Vec<u8> {
    let total: usize = frames
        .iter()
        .map(|f| f.header.encoded_len() + f.payload.len())
        .sum();
    let mut out = Vec::with_capacity(total);
    for frame in frames {
        frame.write_to(&mut out);
    }
    out
}

/// Incremental frame parser.
///
/// Bytes are fed as they arrive; complete frames come out unmasked. Partial
/// frames stay buffered across calls.
#[derive(Debug)]
pub struct WebSocketFrameParser {
    buffer: Vec<u8>,
    max_payload: u64,
}

impl WebSocketFrameParser {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_payload: max_payload as u64,
        }
    }

    /// Bytes buffered but not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<WebSocketFrame>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut consumed = 0;
        while let Some((frame, used)) = self.parse_one(&self.buffer[consumed..])? {
            frames.push(frame);
            consumed += used;
        }
        self.buffer.drain(..consumed);
        Ok(frames)
    }

    fn parse_one(&self, data: &[u8]) -> Result<Option<(WebSocketFrame, usize)>> {
        if data.len() < 2 {
            return Ok(None);
        }
        let b0 = data[0];
        let b1 = data[1];
        let mut header = WebSocketFrameHeader::new(OpCode::from_u8(b0));
        header.fin = b0 & FIN_BIT != 0;
        header.rsv1 = b0 & RSV1_BIT != 0;
        header.rsv2 = b0 & RSV2_BIT != 0;
        header.rsv3 = b0 & RSV3_BIT != 0;
        header.masked = b1 & MASK_BIT != 0;

        let mut cursor = 2;
        let length = match b1 & PAYLOAD_LENGTH_MASK {
            PAYLOAD_LENGTH_16 => {
                if data.len() < cursor + 2 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([data[2], data[3]]) as u64;
                cursor += 2;
                if len <= 125 {
                    return Err(TetherError::Protocol("non-minimal 16-bit payload length".into()));
                }
                len
            }
            PAYLOAD_LENGTH_64 => {
                if data.len() < cursor + 8 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&data[2..10]);
                let len = u64::from_be_bytes(raw);
                cursor += 8;
                if len >> 63 != 0 {
                    return Err(TetherError::Protocol("most significant length bit set".into()));
                }
                if len <= 0xffff {
                    return Err(TetherError::Protocol("non-minimal 64-bit payload length".into()));
                }
                len
            }
            short => short as u64,
        };
        header.payload_length = length;

        if header.opcode.is_control() {
            if !header.fin {
                return Err(TetherError::Protocol("fragmented control frame".into()));
            }
            if length > MAX_CONTROL_FRAME_PAYLOAD as u64 {
                return Err(TetherError::Protocol(format!(
                    "control frame payload of {length} bytes exceeds {MAX_CONTROL_FRAME_PAYLOAD}"
                )));
            }
        }
        if length > self.max_payload {
            return Err(TetherError::Protocol(format!(
                "frame payload of {length} bytes exceeds limit of {}",
                self.max_payload
            )));
        }

        if header.masked {
            if data.len() < cursor + 4 {
                return Ok(None);
            }
            header.masking_key.copy_from_slice(&data[cursor..cursor + 4]);
            cursor += 4;
        }

        let length = length as usize;
        if data.len() < cursor + length {
            return Ok(None);
        }
        let mut payload = data[cursor..cursor + length].to_vec();
        if header.masked {
            apply_mask(header.masking_key, 0, &mut payload);
        }
        Ok(Some((WebSocketFrame { header, payload }, cursor + length)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: WebSocketFrame) -> WebSocketFrame {
        let mut bytes = Vec::new();
        frame.write_to(&mut bytes);
        let mut parser = WebSocketFrameParser::new(1 << 20);
        let mut frames = parser.decode(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(parser.pending(), 0);
        frames.remove(0)
    }

    #[test]
    fn length_encodings() {
        for len in [0usize, 125, 126, 0xffff, 0x10000] {
            let frame = WebSocketFrame::new(OpCode::Binary, true, vec![7u8; len]);
            assert_eq!(roundtrip(frame).payload.len(), len);
        }
    }

    #[test]
    fn masked_frames_are_unmasked() {
        let frame = WebSocketFrame::new(OpCode::Text, true, b"Hello".to_vec()).with_mask([0x37, 0xfa, 0x21, 0x3d]);
        let mut bytes = Vec::new();
        frame.write_to(&mut bytes);
        // RFC6455 5.7 single-frame masked text example.
        assert_eq!(bytes, vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]);
        let parsed = roundtrip(frame);
        assert_eq!(parsed.payload, b"Hello");
        assert!(parsed.header.masked);
    }

    #[test]
    fn partial_input_is_buffered() {
        let frame = WebSocketFrame::new(OpCode::Binary, true, vec![1, 2, 3, 4]);
        let mut bytes = Vec::new();
        frame.write_to(&mut bytes);
        let mut parser = WebSocketFrameParser::new(1024);
        assert!(parser.decode(&bytes[..3]).unwrap().is_empty());
        let frames = parser.decode(&bytes[3..]).unwrap();
        assert_eq!(frames[0].payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn several_frames_in_one_read() {
        let frames = vec![
            WebSocketFrame::new(OpCode::Text, false, b"ab".to_vec()),
            WebSocketFrame::new(OpCode::Continuation, true, b"cd".to_vec()),
            WebSocketFrame::new(OpCode::Ping, true, Vec::new()),
        ];
        let bytes = encode_frames(&frames);
        let mut parser = WebSocketFrameParser::new(1024);
        assert_eq!(parser.decode(&bytes).unwrap(), frames);
    }

    #[test]
    fn rejects_oversized_and_fragmented_control_frames() {
        let mut parser = WebSocketFrameParser::new(1024);
        let big_ping = [0x89, 126, 0x00, 0x80];
        assert!(matches!(parser.decode(&big_ping), Err(TetherError::Protocol(_))));

        let mut parser = WebSocketFrameParser::new(1024);
        let fragmented_close = [0x08, 0x00];
        assert!(parser.decode(&fragmented_close).is_err());
    }

    #[test]
    fn rejects_non_minimal_length_and_too_big() {
        let mut parser = WebSocketFrameParser::new(1024);
        assert!(parser.decode(&[0x82, 126, 0x00, 0x05]).is_err());

        let mut parser = WebSocketFrameParser::new(100);
        assert!(parser.decode(&[0x82, 126, 0x01, 0x00]).is_err());
    }

    #[test]
    fn reserved_bits_and_opcodes_survive_parsing() {
        let mut parser = WebSocketFrameParser::new(1024);
        let frames = parser.decode(&[0xc3, 0x00]).unwrap();
        assert!(frames[0].header.rsv1);
        assert_eq!(frames[0].opcode(), OpCode::Reserved(3));
    }
}
