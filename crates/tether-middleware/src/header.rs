//! Fixed-size message header prepended to every payload on channels
//! without native message framing.
//!
//! Layout (little endian): `magic: u32` then `payload_size: u32`.

use tether_types::MessageIoError;

pub const HEADER_SIZE: usize = 8;
const MAGIC: u32 = 0x5445_5448;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    size: u32,
}

impl Header {
    pub fn new(size: usize) -> Result<Self, MessageIoError> {
        let size = u32::try_from(size)
            .map_err(|_| MessageIoError::InvalidHeader(format!("payload of {size} bytes is too large")))?;
        Ok(Self { size })
    }

    /// Payload size announced by this header.
    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub const fn header_size() -> usize {
        HEADER_SIZE
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4..].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, MessageIoError> {
        if bytes.len() < HEADER_SIZE {
            return Err(MessageIoError::InvalidHeader(format!(
                "expected {HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != MAGIC {
            return Err(MessageIoError::InvalidHeader(format!("bad magic {magic:#010x}")));
        }
        let size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self { size })
    }

    /// Write header and `content` into the front of `buffer`, returning the
    /// number of bytes used.
    pub fn attach_header_internally(content: &[u8], buffer: &mut [u8]) -> Result<usize, MessageIoError> {
        let total = HEADER_SIZE + content.len();
        if buffer.len() < total {
            return Err(MessageIoError::NotEnoughBuffer {
                needed: total,
                capacity: buffer.len(),
            });
        }
        let header = Header::new(content.len())?;
        buffer[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        buffer[HEADER_SIZE..total].copy_from_slice(content);
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_then_parse() {
        let mut buffer = [0u8; 32];
        let used = Header::attach_header_internally(b"hello", &mut buffer).unwrap();
        assert_eq!(used, HEADER_SIZE + 5);
        let header = Header::parse(&buffer).unwrap();
        assert_eq!(header.size(), 5);
        assert_eq!(&buffer[HEADER_SIZE..used], b"hello");
    }

    #[test]
    fn rejects_bad_magic_and_short_input() {
        assert!(matches!(Header::parse(&[0u8; 8]), Err(MessageIoError::InvalidHeader(_))));
        assert!(matches!(Header::parse(&[0u8; 3]), Err(MessageIoError::InvalidHeader(_))));
    }

    #[test]
    fn too_small_buffer_is_reported() {
        let mut buffer = [0u8; 10];
        let err = Header::attach_header_internally(b"abc", &mut buffer).unwrap_err();
        assert_eq!(err, MessageIoError::NotEnoughBuffer { needed: 11, capacity: 10 });
    }
}
