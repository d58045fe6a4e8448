//! Channel byte buffers.
//!
//! A [`ChannelBuffer`] is owned by exactly one channel for one in-flight
//! operation. It is either preallocated with a fixed capacity and reused
//! across operations, or marked dynamic and grown on demand through
//! [`ChannelBuffer::set_enough_capacity_if_dynamic`], which is the only place
//! a buffer ever grows.
//!
//! [`SendBuffer`] additionally remembers which framing its staged bytes were
//! written with so the same staged message can be handed to several channels
//! without being serialized again.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tracing::warn;

/// Capacity used when a buffer is touched before anyone sized it.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Largest size a dynamic buffer grows to unless configured otherwise.
pub const DEFAULT_MAX_DYNAMIC_CAPACITY: usize = 64 << 20;

#[derive(Debug, Default)]
pub struct ChannelBuffer {
    bytes: Vec<u8>,
    capacity: usize,
    offset: usize,
    is_dynamic: bool,
    max_dynamic_capacity: Option<usize>,
}

impl ChannelBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut buffer = Self::default();
        buffer.set_capacity(capacity);
        buffer
    }

    /// Resize to exactly `capacity` bytes. Allocation is deferred until the
    /// bytes are first accessed.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        if self.bytes.len() > capacity {
            self.bytes.truncate(capacity);
            self.bytes.shrink_to_fit();
        }
        if self.offset > capacity {
            self.offset = capacity;
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_offset(&mut self, offset: usize) {
        debug_assert!(offset <= self.capacity);
        self.offset = offset.min(self.capacity);
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.offset
    }

    pub fn enable_dynamic_buffer(&mut self) {
        self.is_dynamic = true;
    }

    pub fn is_dynamic(&self) -> bool {
        self.is_dynamic
    }

    /// Upper bound for dynamic growth.
    pub fn set_max_dynamic_capacity(&mut self, max: usize) {
        self.max_dynamic_capacity = Some(max);
    }

    pub fn max_dynamic_capacity(&self) -> usize {
        self.max_dynamic_capacity.unwrap_or(DEFAULT_MAX_DYNAMIC_CAPACITY)
    }

    /// Rewind to the start of the buffer.
    pub fn reset(&mut self) {
        if self.capacity == 0 && !self.is_dynamic {
            warn!(
                capacity = DEFAULT_BUFFER_CAPACITY,
                "channel buffer was never sized, falling back to default capacity"
            );
            self.set_capacity(DEFAULT_BUFFER_CAPACITY);
        }
        self.offset = 0;
    }

    /// Make sure at least `size` bytes fit.
    ///
    /// Returns `true` when the buffer is already big enough or was grown
    /// to exactly `size` because it is dynamic; `false` when it is fixed and
    /// too small, or when `size` exceeds the dynamic limit.
    pub fn set_enough_capacity_if_dynamic(&mut self, size: usize) -> bool {
        if self.capacity >= size {
            return true;
        }
        if self.is_dynamic && size <= self.max_dynamic_capacity() {
            self.set_capacity(size);
            return true;
        }
        false
    }

    /// The whole buffer, from the start, allocating it if needed.
    pub fn start_of_buffer(&mut self) -> &mut [u8] {
        self.ensure_buffer();
        &mut self.bytes[..]
    }

    /// The unused tail, starting at the current offset.
    pub fn remaining(&mut self) -> &mut [u8] {
        self.ensure_buffer();
        let offset = self.offset;
        &mut self.bytes[offset..]
    }

    /// Bytes written so far, `[0, offset)`.
    pub fn filled(&self) -> &[u8] {
        &self.bytes[..self.offset.min(self.bytes.len())]
    }

    fn ensure_buffer(&mut self) {
        if self.capacity == 0 {
            self.reset();
        }
        if self.bytes.len() != self.capacity {
            self.bytes.resize(self.capacity, 0);
        }
    }
}

/// Which framing the staged bytes of a [`SendBuffer`] carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachKind {
    #[default]
    None,
    /// Header followed by content, used by byte-stream and datagram channels.
    General,
    /// Bare content for channels with native message framing.
    WebSocket,
}

#[derive(Debug, Default)]
pub struct SendBuffer {
    buffer: ChannelBuffer,
    attach_kind: AttachKind,
    size: usize,
    frozen: Option<Arc<[u8]>>,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_general(&mut self, size: usize) {
        self.attach(AttachKind::General, size);
    }

    pub fn attach_websocket(&mut self, size: usize) {
        self.attach(AttachKind::WebSocket, size);
    }

    fn attach(&mut self, kind: AttachKind, size: usize) {
        debug_assert!(size <= self.buffer.capacity());
        self.attach_kind = kind;
        self.size = size;
        self.frozen = None;
    }

    pub fn attach_kind(&self) -> AttachKind {
        self.attach_kind
    }

    /// Staged size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether a send with framing `kind` may skip staging. Only the kind is
    /// compared; the caller knows whether the content is the same.
    pub fn can_reuse(&self, kind: AttachKind) -> bool {
        self.attach_kind != AttachKind::None && self.attach_kind == kind
    }

    /// Forget the staged bytes.
    pub fn detach(&mut self) {
        self.attach_kind = AttachKind::None;
        self.size = 0;
        self.frozen = None;
    }

    /// Shared snapshot of the staged bytes, cached until the next attach.
    pub fn freeze(&mut self) -> Arc<[u8]> {
        if let Some(frozen) = &self.frozen {
            return frozen.clone();
        }
        let size = self.size;
        let frozen: Arc<[u8]> = Arc::from(&self.buffer.start_of_buffer()[..size]);
        self.frozen = Some(frozen.clone());
        frozen
    }
}

impl Deref for SendBuffer {
    type Target = ChannelBuffer;

    fn deref(&self) -> &ChannelBuffer {
        &self.buffer
    }
}

impl DerefMut for SendBuffer {
    fn deref_mut(&mut self) -> &mut ChannelBuffer {
        &mut self.buffer
    }
}
