//! Shared-memory transport.
//!
//! The publisher maps a file of `shm_size` bytes holding a single
//! sequence-locked slot:
//!
//! ```text
//! offset 0   seq: u64   odd while a write is in progress
//! offset 8   len: u32   bytes in data
//! offset 16  data       Header || content
//! ```
//!
//! Subscribers poll the sequence once per period and copy the slot when an
//! even, unseen sequence appears. A sequence change during the copy means
//! the read was torn and is retried. The slot holds only the latest
//! message, so a slow subscriber skips intermediate ones.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering, fence};
use std::time::Duration;

use async_trait::async_trait;
use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::Mutex;
use tether_types::{ChannelAddress, ChannelDef, ChannelType, MessageIoError, Result, TetherError};
use tracing::{debug, trace};
use uuid::Uuid;

use super::{ClientChannel, SendCallback, ServerChannel, spawn_send, stage};
use crate::buffer::{AttachKind, ChannelBuffer, SendBuffer};
use crate::header::{HEADER_SIZE, Header};
use crate::settings::ChannelSettings;

const SEQ_OFFSET: usize = 0;
const LEN_OFFSET: usize = 8;
const DATA_OFFSET: usize = 16;
const TORN_READ_RETRIES: usize = 8;

// SAFETY (all helpers below): `base` points at a live mapping of at least
// DATA_OFFSET bytes; mappings are page aligned, so both atomics are aligned.
unsafe fn seq_cell<'a>(base: *const u8) -> &'a AtomicU64 {
    unsafe { &*(base.add(SEQ_OFFSET) as *const AtomicU64) }
}

unsafe fn len_cell<'a>(base: *const u8) -> &'a AtomicU32 {
    unsafe { &*(base.add(LEN_OFFSET) as *const AtomicU32) }
}

struct SlotWriter {
    mmap: MmapMut,
}

impl SlotWriter {
    fn capacity(&self) -> usize {
        self.mmap.len() - DATA_OFFSET
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.capacity() {
            return Err(TetherError::ResourceExhausted(format!(
                "message of {} bytes exceeds shared region of {} bytes",
                data.len(),
                self.capacity()
            )));
        }
        let base = self.mmap.as_mut_ptr();
        // SAFETY: the region is large enough (checked above) and this
        // process is the only writer; readers validate via the sequence.
        unsafe {
            let seq = seq_cell(base);
            let current = seq.load(Ordering::Relaxed);
            seq.store(current.wrapping_add(1), Ordering::Relaxed);
            fence(Ordering::Release);
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(DATA_OFFSET), data.len());
            len_cell(base).store(data.len() as u32, Ordering::Relaxed);
            seq.store(current.wrapping_add(2), Ordering::Release);
        }
        Ok(())
    }
}

pub struct ShmServerChannel {
    def: ChannelDef,
    path: PathBuf,
    slot: Mutex<SlotWriter>,
    sending: Arc<AtomicBool>,
    _file: File,
}

impl ShmServerChannel {
    /// Create and map the backing file.
    pub fn allocate(settings: &ChannelSettings) -> Result<Self> {
        let size = settings.shm.shm_size;
        if size <= DATA_OFFSET + HEADER_SIZE {
            return Err(TetherError::InvalidArgument(format!("shm_size {size} is too small")));
        }
        let path = settings.shm.dir.join(format!("tether-{}.shm", Uuid::new_v4().simple()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| TetherError::from(e).context(&format!("create {}", path.display())))?;
        file.set_len(size as u64)?;
        // SAFETY: the file was just created by us with the mapped length.
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        debug!(path = %path.display(), size, "shm channel allocated");
        Ok(Self {
            def: ChannelDef::new(
                ChannelType::Shm,
                ChannelAddress::SharedMemory {
                    path: path.clone(),
                    size,
                },
            ),
            path,
            slot: Mutex::new(SlotWriter { mmap }),
            sending: Arc::new(AtomicBool::new(false)),
            _file: file,
        })
    }
}

impl Drop for ShmServerChannel {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[async_trait]
impl ServerChannel for ShmServerChannel {
    fn channel_def(&self) -> &ChannelDef {
        &self.def
    }

    fn attach_kind(&self) -> AttachKind {
        AttachKind::General
    }

    fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    /// Readers are anonymous; the slot is always writable.
    fn has_receivers(&self) -> bool {
        true
    }

    fn send_message(
        &self,
        buffer: &mut SendBuffer,
        content: &[u8],
        reuse: bool,
        callback: Option<SendCallback>,
    ) -> Result<()> {
        let data = stage(buffer, AttachKind::General, content, reuse)?;
        let result = self.slot.lock().write(&data);
        spawn_send(self.def.clone(), self.sending.clone(), async move { result }, callback);
        Ok(())
    }

    async fn close(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        debug!(channel = %self.def, "shm channel closed");
    }
}

pub struct ShmClientChannel {
    mmap: Mmap,
    buffer: ChannelBuffer,
    period: Duration,
    last_seq: u64,
}

impl ShmClientChannel {
    pub fn open(def: &ChannelDef, buffer: ChannelBuffer, period: Duration) -> Result<Self> {
        let ChannelAddress::SharedMemory { path, size } = &def.address else {
            return Err(TetherError::InvalidArgument(format!("{def} is not a shared memory region")));
        };
        let file = File::open(path).map_err(|e| TetherError::from(e).context(&format!("open {}", path.display())))?;
        let actual = file.metadata()?.len() as usize;
        if actual < *size || *size <= DATA_OFFSET {
            return Err(TetherError::InvalidArgument(format!(
                "{} is {actual} bytes, expected {size}",
                path.display()
            )));
        }
        // SAFETY: the mapping is only read; torn reads are detected by the
        // sequence check.
        let mmap = unsafe { MmapOptions::new().len(*size).map(&file)? };
        Ok(Self {
            mmap,
            buffer,
            period,
            last_seq: 0,
        })
    }

    /// Copy a new slot value into the buffer, returning its length.
    fn try_read(&mut self) -> Result<Option<usize>> {
        let base = self.mmap.as_ptr();
        let capacity = self.mmap.len() - DATA_OFFSET;
        for _ in 0..TORN_READ_RETRIES {
            // SAFETY: see `seq_cell`.
            let seq = unsafe { seq_cell(base) };
            let before = seq.load(Ordering::Acquire);
            if before == self.last_seq {
                return Ok(None);
            }
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let len = unsafe { len_cell(base) }.load(Ordering::Relaxed) as usize;
            if len > capacity {
                continue;
            }
            if !self.buffer.set_enough_capacity_if_dynamic(len) {
                self.last_seq = before;
                return Err(MessageIoError::NotEnoughBuffer {
                    needed: len,
                    capacity: self.buffer.capacity(),
                }
                .into());
            }
            self.buffer.reset();
            let target = self.buffer.start_of_buffer();
            // SAFETY: `len <= capacity` keeps the source inside the mapping
            // and `target` holds at least `len` bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(base.add(DATA_OFFSET), target.as_mut_ptr(), len);
            }
            fence(Ordering::Acquire);
            if seq.load(Ordering::Relaxed) != before {
                trace!("torn shm read, retrying");
                continue;
            }
            self.last_seq = before;
            self.buffer.set_offset(len);
            return Ok(Some(len));
        }
        Ok(None)
    }
}

#[async_trait]
impl ClientChannel for ShmClientChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Shm
    }

    /// A mapping cannot tell whether its writer is still around.
    fn is_connected(&self) -> bool {
        true
    }

    async fn receive_message(&mut self) -> Result<&[u8]> {
        loop {
            if let Some(len) = self.try_read()? {
                let header = Header::parse(&self.buffer.filled()[..len])?;
                let end = HEADER_SIZE + header.size();
                if end > len {
                    return Err(MessageIoError::InvalidHeader(format!(
                        "header announces {} bytes, slot holds {}",
                        header.size(),
                        len - HEADER_SIZE
                    ))
                    .into());
                }
                return Ok(&self.buffer.filled()[HEADER_SIZE..end]);
            }
            tokio::time::sleep(self.period).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    fn settings(dir: &tempfile::TempDir, shm_size: usize) -> Settings {
        let mut settings = Settings::default();
        settings.channel_settings.shm.dir = dir.path().to_path_buf();
        settings.channel_settings.shm.shm_size = shm_size;
        settings
    }

    #[tokio::test]
    async fn latest_value_is_read_once() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let settings = settings(&dir, 256);
        let server = ShmServerChannel::allocate(&settings.channel_settings)?;
        let mut client = ShmClientChannel::open(
            server.channel_def(),
            ChannelBuffer::with_capacity(128),
            Duration::from_millis(5),
        )?;
        assert!(client.try_read()?.is_none());

        let mut buffer = SendBuffer::new();
        buffer.set_capacity(128);
        server.send_message(&mut buffer, b"first", false, None)?;
        server.send_message(&mut buffer, b"second", false, None)?;
        let received = tokio::time::timeout(Duration::from_secs(1), client.receive_message()).await??;
        assert_eq!(received, b"second");
        assert!(client.try_read()?.is_none());
        Ok(())
    }

    #[test]
    fn oversized_message_is_resource_exhausted() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let settings = settings(&dir, 64);
        let server = ShmServerChannel::allocate(&settings.channel_settings)?;
        let err = server.slot.lock().write(&[0u8; 100]).unwrap_err();
        assert!(matches!(err, TetherError::ResourceExhausted(_)));
        Ok(())
    }

    #[test]
    fn backing_file_removed_on_drop() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let settings = settings(&dir, 64);
        let server = ShmServerChannel::allocate(&settings.channel_settings)?;
        let ChannelAddress::SharedMemory { path, .. } = server.channel_def().address.clone() else {
            panic!("expected shared memory address");
        };
        assert!(path.exists());
        drop(server);
        assert!(!path.exists());
        Ok(())
    }
}
