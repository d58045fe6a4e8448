//! Fan-out of one serialized message to many connected peers.
//!
//! A broadcast writes to every live target concurrently and completes once,
//! after every target has reported, with the last failure seen (or `Ok`
//! when every write succeeded). A write that does not finish within the
//! write timeout closes its target.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tether_types::{NetError, Result, TetherError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace};

#[async_trait]
pub trait BroadcastTarget: Send + 'static {
    /// Closed targets are dropped before the next broadcast.
    fn is_closed(&self) -> bool;

    async fn write(&mut self, data: Arc<[u8]>) -> Result<()>;

    async fn close(&mut self);
}

/// Byte-stream peer (TCP or Unix socket). A failed write closes it.
pub struct StreamTarget<W> {
    peer: String,
    writer: W,
    closed: bool,
}

impl<W> StreamTarget<W> {
    pub fn new(peer: impl Into<String>, writer: W) -> Self {
        Self {
            peer: peer.into(),
            writer,
            closed: false,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> BroadcastTarget for StreamTarget<W> {
    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn write(&mut self, data: Arc<[u8]>) -> Result<()> {
        let result = async {
            self.writer.write_all(&data).await?;
            self.writer.flush().await
        }
        .await;
        if let Err(e) = result {
            debug!(peer = %self.peer, error = %e, "dropping peer after failed write");
            self.closed = true;
            return Err(e.into());
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
        let _ = self.writer.shutdown().await;
    }
}

/// Default bound on one target's write before it is closed as stalled.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// One peer. The list lock is only held to clone or prune slots; writes
/// lock the slot itself, so a stalled peer never blocks `add` or the other
/// peers.
struct Slot<T> {
    target: Mutex<T>,
    closed: AtomicBool,
}

impl<T: BroadcastTarget> Slot<T> {
    /// A target busy writing counts as live.
    fn is_live(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.target.try_lock() {
            Ok(target) if target.is_closed() => {
                self.closed.store(true, Ordering::Release);
                false
            }
            _ => true,
        }
    }
}

pub struct Broadcaster<T> {
    slots: Arc<parking_lot::Mutex<Vec<Arc<Slot<T>>>>>,
    write_timeout: Duration,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            write_timeout: self.write_timeout,
        }
    }
}

impl<T: BroadcastTarget> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: BroadcastTarget> Broadcaster<T> {
    pub fn new() -> Self {
        Self::with_write_timeout(DEFAULT_WRITE_TIMEOUT)
    }

    pub fn with_write_timeout(write_timeout: Duration) -> Self {
        Self {
            slots: Arc::new(parking_lot::Mutex::new(Vec::new())),
            write_timeout,
        }
    }

    pub fn add(&self, target: T) {
        self.slots.lock().push(Arc::new(Slot {
            target: Mutex::new(target),
            closed: AtomicBool::new(false),
        }));
    }

    /// Targets not known to be closed. A peer that went away without
    /// closing its target is only noticed by the next write to it.
    pub fn receiver_count(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.is_live()).count()
    }

    pub fn has_receivers(&self) -> bool {
        self.receiver_count() > 0
    }

    pub async fn broadcast(&self, data: Arc<[u8]>) -> Result<()> {
        let slots: Vec<Arc<Slot<T>>> = {
            let mut slots = self.slots.lock();
            slots.retain(|slot| slot.is_live());
            slots.clone()
        };
        if slots.is_empty() {
            return Err(TetherError::network(NetError::SocketNotConnected, "no connected receivers"));
        }

        let to_write_count = slots.len();
        let mut written_count = 0;
        let mut last_result = Ok(());
        let mut writes: FuturesUnordered<_> = slots
            .iter()
            .map(|slot| write_slot(slot, data.clone(), self.write_timeout))
            .collect();
        while let Some(result) = writes.next().await {
            written_count += 1;
            if result.is_err() {
                last_result = result;
            }
        }
        drop(writes);
        trace!(to_write_count, written_count, bytes = data.len(), "broadcast finished");

        self.slots
            .lock()
            .retain(|slot| !slot.closed.load(Ordering::Acquire));
        last_result
    }

    pub async fn close_all(&self) {
        let slots = std::mem::take(&mut *self.slots.lock());
        for slot in slots {
            slot.closed.store(true, Ordering::Release);
            slot.target.lock().await.close().await;
        }
    }
}

async fn write_slot<T: BroadcastTarget>(slot: &Slot<T>, data: Arc<[u8]>, write_timeout: Duration) -> Result<()> {
    let mut target = slot.target.lock().await;
    if target.is_closed() {
        slot.closed.store(true, Ordering::Release);
        return Ok(());
    }
    let result = match tokio::time::timeout(write_timeout, target.write(data)).await {
        Ok(result) => result,
        Err(_) => {
            debug!(timeout_ms = write_timeout.as_millis() as u64, "closing stalled peer");
            target.close().await;
            Err(TetherError::network(NetError::TimedOut, "write to peer timed out"))
        }
    };
    if target.is_closed() {
        slot.closed.store(true, Ordering::Release);
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::io::AsyncReadExt;

    use super::*;

    struct FakeTarget {
        fail: bool,
        delay: Duration,
        closed: bool,
        writes: Arc<AtomicUsize>,
    }

    impl FakeTarget {
        fn new(fail: bool, delay_ms: u64, writes: &Arc<AtomicUsize>) -> Self {
            Self {
                fail,
                delay: Duration::from_millis(delay_ms),
                closed: false,
                writes: writes.clone(),
            }
        }
    }

    #[async_trait]
    impl BroadcastTarget for FakeTarget {
        fn is_closed(&self) -> bool {
            self.closed
        }

        async fn write(&mut self, _data: Arc<[u8]>) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TetherError::connection_reset());
            }
            Ok(())
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    #[tokio::test]
    async fn empty_broadcaster_is_not_connected() {
        let broadcaster: Broadcaster<FakeTarget> = Broadcaster::new();
        let err = broadcaster.broadcast(Arc::from(&b"x"[..])).await.unwrap_err();
        assert_eq!(err.net_kind(), Some(NetError::SocketNotConnected));
    }

    #[tokio::test]
    async fn aggregate_failure_reported_once_after_all_writes() {
        let writes = Arc::new(AtomicUsize::new(0));
        let broadcaster = Broadcaster::new();
        broadcaster.add(FakeTarget::new(false, 5, &writes));
        broadcaster.add(FakeTarget::new(true, 1, &writes));
        broadcaster.add(FakeTarget::new(false, 20, &writes));

        let result = broadcaster.broadcast(Arc::from(&b"x"[..])).await;
        assert!(result.is_err());
        assert_eq!(writes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn closed_targets_are_erased() {
        let writes = Arc::new(AtomicUsize::new(0));
        let broadcaster = Broadcaster::new();
        let mut closed = FakeTarget::new(false, 0, &writes);
        closed.closed = true;
        broadcaster.add(closed);
        broadcaster.add(FakeTarget::new(false, 0, &writes));
        assert_eq!(broadcaster.receiver_count(), 1);

        broadcaster.broadcast(Arc::from(&b"x"[..])).await.unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 1);
        assert_eq!(broadcaster.receiver_count(), 1);

        broadcaster.close_all().await;
        assert!(!broadcaster.has_receivers());
    }

    #[tokio::test]
    async fn stream_target_closes_on_write_failure() {
        let (a, b) = tokio::io::duplex(64);
        drop(b);
        let broadcaster = Broadcaster::new();
        broadcaster.add(StreamTarget::new("duplex", a));
        assert!(broadcaster.broadcast(Arc::from(&b"hello"[..])).await.is_err());
        assert!(!broadcaster.has_receivers());
    }

    #[tokio::test]
    async fn stalled_peer_does_not_block_others() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let broadcaster = Broadcaster::with_write_timeout(Duration::from_millis(200));
        // Never read, so writes beyond the duplex capacity hang.
        let (stalled, _stalled_peer) = tokio::io::duplex(8);
        broadcaster.add(StreamTarget::new("stalled", stalled));

        let sending = broadcaster.clone();
        let stuck = tokio::spawn(async move { sending.broadcast(Arc::from(vec![7u8; 1024])).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (healthy, mut healthy_peer) = tokio::io::duplex(4096);
        tokio::time::timeout(Duration::from_millis(50), async { broadcaster.add(StreamTarget::new("healthy", healthy)) })
            .await?;
        assert_eq!(broadcaster.receiver_count(), 2);

        let err = stuck.await?.unwrap_err();
        assert_eq!(err.net_kind(), Some(NetError::TimedOut));
        assert_eq!(broadcaster.receiver_count(), 1);

        broadcaster.broadcast(Arc::from(&b"after"[..])).await?;
        let mut buf = [0u8; 5];
        healthy_peer.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"after");
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_broadcasts_share_targets() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let writes = Arc::new(AtomicUsize::new(0));
        let broadcaster = Broadcaster::new();
        broadcaster.add(FakeTarget::new(false, 20, &writes));
        broadcaster.add(FakeTarget::new(false, 5, &writes));

        let (first, second) = tokio::join!(
            broadcaster.broadcast(Arc::from(&b"a"[..])),
            broadcaster.broadcast(Arc::from(&b"b"[..]))
        );
        first?;
        second?;
        assert_eq!(writes.load(Ordering::SeqCst), 4);
        Ok(())
    }
}
