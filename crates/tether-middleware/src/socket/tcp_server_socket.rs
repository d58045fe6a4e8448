use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tether_types::{Result, TetherError};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::broadcaster::{Broadcaster, StreamTarget};

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(10);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Accept errors caused by one peer; the next accept can go ahead at once.
pub fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Delay before retrying accept after a listener-level failure such as
/// running out of file descriptors. Doubles per consecutive failure up to
/// one second and resets after a successful accept.
#[derive(Debug, Default)]
pub struct AcceptBackoff {
    next: Option<Duration>,
}

impl AcceptBackoff {
    /// Delay to wait after `e`, `None` for transient errors.
    pub fn on_error(&mut self, e: &io::Error) -> Option<Duration> {
        if is_transient_accept_error(e) {
            return None;
        }
        let delay = self.next.unwrap_or(MIN_ACCEPT_BACKOFF);
        self.next = Some((delay * 2).min(MAX_ACCEPT_BACKOFF));
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.next = None;
    }
}

#[derive(Clone)]
pub struct TcpServerSocket {
    listener: Arc<TcpListener>,
    local_addr: SocketAddr,
}

impl TcpServerSocket {
    /// Bind and listen. Port `0` picks an ephemeral port.
    pub async fn listen(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TetherError::from(e).context(&format!("listen on {addr}")))?;
        let local_addr = listener.local_addr()?;
        debug!(addr = %local_addr, "tcp server socket listening");
        Ok(Self {
            listener: Arc::new(listener),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one connection and give the raw stream to the caller.
    pub async fn accept_once_intercept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer))
    }

    /// Accept until the task is aborted, handing every stream to
    /// `on_accept`. Failures are logged and retried after a backoff.
    pub fn accept_loop<F, Fut>(&self, mut on_accept: F) -> JoinHandle<()>
    where
        F: FnMut(TcpStream, SocketAddr) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let socket = self.clone();
        tokio::spawn(async move {
            let mut backoff = AcceptBackoff::default();
            loop {
                match socket.accept_once_intercept().await {
                    Ok((stream, peer)) => {
                        backoff.reset();
                        debug!(peer = %peer, "accepted connection");
                        on_accept(stream, peer).await;
                    }
                    Err(e) => match backoff.on_error(&e) {
                        None => debug!(addr = %socket.local_addr, error = %e, "transient accept failure"),
                        Some(delay) => {
                            warn!(addr = %socket.local_addr, error = %e, retry_ms = delay.as_millis() as u64, "accept failed");
                            tokio::time::sleep(delay).await;
                        }
                    },
                }
            }
        })
    }

    /// Accept loop feeding a broadcaster with every accepted peer.
    pub fn accept_into(&self, broadcaster: Broadcaster<StreamTarget<TcpStream>>) -> JoinHandle<()> {
        self.accept_loop(move |stream, peer| {
            let broadcaster = broadcaster.clone();
            async move {
                broadcaster.add(StreamTarget::new(peer.to_string(), stream));
            }
        })
    }
}
