//! Datagram transport.
//!
//! In unicast mode a subscriber announces itself with [`JOIN_DATAGRAM`] and
//! the publisher sends each message to every peer it has heard from. In
//! multicast mode the publisher sends to a random group in `239.0.0.0/8`
//! and subscribers join the group. Each datagram is one `Header || content`
//! message.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tether_types::{ChannelAddress, ChannelDef, ChannelType, MessageIoError, Result, TetherError};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{ClientChannel, SendCallback, ServerChannel, spawn_send, stage};
use crate::buffer::{AttachKind, ChannelBuffer, SendBuffer};
use crate::header::{HEADER_SIZE, Header};
use crate::settings::{ChannelSettings, UdpMode};

pub const JOIN_DATAGRAM: &[u8] = b"TETHER_JOIN";
pub const LEAVE_DATAGRAM: &[u8] = b"TETHER_LEAVE";
/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

pub struct UdpServerChannel {
    def: ChannelDef,
    mode: UdpMode,
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<HashSet<SocketAddr>>>,
    join_task: Option<JoinHandle<()>>,
    sending: Arc<AtomicBool>,
}

impl UdpServerChannel {
    pub async fn bind(settings: &ChannelSettings) -> Result<Self> {
        match settings.udp.mode {
            UdpMode::Unicast => Self::bind_unicast(settings.host).await,
            UdpMode::Multicast => Self::bind_multicast().await,
        }
    }

    async fn bind_unicast(host: IpAddr) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(SocketAddr::new(host, 0)).await?);
        let local_addr = socket.local_addr()?;
        let peers = Arc::new(Mutex::new(HashSet::new()));
        let join_task = tokio::spawn(track_peers(socket.clone(), peers.clone()));
        debug!(addr = %local_addr, "udp unicast channel bound");
        Ok(Self {
            def: ChannelDef::new(ChannelType::Udp, ChannelAddress::Ip(local_addr)),
            mode: UdpMode::Unicast,
            socket,
            peers,
            join_task: Some(join_task),
            sending: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn bind_multicast() -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(1)?;
        let group = random_multicast_group();
        debug!(group = %group, "udp multicast channel bound");
        Ok(Self {
            def: ChannelDef::new(ChannelType::Udp, ChannelAddress::Ip(group)),
            mode: UdpMode::Multicast,
            socket: Arc::new(socket),
            peers: Arc::new(Mutex::new(HashSet::new())),
            join_task: None,
            sending: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn mode(&self) -> UdpMode {
        self.mode
    }
}

impl Drop for UdpServerChannel {
    fn drop(&mut self) {
        if let Some(task) = self.join_task.take() {
            task.abort();
        }
    }
}

fn random_multicast_group() -> SocketAddr {
    let mut rng = rand::thread_rng();
    let ip = Ipv4Addr::new(239, rng.gen_range(1..=254), rng.r#gen(), rng.gen_range(1..=254));
    SocketAddr::new(IpAddr::V4(ip), rng.gen_range(20_000..60_000))
}

async fn track_peers(socket: Arc<UdpSocket>, peers: Arc<Mutex<HashSet<SocketAddr>>>) {
    let mut buf = [0u8; 64];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, peer)) if &buf[..n] == JOIN_DATAGRAM => {
                if peers.lock().insert(peer) {
                    debug!(peer = %peer, "udp peer joined");
                }
            }
            Ok((n, peer)) if &buf[..n] == LEAVE_DATAGRAM => {
                peers.lock().remove(&peer);
                debug!(peer = %peer, "udp peer left");
            }
            Ok((n, peer)) => trace!(peer = %peer, len = n, "ignoring stray datagram"),
            // ICMP port-unreachable from a vanished peer surfaces here on some platforms.
            Err(e) => trace!(error = %e, "udp receive error"),
        }
    }
}

#[async_trait]
impl ServerChannel for UdpServerChannel {
    fn channel_def(&self) -> &ChannelDef {
        &self.def
    }

    fn attach_kind(&self) -> AttachKind {
        AttachKind::General
    }

    fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    fn has_receivers(&self) -> bool {
        match self.mode {
            UdpMode::Multicast => true,
            UdpMode::Unicast => !self.peers.lock().is_empty(),
        }
    }

    fn send_message(
        &self,
        buffer: &mut SendBuffer,
        content: &[u8],
        reuse: bool,
        callback: Option<SendCallback>,
    ) -> Result<()> {
        let data = stage(buffer, AttachKind::General, content, reuse)?;
        let socket = self.socket.clone();
        let targets: Vec<SocketAddr> = match (self.mode, self.def.socket_addr()) {
            (UdpMode::Multicast, Some(group)) => vec![group],
            _ => self.peers.lock().iter().copied().collect(),
        };
        let peers = self.peers.clone();
        let write = async move {
            let mut last_result = Ok(());
            for target in targets {
                if let Err(e) = socket.send_to(&data, target).await {
                    warn!(peer = %target, error = %e, "udp send failed, forgetting peer");
                    peers.lock().remove(&target);
                    last_result = Err(e.into());
                }
            }
            last_result
        };
        spawn_send(self.def.clone(), self.sending.clone(), write, callback);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(task) = self.join_task.take() {
            task.abort();
        }
        self.peers.lock().clear();
        debug!(channel = %self.def, "udp channel closed");
    }
}

pub struct UdpClientChannel {
    socket: UdpSocket,
    server: Option<SocketAddr>,
    buffer: ChannelBuffer,
    /// A unicast join is repeated every `join_interval` until the first
    /// datagram from the server arrives.
    joined: bool,
    join_interval: Duration,
}

impl UdpClientChannel {
    pub async fn connect(def: &ChannelDef, mut buffer: ChannelBuffer, join_interval: Duration) -> Result<Self> {
        let addr = def
            .socket_addr()
            .ok_or_else(|| TetherError::InvalidArgument(format!("{def} has no socket address")))?;
        if buffer.is_dynamic() {
            buffer.set_enough_capacity_if_dynamic(MAX_DATAGRAM_SIZE);
        }

        match addr.ip() {
            IpAddr::V4(group) if group.is_multicast() => {
                let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port())).await?;
                socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
                debug!(group = %addr, "joined udp multicast group");
                Ok(Self {
                    socket,
                    server: None,
                    buffer,
                    joined: true,
                    join_interval,
                })
            }
            ip => {
                let local = if ip.is_ipv4() {
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
                } else {
                    IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
                };
                let socket = UdpSocket::bind(SocketAddr::new(local, 0)).await?;
                socket.send_to(JOIN_DATAGRAM, addr).await?;
                debug!(server = %addr, "sent udp join");
                Ok(Self {
                    socket,
                    server: Some(addr),
                    buffer,
                    joined: false,
                    join_interval,
                })
            }
        }
    }
}

impl Drop for UdpClientChannel {
    fn drop(&mut self) {
        if let Some(server) = self.server {
            let _ = self.socket.try_send_to(LEAVE_DATAGRAM, server);
        }
    }
}

#[async_trait]
impl ClientChannel for UdpClientChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Udp
    }

    /// Datagrams carry no connection state.
    fn is_connected(&self) -> bool {
        true
    }

    async fn receive_message(&mut self) -> Result<&[u8]> {
        self.buffer.reset();
        let (n, from) = loop {
            let Some(server) = self.server.filter(|_| !self.joined) else {
                break self.socket.recv_from(self.buffer.start_of_buffer()).await?;
            };
            match tokio::time::timeout(self.join_interval, self.socket.recv_from(self.buffer.start_of_buffer())).await {
                Ok(received) => break received?,
                Err(_) => {
                    trace!(server = %server, "no datagram yet, repeating udp join");
                    self.socket.send_to(JOIN_DATAGRAM, server).await?;
                }
            }
        };
        if let Some(server) = self.server {
            if from != server {
                return Err(TetherError::InvalidArgument(format!("datagram from unexpected peer {from}")));
            }
            self.joined = true;
        }
        let header = Header::parse(&self.buffer.start_of_buffer()[..n])?;
        let end = HEADER_SIZE + header.size();
        if end > n {
            return Err(MessageIoError::NotEnoughBuffer {
                needed: end,
                capacity: self.buffer.capacity(),
            }
            .into());
        }
        self.buffer.set_offset(end);
        Ok(&self.buffer.filled()[HEADER_SIZE..])
    }
}
