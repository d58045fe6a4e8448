use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tether_types::{ChannelAddress, ChannelDef, ChannelType, Result, TetherError};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{ClientChannel, SendCallback, ServerChannel, is_disconnect, read_framed, spawn_send, stage};
use crate::buffer::{AttachKind, ChannelBuffer, SendBuffer};
use crate::settings::ChannelSettings;
use crate::socket::{Broadcaster, StreamTarget, TcpServerSocket};

pub struct TcpServerChannel {
    def: ChannelDef,
    broadcaster: Broadcaster<StreamTarget<TcpStream>>,
    accept_task: JoinHandle<()>,
    sending: Arc<AtomicBool>,
}

impl TcpServerChannel {
    /// Listen on the configured host with an ephemeral port.
    pub async fn listen(settings: &ChannelSettings) -> Result<Self> {
        let socket = TcpServerSocket::listen(SocketAddr::new(settings.host, 0)).await?;
        let broadcaster = Broadcaster::new();
        let accept_task = socket.accept_into(broadcaster.clone());
        Ok(Self {
            def: ChannelDef::new(ChannelType::Tcp, ChannelAddress::Ip(socket.local_addr())),
            broadcaster,
            accept_task,
            sending: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl Drop for TcpServerChannel {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl ServerChannel for TcpServerChannel {
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
        self.broadcaster.has_receivers()
    }

    fn send_message(
        &self,
        buffer: &mut SendBuffer,
        content: &[u8],
        reuse: bool,
        callback: Option<SendCallback>,
    ) -> Result<()> {
        let data = stage(buffer, AttachKind::General, content, reuse)?;
        let broadcaster = self.broadcaster.clone();
        spawn_send(
            self.def.clone(),
            self.sending.clone(),
            async move { broadcaster.broadcast(data).await },
            callback,
        );
        Ok(())
    }

    async fn close(&mut self) {
        self.accept_task.abort();
        self.broadcaster.close_all().await;
        debug!(channel = %self.def, "tcp channel closed");
    }
}

pub struct TcpClientChannel {
    stream: TcpStream,
    buffer: ChannelBuffer,
    connected: bool,
}

impl TcpClientChannel {
    pub async fn connect(def: &ChannelDef, buffer: ChannelBuffer) -> Result<Self> {
        let addr = def
            .socket_addr()
            .ok_or_else(|| TetherError::InvalidArgument(format!("{def} has no socket address")))?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TetherError::from(e).context(&format!("connect to {addr}")))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            buffer,
            connected: true,
        })
    }
}

#[async_trait]
impl ClientChannel for TcpClientChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Tcp
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn receive_message(&mut self) -> Result<&[u8]> {
        match read_framed(&mut self.stream, &mut self.buffer).await {
            Ok(content) => Ok(content),
            Err(e) => {
                if is_disconnect(&e) {
                    self.connected = false;
                }
                Err(e)
            }
        }
    }
}
