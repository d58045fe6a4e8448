use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use tether_types::{ChannelAddress, ChannelDef, ChannelType, MessageIoError, Result, TetherError};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use super::{ClientChannel, SendCallback, ServerChannel, spawn_send, stage};
use crate::buffer::{AttachKind, ChannelBuffer, SendBuffer};
use crate::settings::ChannelSettings;
use crate::websocket::WebSocketServer;

/// Publisher side: content goes out as one binary message, no header.
pub struct WsServerChannel {
    def: ChannelDef,
    server: WebSocketServer,
    sending: Arc<AtomicBool>,
}

impl WsServerChannel {
    pub async fn listen(settings: &ChannelSettings) -> Result<Self> {
        let mut server = WebSocketServer::bind(settings.host, &settings.ws).await?;
        server.start();
        Ok(Self {
            def: ChannelDef::new(ChannelType::Ws, ChannelAddress::Ip(server.local_addr())),
            server,
            sending: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[async_trait]
impl ServerChannel for WsServerChannel {
    fn channel_def(&self) -> &ChannelDef {
        &self.def
    }

    fn attach_kind(&self) -> AttachKind {
        AttachKind::WebSocket
    }

    fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    fn has_receivers(&self) -> bool {
        self.server.has_receivers()
    }

    fn send_message(
        &self,
        buffer: &mut SendBuffer,
        content: &[u8],
        reuse: bool,
        callback: Option<SendCallback>,
    ) -> Result<()> {
        let data = stage(buffer, AttachKind::WebSocket, content, reuse)?;
        let broadcaster = self.server.broadcaster().clone();
        spawn_send(
            self.def.clone(),
            self.sending.clone(),
            async move { broadcaster.broadcast(data).await },
            callback,
        );
        Ok(())
    }

    async fn close(&mut self) {
        self.server.close().await;
    }
}

/// Subscriber side, a plain RFC6455 client.
pub struct WsClientChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    buffer: ChannelBuffer,
    connected: bool,
}

impl WsClientChannel {
    pub async fn connect(def: &ChannelDef, buffer: ChannelBuffer) -> Result<Self> {
        let addr: SocketAddr = def
            .socket_addr()
            .ok_or_else(|| TetherError::InvalidArgument(format!("{def} has no socket address")))?;
        let url = format!("ws://{addr}/");
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TetherError::Unavailable(format!("connect to {url}: {e}")))?;
        debug!(url = %url, "websocket client connected");
        Ok(Self {
            stream,
            buffer,
            connected: true,
        })
    }

    fn disconnected(&mut self) -> TetherError {
        self.connected = false;
        TetherError::connection_closed()
    }
}

#[async_trait]
impl ClientChannel for WsClientChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Ws
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn receive_message(&mut self) -> Result<&[u8]> {
        let content = loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Binary(bytes))) => break bytes.to_vec(),
                Some(Ok(WsMessage::Text(text))) => break text.as_bytes().to_vec(),
                Some(Ok(WsMessage::Close(_))) | None => return Err(self.disconnected()),
                Some(Ok(other)) => trace!(kind = ?other, "skipping websocket control message"),
                Some(Err(e)) => {
                    debug!(error = %e, "websocket client read failed");
                    return Err(self.disconnected());
                }
            }
        };

        let len = content.len();
        if !self.buffer.set_enough_capacity_if_dynamic(len) {
            return Err(MessageIoError::NotEnoughBuffer {
                needed: len,
                capacity: self.buffer.capacity(),
            }
            .into());
        }
        self.buffer.reset();
        self.buffer.start_of_buffer()[..len].copy_from_slice(&content);
        self.buffer.set_offset(len);
        Ok(self.buffer.filled())
    }
}
