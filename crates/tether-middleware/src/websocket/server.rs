use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tether_types::Result;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::channel::{WebSocketChannelHandle, spawn_channel};
use super::deflate::{DeflateFrameReader, DeflateFrameWriter};
use super::handshake::HandshakeHandler;
use super::stream::{BasicFrameReader, BasicFrameWriter, FrameReader, FrameWriter};
use crate::settings::WebSocketSettings;
use crate::socket::{Broadcaster, TcpServerSocket};

/// Accepts WebSocket clients and broadcasts binary messages to all of them.
pub struct WebSocketServer {
    socket: TcpServerSocket,
    broadcaster: Broadcaster<WebSocketChannelHandle>,
    settings: WebSocketSettings,
    accept_task: Option<JoinHandle<()>>,
}

impl WebSocketServer {
    pub async fn bind(host: IpAddr, settings: &WebSocketSettings) -> Result<Self> {
        let socket = TcpServerSocket::listen(SocketAddr::new(host, settings.port)).await?;
        Ok(Self {
            socket,
            broadcaster: Broadcaster::new(),
            settings: settings.clone(),
            accept_task: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Start accepting. Every connection is handshaken on its own task so a
    /// slow client never holds up the accept loop.
    pub fn start(&mut self) {
        if self.accept_task.is_some() {
            return;
        }
        let broadcaster = self.broadcaster.clone();
        let handshake = Arc::new(HandshakeHandler::new(self.settings.clone()));
        let max_message_size = self.settings.max_message_size;
        self.accept_task = Some(self.socket.accept_loop(move |stream, peer| {
            let broadcaster = broadcaster.clone();
            let handshake = handshake.clone();
            async move {
                tokio::spawn(async move {
                    match open_channel(stream, peer, &handshake, max_message_size).await {
                        Ok(handle) => broadcaster.add(handle),
                        Err(e) => warn!(peer = %peer, error = %e, "websocket handshake failed"),
                    }
                });
            }
        }));
    }

    pub fn broadcaster(&self) -> &Broadcaster<WebSocketChannelHandle> {
        &self.broadcaster
    }

    pub fn has_receivers(&self) -> bool {
        self.broadcaster.has_receivers()
    }

    pub async fn broadcast(&self, data: Arc<[u8]>) -> Result<()> {
        self.broadcaster.broadcast(data).await
    }

    pub async fn close(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.broadcaster.close_all().await;
        debug!(addr = %self.local_addr(), "websocket server closed");
    }
}

async fn open_channel(
    mut stream: TcpStream,
    peer: SocketAddr,
    handshake: &HandshakeHandler,
    max_message_size: usize,
) -> Result<WebSocketChannelHandle> {
    let outcome = handshake.handle(&mut stream).await?;
    let (read_half, write_half) = stream.into_split();
    let basic_reader = BasicFrameReader::with_prefix(read_half, max_message_size, outcome.leftover);
    let basic_writer = BasicFrameWriter::new(write_half);

    let (reader, writer): (Box<dyn FrameReader>, Box<dyn FrameWriter>) = match outcome.extension {
        Some(extension) => (
            Box::new(DeflateFrameReader::new(
                Box::new(basic_reader),
                &extension.deflate,
                max_message_size,
            )),
            Box::new(DeflateFrameWriter::new(Box::new(basic_writer), &extension.deflate)),
        ),
        None => (Box::new(basic_reader), Box::new(basic_writer)),
    };
    Ok(spawn_channel(peer, reader, writer))
}

impl Drop for WebSocketServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::*;

    async fn wait_for_receivers(server: &WebSocketServer, count: usize) -> std::result::Result<(), Box<dyn std::error::Error>> {
        tokio::time::timeout(Duration::from_secs(2), async {
            while server.broadcaster().receiver_count() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        Ok(())
    }

    #[tokio::test]
    async fn tungstenite_clients_receive_broadcasts() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut server = WebSocketServer::bind("127.0.0.1".parse()?, &WebSocketSettings::default()).await?;
        server.start();
        let url = format!("ws://{}/", server.local_addr());

        let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut second, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        wait_for_receivers(&server, 2).await?;

        server.broadcast(Arc::from(&b"hello"[..])).await?;
        for client in [&mut first, &mut second] {
            match client.next().await {
                Some(Ok(WsMessage::Binary(bytes))) => assert_eq!(&bytes[..], b"hello"),
                other => panic!("unexpected message {other:?}"),
            }
        }

        first.close(None).await?;
        server.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn client_close_is_echoed() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut server = WebSocketServer::bind("127.0.0.1".parse()?, &WebSocketSettings::default()).await?;
        server.start();
        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}/", server.local_addr())).await?;
        wait_for_receivers(&server, 1).await?;

        client.send(WsMessage::Close(None)).await?;
        loop {
            match client.next().await {
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
        let result = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if server.broadcast(Arc::from(&b"x"[..])).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(result.is_ok());
        server.close().await;
        Ok(())
    }
}
