use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tether_types::{ChannelAddress, ChannelDef, ChannelType, Result, TetherError};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ClientChannel, SendCallback, ServerChannel, is_disconnect, read_framed, spawn_send, stage};
use crate::buffer::{AttachKind, ChannelBuffer, SendBuffer};
use crate::settings::ChannelSettings;
use crate::socket::{AcceptBackoff, Broadcaster, StreamTarget};

pub struct UdsServerChannel {
    def: ChannelDef,
    path: PathBuf,
    broadcaster: Broadcaster<StreamTarget<UnixStream>>,
    accept_task: JoinHandle<()>,
    sending: Arc<AtomicBool>,
}

impl UdsServerChannel {
    /// Bind a fresh socket file under the configured directory and listen.
    pub fn bind_and_listen(settings: &ChannelSettings) -> Result<Self> {
        let path = settings.uds.dir.join(format!("tether-{}.sock", Uuid::new_v4().simple()));
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)
            .map_err(|e| TetherError::from(e).context(&format!("bind {}", path.display())))?;
        let broadcaster = Broadcaster::new();
        let accept_task = tokio::spawn(accept_loop(listener, broadcaster.clone()));
        debug!(path = %path.display(), "uds channel listening");
        Ok(Self {
            def: ChannelDef::new(ChannelType::Uds, ChannelAddress::Unix(path.clone())),
            path,
            broadcaster,
            accept_task,
            sending: Arc::new(AtomicBool::new(false)),
        })
    }
}

async fn accept_loop(listener: UnixListener, broadcaster: Broadcaster<StreamTarget<UnixStream>>) {
    let mut next_peer = 0u64;
    let mut backoff = AcceptBackoff::default();
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                backoff.reset();
                next_peer += 1;
                broadcaster.add(StreamTarget::new(format!("uds-peer-{next_peer}"), stream));
            }
            Err(e) => match backoff.on_error(&e) {
                None => debug!(error = %e, "transient uds accept failure"),
                Some(delay) => {
                    warn!(error = %e, retry_ms = delay.as_millis() as u64, "uds accept failed");
                    tokio::time::sleep(delay).await;
                }
            },
        }
    }
}

impl Drop for UdsServerChannel {
    fn drop(&mut self) {
        self.accept_task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

#[async_trait]
impl ServerChannel for UdsServerChannel {
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
        let _ = std::fs::remove_file(&self.path);
        debug!(channel = %self.def, "uds channel closed");
    }
}

pub struct UdsClientChannel {
    stream: UnixStream,
    buffer: ChannelBuffer,
    connected: bool,
}

impl UdsClientChannel {
    pub async fn connect(def: &ChannelDef, buffer: ChannelBuffer) -> Result<Self> {
        let ChannelAddress::Unix(path) = &def.address else {
            return Err(TetherError::InvalidArgument(format!("{def} is not a unix socket")));
        };
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| TetherError::from(e).context(&format!("connect to {}", path.display())))?;
        Ok(Self {
            stream,
            buffer,
            connected: true,
        })
    }
}

#[async_trait]
impl ClientChannel for UdsClientChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Uds
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

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::settings::Settings;

    #[tokio::test]
    async fn socket_file_lifecycle_and_delivery() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let mut settings = Settings::default();
        settings.channel_settings.uds.dir = dir.path().to_path_buf();

        let mut server = UdsServerChannel::bind_and_listen(&settings.channel_settings)?;
        let ChannelAddress::Unix(path) = server.channel_def().address.clone() else {
            panic!("expected unix address");
        };
        assert!(path.starts_with(dir.path()));
        assert!(path.exists());

        let mut client = UdsClientChannel::connect(server.channel_def(), ChannelBuffer::with_capacity(64)).await?;
        tokio::time::timeout(Duration::from_secs(1), async {
            while !server.has_receivers() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;

        let mut buffer = SendBuffer::new();
        buffer.set_capacity(64);
        server.send_message(&mut buffer, b"over uds", false, None)?;
        assert_eq!(client.receive_message().await?, b"over uds");

        server.close().await;
        assert!(!path.exists());
        assert!(client.receive_message().await.is_err());
        assert!(!client.is_connected());
        Ok(())
    }
}
