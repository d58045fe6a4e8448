//! Transport channels.
//!
//! A publisher owns one [`ServerChannel`] per advertised transport; a
//! subscriber connects exactly one [`ClientChannel`] to the transport it
//! picked from the topic's sources.
//!
//! # Modules
//!
//! - [`tcp`] – listening socket plus broadcaster, header-framed stream.
//! - [`udp`] – unicast (join datagram) or multicast datagrams.
//! - [`uds`] – Unix domain socket, same framing as TCP.
//! - [`shm`] – sequence-locked shared-memory slot.
//! - [`ws`] – WebSocket server and tungstenite client.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tether_types::{ChannelDef, ChannelType, MessageIoError, Result, TetherError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::error;

use crate::buffer::{AttachKind, ChannelBuffer, SendBuffer};
use crate::header::{HEADER_SIZE, Header};
use crate::settings::Settings;

pub mod shm;
pub mod tcp;
pub mod udp;
pub mod uds;
pub mod ws;

/// Completion of one send on one channel.
pub type SendCallback = Arc<dyn Fn(&ChannelDef, Result<()>) + Send + Sync>;

#[async_trait]
pub trait ServerChannel: Send + Sync {
    fn channel_def(&self) -> &ChannelDef;

    /// Framing this channel expects in the send buffer.
    fn attach_kind(&self) -> AttachKind;

    /// A previous send has not completed yet.
    fn is_sending(&self) -> bool;

    fn has_receivers(&self) -> bool;

    /// Stage `content` into `buffer` (unless `reuse` and the buffer already
    /// carries this channel's framing) and start sending it. Staging errors
    /// are returned directly; transport errors go to `callback`.
    fn send_message(
        &self,
        buffer: &mut SendBuffer,
        content: &[u8],
        reuse: bool,
        callback: Option<SendCallback>,
    ) -> Result<()>;

    async fn close(&mut self);
}

#[async_trait]
pub trait ClientChannel: Send {
    fn channel_type(&self) -> ChannelType;

    /// `false` once the peer is known to be gone.
    fn is_connected(&self) -> bool;

    /// Wait for the next message and return its content.
    async fn receive_message(&mut self) -> Result<&[u8]>;
}

/// Open the publisher side of `channel_type`.
pub async fn open_server_channel(channel_type: ChannelType, settings: &Settings) -> Result<Box<dyn ServerChannel>> {
    let channel_settings = &settings.channel_settings;
    Ok(match channel_type {
        ChannelType::Tcp => Box::new(tcp::TcpServerChannel::listen(channel_settings).await?),
        ChannelType::Udp => Box::new(udp::UdpServerChannel::bind(channel_settings).await?),
        ChannelType::Uds => Box::new(uds::UdsServerChannel::bind_and_listen(channel_settings)?),
        ChannelType::Shm => Box::new(shm::ShmServerChannel::allocate(channel_settings)?),
        ChannelType::Ws => Box::new(ws::WsServerChannel::listen(channel_settings).await?),
    })
}

/// Connect the subscriber side to an advertised source.
pub async fn connect_client_channel(def: &ChannelDef, settings: &Settings) -> Result<Box<dyn ClientChannel>> {
    let buffer = receive_buffer(settings);
    Ok(match def.channel_type {
        ChannelType::Tcp => Box::new(tcp::TcpClientChannel::connect(def, buffer).await?),
        ChannelType::Udp => Box::new(udp::UdpClientChannel::connect(def, buffer, settings.period()).await?),
        ChannelType::Uds => Box::new(uds::UdsClientChannel::connect(def, buffer).await?),
        ChannelType::Shm => Box::new(shm::ShmClientChannel::open(def, buffer, settings.period())?),
        ChannelType::Ws => Box::new(ws::WsClientChannel::connect(def, buffer).await?),
    })
}

/// Receive buffer sized per settings.
pub fn receive_buffer(settings: &Settings) -> ChannelBuffer {
    let mut buffer = ChannelBuffer::with_capacity(settings.buffer_size);
    if settings.is_dynamic_buffer {
        buffer.enable_dynamic_buffer();
        buffer.set_max_dynamic_capacity(settings.max_dynamic_buffer_size);
    }
    buffer
}

/// Put `content` into `buffer` with `kind` framing and return the shared
/// bytes to write.
pub(crate) fn stage(buffer: &mut SendBuffer, kind: AttachKind, content: &[u8], reuse: bool) -> Result<Arc<[u8]>> {
    if reuse && buffer.can_reuse(kind) {
        return Ok(buffer.freeze());
    }
    let needed = match kind {
        AttachKind::General => HEADER_SIZE + content.len(),
        AttachKind::WebSocket => content.len(),
        AttachKind::None => {
            return Err(TetherError::InvalidArgument("channel has no framing".into()));
        }
    };
    if !buffer.set_enough_capacity_if_dynamic(needed) {
        return Err(MessageIoError::NotEnoughBuffer {
            needed,
            capacity: buffer.capacity(),
        }
        .into());
    }
    match kind {
        AttachKind::General => {
            let written = Header::attach_header_internally(content, buffer.start_of_buffer())?;
            buffer.attach_general(written);
        }
        _ => {
            buffer.start_of_buffer()[..needed].copy_from_slice(content);
            buffer.attach_websocket(needed);
        }
    }
    Ok(buffer.freeze())
}

/// Run `write` in the background with the sending flag raised, then report.
pub(crate) fn spawn_send<F>(def: ChannelDef, sending: Arc<AtomicBool>, write: F, callback: Option<SendCallback>)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    sending.store(true, Ordering::Release);
    tokio::spawn(async move {
        let result = write.await;
        sending.store(false, Ordering::Release);
        report(&def, result, callback.as_ref());
    });
}

pub(crate) fn report(def: &ChannelDef, result: Result<()>, callback: Option<&SendCallback>) {
    match callback {
        Some(callback) => callback(def, result),
        None => {
            if let Err(e) = result {
                error!(channel = %def, error = %e, "failed to send message");
            }
        }
    }
}

/// Read one `Header || content` message into `buffer`.
///
/// A payload that does not fit a fixed buffer, or that exceeds a dynamic
/// buffer's limit, is drained from the stream so the next message stays
/// aligned, and reported as resource exhausted.
pub(crate) async fn read_framed<'a, R>(reader: &mut R, buffer: &'a mut ChannelBuffer) -> Result<&'a [u8]>
where
    R: AsyncRead + Unpin + Send,
{
    let mut raw = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw).await?;
    let header = Header::parse(&raw)?;
    let size = header.size();

    if !buffer.set_enough_capacity_if_dynamic(size) {
        let drained = tokio::io::copy(&mut (&mut *reader).take(size as u64), &mut tokio::io::sink()).await?;
        if drained < size as u64 {
            return Err(TetherError::connection_closed());
        }
        return Err(MessageIoError::NotEnoughBuffer {
            needed: size,
            capacity: buffer.capacity(),
        }
        .into());
    }

    buffer.reset();
    reader.read_exact(&mut buffer.start_of_buffer()[..size]).await?;
    buffer.set_offset(size);
    Ok(buffer.filled())
}

/// Write one `Header || content` message.
pub(crate) async fn write_framed<W>(writer: &mut W, content: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let header = Header::new(content.len())?;
    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(content).await?;
    writer.flush().await?;
    Ok(())
}

/// Errors meaning the stream is gone for good.
pub(crate) fn is_disconnect(e: &TetherError) -> bool {
    use tether_types::NetError;
    matches!(
        e.net_kind(),
        Some(NetError::ConnectionClosed | NetError::ConnectionReset | NetError::SocketNotConnected)
    )
}
