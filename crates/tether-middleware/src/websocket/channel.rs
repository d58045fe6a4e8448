//! Per-connection WebSocket protocol state.
//!
//! [`WebSocketChannel`] is a pure state machine: it never touches a socket.
//! The connection driver spawned by [`spawn_channel`] owns the stream halves,
//! feeds it read results, write completions and timer expiry, and performs
//! the writes it asks for. Outgoing frames use a single in-flight slot:
//! one batch is with the writer, everything else accumulates in the next
//! batch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tether_types::{Result, TetherError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace, warn};

use super::frame::{OpCode, WebSocketFrame};
use super::stream::{FrameReader, FrameWriter};
use crate::socket::broadcaster::BroadcastTarget;

/// How long our Close may go unanswered.
pub const CLOSING_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
/// How long the TCP teardown may take once both Close frames were seen.
pub const UNDERLYING_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
/// Longest close reason that still fits a control frame.
pub const MAX_CLOSE_REASON: usize = 123;

pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const NO_STATUS_RECEIVED: u16 = 1005;
    pub const ABNORMAL_CLOSURE: u16 = 1006;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const TLS_HANDSHAKE: u16 = 1015;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    FreshlyConstructed,
    Connecting,
    Connected,
    SendClosed,
    RecvClosed,
    CloseWait,
    Closed,
}

impl ChannelState {
    /// Whether new data may no longer be queued.
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            ChannelState::SendClosed | ChannelState::RecvClosed | ChannelState::CloseWait | ChannelState::Closed
        )
    }
}

pub type WriteCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Codes a peer may legitimately put in a Close frame we send.
pub fn is_strictly_valid_close_status_code(code: u16) -> bool {
    matches!(code, 1000..=1005 | 1007..=1013 | 3000..=4999)
}

/// Close payload for `code`/`reason`. `1005` maps to an empty payload; an
/// invalid code or an over-long reason is replaced by `1011`.
pub fn encode_close_payload(code: u16, reason: &str) -> Vec<u8> {
    if code == close_code::NO_STATUS_RECEIVED {
        return Vec::new();
    }
    if !is_strictly_valid_close_status_code(code) || reason.len() > MAX_CLOSE_REASON {
        return close_code::INTERNAL_ERROR.to_be_bytes().to_vec();
    }
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Decode a received Close payload.
pub fn parse_close(payload: &[u8]) -> Result<(u16, String)> {
    match payload.len() {
        0 => return Ok((close_code::NO_STATUS_RECEIVED, String::new())),
        1 => return Err(TetherError::Protocol("one-byte close payload".into())),
        _ => {}
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    if matches!(
        code,
        close_code::NO_STATUS_RECEIVED | close_code::ABNORMAL_CLOSURE | close_code::TLS_HANDSHAKE
    ) || !is_strictly_valid_close_status_code(code)
    {
        return Err(TetherError::Protocol(format!("invalid close code {code} on the wire")));
    }
    let reason = std::str::from_utf8(&payload[2..])
        .map_err(|_| TetherError::Protocol("close reason is not utf-8".into()))?;
    Ok((code, reason.to_string()))
}

#[derive(Default)]
struct Outgoing {
    frames: Vec<WebSocketFrame>,
    callbacks: Vec<WriteCallback>,
}

pub struct WebSocketChannel {
    state: ChannelState,
    data_being_sent: Option<Outgoing>,
    data_to_send_next: Option<Outgoing>,
    close_deadline: Option<Instant>,
    has_received_close_frame: bool,
    received_close_code: Option<u16>,
    received_close_reason: String,
}

impl Default for WebSocketChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketChannel {
    /// A channel whose opening handshake already completed.
    pub fn new() -> Self {
        Self {
            state: ChannelState::Connected,
            data_being_sent: None,
            data_to_send_next: None,
            close_deadline: None,
            has_received_close_frame: false,
            received_close_code: None,
            received_close_reason: String::new(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_sending(&self) -> bool {
        self.data_being_sent.is_some() || self.data_to_send_next.is_some()
    }

    pub fn close_deadline(&self) -> Option<Instant> {
        self.close_deadline
    }

    pub fn has_received_close_frame(&self) -> bool {
        self.has_received_close_frame
    }

    pub fn received_close(&self) -> Option<(u16, &str)> {
        self.received_close_code
            .map(|code| (code, self.received_close_reason.as_str()))
    }

    /// Queue a frame. In a closing state the callback gets a
    /// connection-closed error and the channel stays as it is.
    pub fn send_frame(&mut self, fin: bool, opcode: OpCode, payload: Vec<u8>, callback: Option<WriteCallback>) {
        if self.state.is_closing() {
            if let Some(callback) = callback {
                callback(Err(TetherError::connection_closed()));
            }
            return;
        }
        self.enqueue(WebSocketFrame::new(opcode, fin, payload), callback);
    }

    fn enqueue(&mut self, frame: WebSocketFrame, callback: Option<WriteCallback>) {
        let next = self.data_to_send_next.get_or_insert_with(Outgoing::default);
        next.frames.push(frame);
        if let Some(callback) = callback {
            next.callbacks.push(callback);
        }
    }

    /// Hand the next batch to the writer, if the in-flight slot is free.
    pub fn take_frames_to_write(&mut self) -> Option<Vec<WebSocketFrame>> {
        if self.data_being_sent.is_some() || self.state == ChannelState::Closed {
            return None;
        }
        let mut next = self.data_to_send_next.take()?;
        let frames = std::mem::take(&mut next.frames);
        self.data_being_sent = Some(next);
        Some(frames)
    }

    /// Frames still queued once the channel is closed; written best effort.
    pub fn take_remaining_frames(&mut self) -> Vec<WebSocketFrame> {
        self.data_to_send_next
            .as_mut()
            .map(|next| std::mem::take(&mut next.frames))
            .unwrap_or_default()
    }

    pub fn on_write_done(&mut self, result: Result<()>) {
        match result {
            Ok(()) => {
                if let Some(done) = self.data_being_sent.take() {
                    for callback in done.callbacks {
                        callback(Ok(()));
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "websocket write failed");
                self.drop_channel();
            }
        }
    }

    /// Both Close frames are through and nothing is left to write.
    pub fn should_close_connection(&self) -> bool {
        self.state == ChannelState::CloseWait && !self.is_sending()
    }

    /// Send Close and wait for the peer's. A no-op unless connected.
    pub fn start_closing_handshake(&mut self, code: u16, reason: &str) {
        if self.state != ChannelState::Connected {
            return;
        }
        self.enqueue(
            WebSocketFrame::new(OpCode::Close, true, encode_close_payload(code, reason)),
            None,
        );
        self.state = ChannelState::SendClosed;
        self.close_deadline = Some(Instant::now() + CLOSING_HANDSHAKE_TIMEOUT);
    }

    fn respond_to_closing_handshake(&mut self) {
        let code = self.received_close_code.unwrap_or(close_code::NO_STATUS_RECEIVED);
        self.enqueue(WebSocketFrame::new(OpCode::Close, true, encode_close_payload(code, "")), None);
        self.state = ChannelState::CloseWait;
        self.close_deadline = Some(Instant::now() + UNDERLYING_CLOSE_TIMEOUT);
    }

    pub fn on_read_frames(&mut self, frames: Vec<WebSocketFrame>) {
        for frame in frames {
            if self.state == ChannelState::Closed {
                return;
            }
            self.on_frame(frame);
        }
    }

    fn on_frame(&mut self, frame: WebSocketFrame) {
        if self.state == ChannelState::CloseWait {
            self.fail_channel(close_code::PROTOCOL_ERROR, "frame received after close");
            return;
        }
        if frame.header.has_reserved_bits() {
            self.fail_channel(close_code::PROTOCOL_ERROR, "reserved bits set");
            return;
        }
        match frame.opcode() {
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                trace!(len = frame.payload.len(), "ignoring data frame from client");
            }
            OpCode::Ping => {
                if self.state == ChannelState::Connected {
                    self.enqueue(WebSocketFrame::new(OpCode::Pong, true, frame.payload), None);
                }
            }
            OpCode::Pong => {}
            OpCode::Close => self.on_close_frame(&frame.payload),
            OpCode::Reserved(op) => {
                self.fail_channel(close_code::PROTOCOL_ERROR, &format!("unknown opcode {op:#x}"));
            }
        }
    }

    fn on_close_frame(&mut self, payload: &[u8]) {
        let (code, reason) = match parse_close(payload) {
            Ok(close) => close,
            Err(e) => {
                self.fail_channel(close_code::PROTOCOL_ERROR, &e.to_string());
                return;
            }
        };
        self.has_received_close_frame = true;
        self.received_close_code = Some(code);
        self.received_close_reason = reason;
        match self.state {
            ChannelState::Connected => {
                self.state = ChannelState::RecvClosed;
                self.respond_to_closing_handshake();
            }
            ChannelState::SendClosed => {
                self.state = ChannelState::CloseWait;
                self.close_deadline = Some(Instant::now() + UNDERLYING_CLOSE_TIMEOUT);
            }
            _ => {}
        }
    }

    pub fn on_read_error(&mut self, error: TetherError) {
        match error {
            TetherError::Protocol(detail) => self.fail_channel(close_code::PROTOCOL_ERROR, &detail),
            other => {
                debug!(error = %other, "websocket read ended");
                self.drop_channel();
            }
        }
    }

    /// Timer fired; whichever wait was pending is over.
    pub fn on_close_timeout(&mut self) {
        if self.close_deadline.is_some() {
            debug!(state = ?self.state, "websocket close timed out");
            self.drop_channel();
        }
    }

    /// Protocol violation: tell the peer if we still can, then close.
    pub fn fail_channel(&mut self, code: u16, detail: &str) {
        warn!(code, detail, "failing websocket channel");
        if self.state == ChannelState::Connected {
            self.enqueue(WebSocketFrame::new(OpCode::Close, true, encode_close_payload(code, "")), None);
        }
        self.drop_channel();
    }

    /// Move to CLOSED and fail every pending write.
    pub fn drop_channel(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.state = ChannelState::Closed;
        self.close_deadline = None;
        let pending = self
            .data_being_sent
            .take()
            .into_iter()
            .chain(self.data_to_send_next.as_mut().map(|next| Outgoing {
                frames: Vec::new(),
                callbacks: std::mem::take(&mut next.callbacks),
            }));
        for outgoing in pending {
            for callback in outgoing.callbacks {
                callback(Err(TetherError::connection_reset()));
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection driver
// ─────────────────────────────────────────────────────────────────────────────

enum ChannelCommand {
    Send {
        payload: Arc<[u8]>,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        code: u16,
        reason: String,
    },
}

enum WriterOp {
    Write(Vec<WebSocketFrame>),
    Shutdown,
}

/// Cloneable handle to a running connection driver.
#[derive(Clone)]
pub struct WebSocketChannelHandle {
    peer: SocketAddr,
    commands: mpsc::UnboundedSender<ChannelCommand>,
    closed: Arc<AtomicBool>,
}

impl WebSocketChannelHandle {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send one binary message and wait until it was written.
    pub async fn send_binary(&self, payload: Arc<[u8]>) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(ChannelCommand::Send { payload, reply })
            .map_err(|_| TetherError::connection_closed())?;
        done.await.map_err(|_| TetherError::connection_reset())?
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.commands.send(ChannelCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl BroadcastTarget for WebSocketChannelHandle {
    fn is_closed(&self) -> bool {
        WebSocketChannelHandle::is_closed(self)
    }

    async fn write(&mut self, data: Arc<[u8]>) -> Result<()> {
        self.send_binary(data).await
    }

    async fn close(&mut self) {
        WebSocketChannelHandle::close(self, close_code::GOING_AWAY, "");
    }
}

/// Start driving a connection whose handshake is complete.
pub fn spawn_channel(
    peer: SocketAddr,
    reader: Box<dyn FrameReader>,
    writer: Box<dyn FrameWriter>,
) -> WebSocketChannelHandle {
    let (commands, command_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let handle = WebSocketChannelHandle {
        peer,
        commands,
        closed: closed.clone(),
    };
    tokio::spawn(drive(peer, reader, writer, command_rx, closed));
    handle
}

fn spawn_reader(mut reader: Box<dyn FrameReader>, tx: mpsc::Sender<Result<Vec<WebSocketFrame>>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let result = reader.read_frames().await;
            let stop = result.is_err();
            if tx.send(result).await.is_err() || stop {
                break;
            }
        }
    })
}

fn spawn_writer(
    mut writer: Box<dyn FrameWriter>,
    mut ops: mpsc::UnboundedReceiver<WriterOp>,
    done: mpsc::UnboundedSender<Result<()>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(op) = ops.recv().await {
            match op {
                WriterOp::Write(frames) => {
                    let result = writer.write_frames(frames).await;
                    let failed = result.is_err();
                    let _ = done.send(result);
                    if failed {
                        break;
                    }
                }
                WriterOp::Shutdown => {
                    let _ = writer.close().await;
                    break;
                }
            }
        }
    })
}

async fn drive(
    peer: SocketAddr,
    reader: Box<dyn FrameReader>,
    writer: Box<dyn FrameWriter>,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
    closed: Arc<AtomicBool>,
) {
    let (read_tx, mut reads) = mpsc::channel(16);
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let (done_tx, mut write_done) = mpsc::unbounded_channel();
    let reader_task = spawn_reader(reader, read_tx);
    let mut writer_task = spawn_writer(writer, write_rx, done_tx);

    let mut channel = WebSocketChannel::new();
    let mut commands_open = true;
    debug!(peer = %peer, "websocket channel connected");

    loop {
        if let Some(frames) = channel.take_frames_to_write() {
            let _ = write_tx.send(WriterOp::Write(frames));
        }
        if channel.should_close_connection() {
            channel.drop_channel();
        }
        if channel.state() == ChannelState::Closed {
            break;
        }

        let deadline = channel.close_deadline();
        tokio::select! {
            command = commands.recv(), if commands_open => match command {
                Some(ChannelCommand::Send { payload, reply }) => {
                    let callback: WriteCallback = Box::new(move |result| {
                        let _ = reply.send(result);
                    });
                    channel.send_frame(true, OpCode::Binary, payload.to_vec(), Some(callback));
                }
                Some(ChannelCommand::Close { code, reason }) => channel.start_closing_handshake(code, &reason),
                None => {
                    commands_open = false;
                    channel.start_closing_handshake(close_code::GOING_AWAY, "");
                }
            },
            Some(read) = reads.recv() => match read {
                Ok(frames) => channel.on_read_frames(frames),
                Err(e) => channel.on_read_error(e),
            },
            Some(result) = write_done.recv() => channel.on_write_done(result),
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                channel.on_close_timeout();
            }
            else => channel.drop_channel(),
        }
    }

    closed.store(true, Ordering::Release);
    reader_task.abort();
    let remaining = channel.take_remaining_frames();
    if !remaining.is_empty() {
        let _ = write_tx.send(WriterOp::Write(remaining));
    }
    let _ = write_tx.send(WriterOp::Shutdown);
    drop(write_tx);
    if tokio::time::timeout(UNDERLYING_CLOSE_TIMEOUT, &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }
    debug!(
        peer = %peer,
        close = ?channel.received_close(),
        "websocket channel closed"
    );
}
