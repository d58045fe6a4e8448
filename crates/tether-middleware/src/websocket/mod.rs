//! RFC6455 server stack.
//!
//! # Modules
//!
//! - [`frame`] – frame header model, serializer and incremental parser.
//! - [`stream`] – reader/writer halves turning bytes into frames.
//! - [`deflate`] – permessage-deflate wrappers for those halves.
//! - [`extension`] – `Sec-WebSocket-Extensions` negotiation.
//! - [`handshake`] – HTTP upgrade parsing, validation and responses.
//! - [`channel`] – per-connection state machine and its driver task.
//! - [`server`] – accept → handshake → channel → broadcaster.

pub mod channel;
pub mod deflate;
pub mod extension;
pub mod frame;
pub mod handshake;
pub mod server;
pub mod stream;

pub use channel::{ChannelState, WebSocketChannel, WebSocketChannelHandle};
pub use frame::{OpCode, WebSocketFrame, WebSocketFrameParser};
pub use handshake::HandshakeHandler;
pub use server::WebSocketServer;
