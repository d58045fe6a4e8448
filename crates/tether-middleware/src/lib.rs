//! `tether-middleware` – Publish/Subscribe Transport
//!
//! Moves typed messages from one publisher to many subscribers per topic over
//! pluggable channels, with a master registry telling subscribers where each
//! topic is served.
//!
//! # Modules
//!
//! - [`buffer`] – Growable receive buffers and the publisher's staged send
//!   buffer.
//! - [`header`] – 8-byte framing header in front of every stream and
//!   datagram message.
//! - [`message`] – The [`Message`] capability, JSON messages and raw bytes.
//! - [`pool`] – Fixed-capacity ring buffer that evicts the oldest entry.
//! - [`settings`] – Serde-loadable publisher/subscriber and channel settings.
//! - [`websocket`] – RFC6455 server: handshake, frames, permessage-deflate
//!   and the per-connection channel state machine.
//! - [`socket`] – TCP accept loop and the fan-out [`Broadcaster`].
//! - [`channel`] – TCP, UDP, Unix socket, shared-memory and WebSocket
//!   channels behind the server/client channel traits.
//! - [`master`] – Topic registry trait and the in-process [`LocalMaster`].
//! - [`context`] – Master and runtime handles shared by every actor.
//! - [`publisher`] / [`subscriber`] – Per-topic actors.
//! - [`service`] – Request/response [`ServiceServer`] and [`ServiceClient`]
//!   over TCP, found through the master.

pub mod buffer;
pub mod channel;
pub mod context;
pub mod header;
pub mod master;
pub mod message;
pub mod pool;
pub mod publisher;
pub mod service;
pub mod settings;
pub mod socket;
pub mod state;
pub mod subscriber;
pub mod websocket;

pub use buffer::{ChannelBuffer, SendBuffer};
pub use channel::{ClientChannel, SendCallback, ServerChannel};
pub use context::Context;
pub use master::{LocalMaster, MasterProxy};
pub use message::{JsonMessage, Message, MessageType, RawMessage};
pub use pool::Pool;
pub use publisher::Publisher;
pub use service::{ServiceClient, ServiceServer};
pub use settings::{ChannelSettings, Settings};
pub use socket::Broadcaster;
pub use state::{RegisterState, SubscriberState};
pub use subscriber::Subscriber;
