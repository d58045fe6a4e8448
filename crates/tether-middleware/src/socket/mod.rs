//! Listening sockets and multi-peer fan-out shared by the stream-based
//! transports.

pub mod broadcaster;
pub mod tcp_server_socket;

pub use broadcaster::{BroadcastTarget, Broadcaster, StreamTarget};
pub use tcp_server_socket::{AcceptBackoff, TcpServerSocket, is_transient_accept_error};
