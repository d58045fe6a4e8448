//! `tether-types` – Shared vocabulary of the Tether middleware.
//!
//! Everything that crosses a crate boundary lives here: transport
//! descriptors advertised through the master, topic and service records,
//! node identity and the error taxonomy used by every asynchronous operation.

use std::fmt;
use std::net::SocketAddr;
use std::ops::BitOr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Channel types
// ─────────────────────────────────────────────────────────────────────────────

/// A concrete transport a topic can be carried over.
///
/// The discriminant is the bit used in [`ChannelTypes`] masks, so iterating a
/// mask in ascending bit order is also the subscriber's connect order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Tcp = 1,
    Udp = 2,
    Uds = 4,
    Shm = 8,
    Ws = 16,
}

impl ChannelType {
    /// Every transport, ascending by bit.
    pub const ALL: [ChannelType; 5] = [
        ChannelType::Tcp,
        ChannelType::Udp,
        ChannelType::Uds,
        ChannelType::Shm,
        ChannelType::Ws,
    ];

    pub fn bit(self) -> u32 {
        self as u32
    }

    /// Whether a reader on this transport notices when the writer goes away.
    ///
    /// Datagram and shared-memory transports keep "working" after the
    /// publisher disappears, so a subscriber on them has to be told about a
    /// new topic source explicitly and restart its session.
    pub fn can_detect_peer_disconnect(self) -> bool {
        matches!(self, ChannelType::Tcp | ChannelType::Uds | ChannelType::Ws)
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelType::Tcp => "tcp",
            ChannelType::Udp => "udp",
            ChannelType::Uds => "uds",
            ChannelType::Shm => "shm",
            ChannelType::Ws => "ws",
        };
        f.write_str(name)
    }
}

impl FromStr for ChannelType {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(ChannelType::Tcp),
            "udp" => Ok(ChannelType::Udp),
            "uds" => Ok(ChannelType::Uds),
            "shm" => Ok(ChannelType::Shm),
            "ws" => Ok(ChannelType::Ws),
            other => Err(TetherError::InvalidArgument(format!("unknown channel type {other:?}"))),
        }
    }
}

/// Bitmask of [`ChannelType`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelTypes(u32);

impl ChannelTypes {
    pub const NONE: ChannelTypes = ChannelTypes(0);

    /// Build a mask from raw bits, silently dropping unknown bits.
    pub fn from_bits(bits: u32) -> Self {
        let known = ChannelType::ALL.iter().fold(0, |acc, t| acc | t.bit());
        ChannelTypes(bits & known)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, channel_type: ChannelType) -> bool {
        self.0 & channel_type.bit() != 0
    }

    pub fn insert(&mut self, channel_type: ChannelType) {
        self.0 |= channel_type.bit();
    }

    pub fn intersection(self, other: ChannelTypes) -> ChannelTypes {
        ChannelTypes(self.0 & other.0)
    }

    /// Types present in the mask, ascending by bit.
    pub fn iter(self) -> impl Iterator<Item = ChannelType> {
        ChannelType::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

impl From<ChannelType> for ChannelTypes {
    fn from(channel_type: ChannelType) -> Self {
        ChannelTypes(channel_type.bit())
    }
}

impl FromIterator<ChannelType> for ChannelTypes {
    fn from_iter<I: IntoIterator<Item = ChannelType>>(iter: I) -> Self {
        let mut types = ChannelTypes::NONE;
        for t in iter {
            types.insert(t);
        }
        types
    }
}

impl BitOr for ChannelType {
    type Output = ChannelTypes;

    fn bitor(self, rhs: ChannelType) -> ChannelTypes {
        ChannelTypes(self.bit() | rhs.bit())
    }
}

impl BitOr<ChannelType> for ChannelTypes {
    type Output = ChannelTypes;

    fn bitor(self, rhs: ChannelType) -> ChannelTypes {
        ChannelTypes(self.0 | rhs.bit())
    }
}

impl BitOr for ChannelTypes {
    type Output = ChannelTypes;

    fn bitor(self, rhs: ChannelTypes) -> ChannelTypes {
        ChannelTypes(self.0 | rhs.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Advertised descriptors
// ─────────────────────────────────────────────────────────────────────────────

/// Where a channel can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ChannelAddress {
    /// TCP, UDP and WebSocket endpoints. For multicast UDP this is the group.
    Ip(SocketAddr),
    /// Unix domain socket path.
    Unix(PathBuf),
    /// Memory-mapped file and its total size in bytes.
    SharedMemory { path: PathBuf, size: usize },
}

/// Descriptor for a channel, carried in topic advertisements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelDef {
    pub channel_type: ChannelType,
    pub address: ChannelAddress,
}

impl ChannelDef {
    pub fn new(channel_type: ChannelType, address: ChannelAddress) -> Self {
        Self { channel_type, address }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match &self.address {
            ChannelAddress::Ip(addr) => Some(*addr),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            ChannelAddress::Ip(addr) => write!(f, "{}://{}", self.channel_type, addr),
            ChannelAddress::Unix(path) => write!(f, "{}://{}", self.channel_type, path.display()),
            ChannelAddress::SharedMemory { path, size } => {
                write!(f, "{}://{} ({} bytes)", self.channel_type, path.display(), size)
            }
        }
    }
}

/// Identity of a node talking to the master.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub id: Uuid,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: Uuid::new_v4(),
        }
    }
}

/// How messages on a topic are represented on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImplKind {
    /// Statically typed messages encoded as JSON.
    #[default]
    Json,
    /// Pre-serialized bytes whose type is named at registration time.
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicStatus {
    #[default]
    Registered,
    Unregistered,
}

/// Master-held record binding a topic to its type and advertised channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicInfo {
    pub topic: String,
    pub type_name: String,
    pub impl_kind: ImplKind,
    pub status: TopicStatus,
    pub topic_source: Vec<ChannelDef>,
}

impl TopicInfo {
    /// Mask of the channel types this topic is advertised on.
    pub fn channel_types(&self) -> ChannelTypes {
        self.topic_source.iter().map(|def| def.channel_type).collect()
    }

    pub fn channel_def(&self, channel_type: ChannelType) -> Option<&ChannelDef> {
        self.topic_source.iter().find(|def| def.channel_type == channel_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Registered,
    Unregistered,
}

/// Master-held record binding a service to its request/response types and
/// the endpoint its server answers on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service: String,
    pub request_type: String,
    pub response_type: String,
    pub status: ServiceStatus,
    pub service_source: ChannelDef,
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Socket-level failure kinds, translated from platform error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetError {
    ConnectionClosed,
    ConnectionReset,
    ConnectionRefused,
    SocketNotConnected,
    TimedOut,
    AddressInUse,
    Other,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NetError::ConnectionClosed => "connection closed",
            NetError::ConnectionReset => "connection reset",
            NetError::ConnectionRefused => "connection refused",
            NetError::SocketNotConnected => "socket not connected",
            NetError::TimedOut => "timed out",
            NetError::AddressInUse => "address in use",
            NetError::Other => "network failure",
        };
        f.write_str(text)
    }
}

/// Error type shared by every Tether operation.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TetherError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Network error ({kind}): {message}")]
    Network { kind: NetError, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown: {0}")]
    Unknown(String),
}

impl TetherError {
    pub fn network(kind: NetError, message: impl Into<String>) -> Self {
        TetherError::Network {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for the error handed to writers whose channel went away.
    pub fn connection_reset() -> Self {
        TetherError::network(NetError::ConnectionReset, "connection reset")
    }

    pub fn connection_closed() -> Self {
        TetherError::network(NetError::ConnectionClosed, "connection closed")
    }

    pub fn net_kind(&self) -> Option<NetError> {
        match self {
            TetherError::Network { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Prefix the message with context, keeping the kind.
    pub fn context(self, context: &str) -> Self {
        match self {
            TetherError::InvalidArgument(m) => TetherError::InvalidArgument(format!("{context}: {m}")),
            TetherError::NotFound(m) => TetherError::NotFound(format!("{context}: {m}")),
            TetherError::ResourceExhausted(m) => {
                TetherError::ResourceExhausted(format!("{context}: {m}"))
            }
            TetherError::Unavailable(m) => TetherError::Unavailable(format!("{context}: {m}")),
            TetherError::Aborted(m) => TetherError::Aborted(format!("{context}: {m}")),
            TetherError::Network { kind, message } => TetherError::Network {
                kind,
                message: format!("{context}: {message}"),
            },
            TetherError::Protocol(m) => TetherError::Protocol(format!("{context}: {m}")),
            TetherError::Unknown(m) => TetherError::Unknown(format!("{context}: {m}")),
        }
    }
}

impl From<std::io::Error> for TetherError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match e.kind() {
            ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe => NetError::ConnectionClosed,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => NetError::ConnectionReset,
            ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
            ErrorKind::NotConnected => NetError::SocketNotConnected,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => NetError::TimedOut,
            ErrorKind::AddrInUse => NetError::AddressInUse,
            ErrorKind::NotFound => return TetherError::NotFound(e.to_string()),
            ErrorKind::InvalidInput => return TetherError::InvalidArgument(e.to_string()),
            _ => NetError::Other,
        };
        TetherError::network(kind, e.to_string())
    }
}

/// Failures while turning messages into bytes and back.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageIoError {
    #[error("failed to serialize message: {0}")]
    Serialize(String),

    #[error("failed to deserialize message: {0}")]
    Deserialize(String),

    #[error("not enough buffer: need {needed} bytes, have {capacity}")]
    NotEnoughBuffer { needed: usize, capacity: usize },

    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

impl From<MessageIoError> for TetherError {
    fn from(e: MessageIoError) -> Self {
        match e {
            MessageIoError::NotEnoughBuffer { .. } => TetherError::ResourceExhausted(e.to_string()),
            MessageIoError::InvalidHeader(_) => TetherError::InvalidArgument(e.to_string()),
            other => TetherError::Aborted(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TetherError>;
