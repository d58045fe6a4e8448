//! Per-topic communication settings.
//!
//! Every field has a serde default so partial TOML/JSON documents load
//! cleanly; the CLI embeds these in its config file.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Cadence of the publisher send loop and the subscriber notify loop.
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,

    /// Capacity of the message pool.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Fixed send/receive buffer size in bytes, header included.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Grow buffers on demand instead of rejecting large messages.
    #[serde(default)]
    pub is_dynamic_buffer: bool,

    /// Ceiling for dynamic growth; larger messages are rejected as if the
    /// buffer were fixed.
    #[serde(default = "default_max_dynamic_buffer_size")]
    pub max_dynamic_buffer_size: usize,

    #[serde(default)]
    pub channel_settings: ChannelSettings,
}

impl Settings {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period_ms = period.as_millis() as u64;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_dynamic_buffer(mut self) -> Self {
        self.is_dynamic_buffer = true;
        self
    }

    pub fn with_max_dynamic_buffer_size(mut self, max: usize) -> Self {
        self.max_dynamic_buffer_size = max;
        self
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
            queue_size: default_queue_size(),
            buffer_size: default_buffer_size(),
            is_dynamic_buffer: false,
            max_dynamic_buffer_size: default_max_dynamic_buffer_size(),
            channel_settings: ChannelSettings::default(),
        }
    }
}

fn default_period_ms() -> u64 {
    1000
}
fn default_queue_size() -> usize {
    100
}
fn default_buffer_size() -> usize {
    1024
}
fn default_max_dynamic_buffer_size() -> usize {
    crate::buffer::DEFAULT_MAX_DYNAMIC_CAPACITY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Address server channels bind to and advertise.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default)]
    pub ws: WebSocketSettings,

    #[serde(default)]
    pub udp: UdpSettings,

    #[serde(default)]
    pub uds: UdsSettings,

    #[serde(default)]
    pub shm: ShmSettings,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            ws: WebSocketSettings::default(),
            udp: UdpSettings::default(),
            uds: UdsSettings::default(),
            shm: ShmSettings::default(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketSettings {
    /// Listen port, `0` for an ephemeral one.
    #[serde(default)]
    pub port: u16,

    #[serde(default = "default_true")]
    pub permessage_deflate_enabled: bool,

    #[serde(default = "default_window_bits")]
    pub server_max_window_bits: u8,

    /// Largest message accepted from a client.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            port: 0,
            permessage_deflate_enabled: true,
            server_max_window_bits: default_window_bits(),
            max_message_size: default_max_message_size(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_window_bits() -> u8 {
    15
}
fn default_max_message_size() -> usize {
    1 << 20
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UdpMode {
    /// Subscribers announce themselves with a join datagram.
    #[default]
    Unicast,
    /// Publisher sends to a random group in 239.0.0.0/8.
    Multicast,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UdpSettings {
    #[serde(default)]
    pub mode: UdpMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdsSettings {
    /// Directory holding the socket files.
    #[serde(default = "default_uds_dir")]
    pub dir: PathBuf,
}

impl Default for UdsSettings {
    fn default() -> Self {
        Self { dir: default_uds_dir() }
    }
}

fn default_uds_dir() -> PathBuf {
    std::env::temp_dir()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShmSettings {
    /// Size of the shared region in bytes.
    #[serde(default = "default_shm_size")]
    pub shm_size: usize,

    /// Directory holding the backing files; `/dev/shm` when present.
    #[serde(default = "default_shm_dir")]
    pub dir: PathBuf,
}

impl Default for ShmSettings {
    fn default() -> Self {
        Self {
            shm_size: default_shm_size(),
            dir: default_shm_dir(),
        }
    }
}

fn default_shm_size() -> usize {
    4096
}

fn default_shm_dir() -> PathBuf {
    let dev_shm = PathBuf::from("/dev/shm");
    if dev_shm.is_dir() { dev_shm } else { std::env::temp_dir() }
}
