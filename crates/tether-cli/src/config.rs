//! Demo configuration – reads/writes `~/.tether/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tether_middleware::Settings;
use tether_types::{ChannelType, ChannelTypes};
use tracing::warn;

/// Persisted demo configuration stored in `~/.tether/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Base name; the demo runs `<node_name>-pub` and `<node_name>-sub`.
    #[serde(default = "default_node_name")]
    pub node_name: String,

    #[serde(default = "default_topic")]
    pub topic: String,

    /// Channels the publisher serves and the subscriber may connect over.
    #[serde(default = "default_transports")]
    pub transports: Vec<ChannelType>,

    #[serde(default)]
    pub settings: Settings,
}

fn default_node_name() -> String {
    "tether".to_string()
}
fn default_topic() -> String {
    "/chatter".to_string()
}
fn default_transports() -> Vec<ChannelType> {
    vec![ChannelType::Tcp]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            topic: default_topic(),
            transports: default_transports(),
            settings: Settings::default(),
        }
    }
}

impl Config {
    pub fn channel_types(&self) -> ChannelTypes {
        self.transports.iter().copied().collect()
    }
}

/// Return the path to `~/.tether/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".tether").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `TETHER_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TETHER_NODE_NAME` | `node_name` |
/// | `TETHER_TOPIC` | `topic` |
/// | `TETHER_PERIOD_MS` | `settings.period_ms` |
/// | `TETHER_TRANSPORTS` | `transports` (comma separated, e.g. `tcp,shm`) |
/// | `TETHER_WS_PORT` | `settings.channel_settings.ws.port` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("TETHER_NODE_NAME") {
        cfg.node_name = v;
    }
    if let Ok(v) = std::env::var("TETHER_TOPIC") {
        cfg.topic = v;
    }
    if let Some(period) = parsed_var::<u64>("TETHER_PERIOD_MS") {
        cfg.settings.period_ms = period;
    }
    if let Some(port) = parsed_var::<u16>("TETHER_WS_PORT") {
        cfg.settings.channel_settings.ws.port = port;
    }
    if let Ok(v) = std::env::var("TETHER_TRANSPORTS") {
        match parse_transports(&v) {
            Ok(transports) => cfg.transports = transports,
            Err(e) => warn!(value = %v, error = %e, "ignoring TETHER_TRANSPORTS"),
        }
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Parse `tcp, udp,ws` into channel types, rejecting empty lists.
pub fn parse_transports(value: &str) -> Result<Vec<ChannelType>, String> {
    let transports = value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<ChannelType>().map_err(|e| e.to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    if transports.is_empty() {
        return Err("no transports listed".to_string());
    }
    Ok(transports)
}

/// Save the config to disk, creating `~/.tether/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
