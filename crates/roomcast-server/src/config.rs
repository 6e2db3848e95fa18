//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`roomcast.toml`)
//! - Environment variables (`ROOMCAST_*`, nested keys split on `__`)

use anyhow::{Context, Result};
use roomcast_core::{HubConfig, SessionConfig, StaticGate};
use roomcast_protocol::{WireFormat, MAX_MESSAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_PATHS: [&str; 3] = [
    "roomcast.toml",
    "/etc/roomcast/roomcast.toml",
    "~/.config/roomcast/roomcast.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-connection session settings.
    #[serde(default)]
    pub session: SessionSettings,

    /// Hub settings.
    #[serde(default)]
    pub hub: HubSettings,

    /// Identity extraction.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Admit every user into every room.
    #[serde(default)]
    pub open_rooms: bool,

    /// Rooms and their members.
    #[serde(default)]
    pub rooms: Vec<RoomConfig>,
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Mailbox capacity per connection.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Write deadline in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Liveness window in milliseconds.
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_ms: u64,

    /// Ping interval in milliseconds. Must be below `pong_timeout_ms`.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Largest accepted inbound frame in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Most messages coalesced into one outbound frame.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

/// Hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    /// Capacity of each hub intake queue.
    #[serde(default = "default_intake_capacity")]
    pub intake_capacity: usize,

    /// Drop a room once its last session leaves.
    #[serde(default = "default_true")]
    pub auto_delete_empty_rooms: bool,
}

/// Where the authenticated user id is read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Header set by the authenticating proxy.
    #[serde(default = "default_user_header")]
    pub user_header: String,

    /// Query parameter consulted when the header is absent. Off unless set,
    /// since clients control the query string.
    #[serde(default)]
    pub user_query: Option<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// A room and the users allowed into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Room id.
    pub id: String,

    /// Member user ids.
    #[serde(default)]
    pub members: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_mailbox_capacity() -> usize {
    256
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_pong_timeout() -> u64 {
    60_000
}

fn default_ping_interval() -> u64 {
    54_000 // 90% of the pong timeout
}

fn default_max_message_size() -> usize {
    MAX_MESSAGE_SIZE
}

fn default_max_batch() -> usize {
    64
}

fn default_intake_capacity() -> usize {
    1024
}

fn default_user_header() -> String {
    "x-user-id".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            session: SessionSettings::default(),
            hub: HubSettings::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
            open_rooms: false,
            rooms: Vec::new(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
            write_timeout_ms: default_write_timeout(),
            pong_timeout_ms: default_pong_timeout(),
            ping_interval_ms: default_ping_interval(),
            max_message_size: default_max_message_size(),
            max_batch: default_max_batch(),
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            intake_capacity: default_intake_capacity(),
            auto_delete_empty_rooms: true,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            user_header: default_user_header(),
            user_query: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl SessionSettings {
    /// Session configuration for a connection using `format`.
    #[must_use]
    pub fn to_session_config(&self, format: WireFormat) -> SessionConfig {
        SessionConfig {
            mailbox_capacity: self.mailbox_capacity,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            pong_timeout: Duration::from_millis(self.pong_timeout_ms),
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            max_message_size: self.max_message_size,
            max_batch: self.max_batch,
            format,
        }
    }
}

impl HubSettings {
    /// Hub configuration.
    #[must_use]
    pub fn to_hub_config(&self) -> HubConfig {
        HubConfig {
            intake_capacity: self.intake_capacity,
            auto_delete_empty_rooms: self.auto_delete_empty_rooms,
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, with
    /// environment overrides applied on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config source cannot be parsed or the result is
    /// invalid.
    pub fn load() -> Result<Self> {
        Self::load_from(find_config_file().as_deref())
    }

    /// Load configuration from `path`, or from defaults when there is no
    /// file, with environment overrides applied on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config source cannot be parsed or the result is
    /// invalid.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => {
                tracing::info!("Loading configuration from {}", path.display());
                Self::from_file(path)?
            }
            None => Self::default(),
        };

        let config: Config = ::config::Config::builder()
            .add_source(
                ::config::Config::try_from(&base).context("Failed to layer configuration")?,
            )
            .add_source(
                ::config::Environment::with_prefix("ROOMCAST")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file, without environment
    /// overrides or validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let session = &self.session;
        if session.ping_interval_ms == 0 || session.ping_interval_ms >= session.pong_timeout_ms {
            anyhow::bail!(
                "session.ping_interval_ms ({}) must be non-zero and below session.pong_timeout_ms ({})",
                session.ping_interval_ms,
                session.pong_timeout_ms
            );
        }
        if session.mailbox_capacity == 0 || session.max_batch == 0 {
            anyhow::bail!("session.mailbox_capacity and session.max_batch must be non-zero");
        }
        Ok(())
    }

    /// Build the room gate described by `open_rooms` and `[[rooms]]`.
    #[must_use]
    pub fn gate(&self) -> StaticGate {
        if self.open_rooms {
            return StaticGate::open();
        }
        self.rooms.iter().fold(StaticGate::new(), |gate, room| {
            gate.with_room(room.id.as_str(), room.members.iter().map(String::as_str))
        })
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

fn find_config_file() -> Option<PathBuf> {
    CONFIG_PATHS
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
        .find(|path| path.exists())
}
