//! Configuration management

use crate::protocol::DEFAULT_PORT;
use crate::server::DEFAULT_MAX_MESSAGE_SIZE;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub chat: ChatConfig,
}

/// Network and connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind
    pub host: String,

    /// TCP port, 0 picks an ephemeral one
    pub port: u16,

    /// Seconds a new connection has to send its login or resume line
    pub auth_timeout_secs: u64,

    /// Read timeout while serving; a timeout only re-arms the read
    pub read_timeout_secs: u64,

    /// How long a send may wait on a full outbound queue
    pub send_timeout_ms: u64,

    /// Outbound queue depth per connection
    pub outbound_buffer: usize,

    /// Longest accepted line in bytes, newline excluded
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            auth_timeout_secs: 10,
            read_timeout_secs: 60,
            send_timeout_ms: 200,
            outbound_buffer: 64,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Persistence settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file, defaults under the user data dir
    pub database_path: Option<PathBuf>,

    /// Keep everything in memory (nothing survives a restart)
    pub in_memory: bool,
}

/// Chat room settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Minutes before expiry at which the warning goes out
    pub warning_lead_minutes: u64,

    /// Broadcast payloads kept per room
    pub history_limit: usize,

    /// Replay the room log to a newly connected chat socket
    pub replay_history: bool,

    /// DiceBear style used for generated avatars
    pub avatar_style: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            warning_lead_minutes: 5,
            history_limit: 100,
            replay_history: false,
            avatar_style: "adventurer".to_string(),
        }
    }
}

impl Config {
    /// Load config from the default location, or return defaults if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`, or return defaults if the file does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Invalid config {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tutorchat")
            .join("config.toml")
    }

    /// Socket address the server binds
    pub fn addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.server.host, self.server.port);
        addr.parse()
            .with_context(|| format!("Invalid listen address {}", addr))
    }

    /// Database file, falling back to `<data_dir>/tutorchat/tutorchat.db`
    pub fn database_path(&self) -> PathBuf {
        self.storage.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tutorchat")
                .join("tutorchat.db")
        })
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.server.auth_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.server.read_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.server.send_timeout_ms)
    }

    pub fn warning_lead(&self) -> Duration {
        Duration::from_secs(self.chat.warning_lead_minutes * 60)
    }
}
