// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! SISDK configuration

use crate::channel::ChannelId;
use crate::error::{Result, SisdkError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SisdkConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
}

/// Which message bus sessions publish through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// In-process broker, for embedding and tests
    Memory,
    /// External `sisdk-broker` reached over TCP
    #[default]
    Tcp,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    #[serde(default)]
    pub backend: BusBackend,

    /// Broker host
    #[serde(default = "default_bus_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_bus_port")]
    pub port: u16,

    /// Broker password, sent in the connection handshake when set
    #[serde(default)]
    pub password: Option<String>,
}

impl BusConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::default(),
            host: default_bus_host(),
            port: default_bus_port(),
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory holding one event-log database per live channel
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl StorageConfig {
    pub fn log_path(&self, channel: &ChannelId) -> PathBuf {
        self.log_dir.join(channel.log_file_name())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Written into every message header
    #[serde(default = "default_origin_server")]
    pub origin_server: String,

    /// State key holding the elapsed/countdown clock
    #[serde(default = "default_clock_key")]
    pub clock_key: String,

    /// State key holding the wall-clock time
    #[serde(default = "default_wall_clock_key")]
    pub wall_clock_key: String,

    /// Upper bound on waiting for a cancelled playback thread to exit
    #[serde(default = "default_replay_join_timeout_ms")]
    pub replay_join_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            origin_server: default_origin_server(),
            clock_key: default_clock_key(),
            wall_clock_key: default_wall_clock_key(),
            replay_join_timeout_ms: default_replay_join_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// TCP listen address of `sisdk-broker`
    #[serde(default = "default_broker_addr")]
    pub listen_addr: String,

    /// Password clients must present, if any
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_broker_addr(),
            password: None,
        }
    }
}

fn default_bus_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bus_port() -> u16 {
    6390
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./sisdk-data")
}

fn default_origin_server() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "sisdk".to_string())
}

fn default_clock_key() -> String {
    "CLOCK".to_string()
}

fn default_wall_clock_key() -> String {
    "TIME".to_string()
}

fn default_replay_join_timeout_ms() -> u64 {
    2_000
}

fn default_broker_addr() -> String {
    "127.0.0.1:6390".to_string()
}

impl SisdkConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment overrides
    ///
    /// Supported environment variables:
    /// - SISDK_BUS_BACKEND: `memory` or `tcp`
    /// - SISDK_BUS_HOST / SISDK_BUS_PORT / SISDK_BUS_PASSWORD: broker connection
    /// - SISDK_LOG_DIR: event-log directory
    /// - SISDK_ORIGIN_SERVER: header origin
    /// - SISDK_BROKER_ADDR: broker listen address
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(backend) = std::env::var("SISDK_BUS_BACKEND") {
            self.bus.backend = match backend.to_ascii_lowercase().as_str() {
                "memory" => BusBackend::Memory,
                "tcp" => BusBackend::Tcp,
                other => {
                    return Err(SisdkError::Config(format!("unknown bus backend '{}'", other)))
                }
            };
        }

        if let Ok(host) = std::env::var("SISDK_BUS_HOST") {
            self.bus.host = host;
        }

        if let Ok(port) = std::env::var("SISDK_BUS_PORT") {
            self.bus.port = port
                .parse()
                .map_err(|_| SisdkError::Config(format!("invalid SISDK_BUS_PORT '{}'", port)))?;
        }

        if let Ok(password) = std::env::var("SISDK_BUS_PASSWORD") {
            self.bus.password = Some(password);
        }

        if let Ok(dir) = std::env::var("SISDK_LOG_DIR") {
            self.storage.log_dir = PathBuf::from(dir);
        }

        if let Ok(origin) = std::env::var("SISDK_ORIGIN_SERVER") {
            self.session.origin_server = origin;
        }

        if let Ok(addr) = std::env::var("SISDK_BROKER_ADDR") {
            self.broker.listen_addr = addr;
        }

        Ok(self)
    }

    /// Load configuration from an optional file, then apply env overrides
    ///
    /// Environment variables that are set take priority over file values;
    /// anything left unset falls back to the defaults.
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let config = match config_file {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            }
            Some(path) => {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env()
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.clock_key == self.session.wall_clock_key {
            return Err(SisdkError::Config(
                "clock_key and wall_clock_key must differ".to_string(),
            ));
        }
        if self.bus.host.is_empty() {
            return Err(SisdkError::Config("bus.host is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SisdkConfig::default();
        assert_eq!(config.bus.address(), "127.0.0.1:6390");
        assert_eq!(config.session.clock_key, "CLOCK");
        assert_eq!(config.session.wall_clock_key, "TIME");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[bus]\nbackend = \"memory\"\nport = 7000\n\n[storage]\nlog_dir = \"/var/lib/sisdk\""
        )
        .unwrap();

        let config = SisdkConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bus.backend, BusBackend::Memory);
        assert_eq!(config.bus.port, 7000);
        assert_eq!(config.bus.host, "127.0.0.1");
        assert_eq!(config.storage.log_dir, PathBuf::from("/var/lib/sisdk"));

        let channel = ChannelId::live("CR", "42").unwrap();
        assert_eq!(
            config.storage.log_path(&channel),
            PathBuf::from("/var/lib/sisdk/CR_42_LIVE.db")
        );
    }

    #[test]
    fn test_same_clock_keys_rejected() {
        let mut config = SisdkConfig::default();
        config.session.wall_clock_key = config.session.clock_key.clone();
        assert!(config.validate().is_err());
    }
}
