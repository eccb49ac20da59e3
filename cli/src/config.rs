// Configuration management for the linkwire CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/linkwire/config.json
// - Linux: ~/.config/linkwire/config.json
// - Windows: %APPDATA%\linkwire\config.json

use anyhow::{Context, Result};
use linkwire_core::transport::tcp::DEFAULT_PORT;
use linkwire_core::transport::TcpTransportConfig;
use linkwire_core::{PeerId, SessionConfig};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the acceptor binds to
    pub listen_addr: SocketAddr,

    /// Peers (`host:port`) offered by `peers` and `/peers`
    pub known_peers: Vec<String>,

    /// Connect timeout in seconds (0 = OS default)
    pub connect_timeout_secs: u64,

    /// Session manager settings
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            known_peers: Vec::new(),
            connect_timeout_secs: 10,
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("linkwire");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Load config from `path`, writing defaults there if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .session
                .validate()
                .context("Invalid session settings in config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// TCP transport settings, optionally overriding the listen address
    pub fn tcp_config(&self, listen_override: Option<SocketAddr>) -> TcpTransportConfig {
        TcpTransportConfig::new(listen_override.unwrap_or(self.listen_addr))
            .with_connect_timeout(self.connect_timeout_secs)
    }

    /// Known peers as identifiers; blank entries are skipped
    pub fn known_peer_ids(&self) -> Vec<PeerId> {
        self.known_peers
            .iter()
            .filter_map(|p| PeerId::new(p.as_str()).ok())
            .collect()
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match key {
            "listen_addr" => {
                updated.listen_addr = value.parse().context("Invalid socket address")?;
            }
            "connect_timeout_secs" => {
                updated.connect_timeout_secs = value.parse().context("Invalid number")?;
            }
            "known_peers" => {
                updated.known_peers = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "service_name" => {
                updated.session.service_name = value.to_string();
            }
            "read_buffer_size" => {
                updated.session.read_buffer_size = value.parse().context("Invalid number")?;
            }
            "thread_name_prefix" => {
                updated.session.thread_name_prefix = value.to_string();
            }
            "end_session_on_write_failure" => {
                updated.session.end_session_on_write_failure =
                    value.parse().context("Invalid boolean value")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        updated.session.validate()?;
        *self = updated;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "listen_addr" => Some(self.listen_addr.to_string()),
            "connect_timeout_secs" => Some(self.connect_timeout_secs.to_string()),
            "known_peers" => Some(self.known_peers.join(",")),
            "service_name" => Some(self.session.service_name.clone()),
            "read_buffer_size" => Some(self.session.read_buffer_size.to_string()),
            "thread_name_prefix" => Some(self.session.thread_name_prefix.clone()),
            "end_session_on_write_failure" => {
                Some(self.session.end_session_on_write_failure.to_string())
            }
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        [
            "listen_addr",
            "connect_timeout_secs",
            "known_peers",
            "service_name",
            "read_buffer_size",
            "thread_name_prefix",
            "end_session_on_write_failure",
        ]
        .into_iter()
        .filter_map(|key| self.get(key).map(|value| (key.to_string(), value)))
        .collect()
    }
}
