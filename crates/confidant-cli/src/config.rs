//! Configuration system for the Confidant CLI.

use confidant_core::node::{BandwidthConfig, NodeConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Confidant configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Identity configuration
    #[serde(default)]
    pub node: IdentityConfig,
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Rate caps
    #[serde(default)]
    pub bandwidth: BandwidthSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Friends to trust and reach
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub friends: Vec<FriendConfig>,
}

/// Identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Identity file (id, key seed, certificate)
    #[serde(default = "default_identity_path")]
    pub identity_file: PathBuf,
    /// Trust table file
    #[serde(default = "default_trust_path")]
    pub trust_file: PathBuf,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Listen address for TCP and UDP
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Externally reachable address, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_addr: Option<String>,
    /// Inbound connections cannot reach us
    #[serde(default)]
    pub firewalled: bool,
    /// Seconds between background retries of offline friends; 0 disables
    #[serde(default = "default_background_retry")]
    pub background_retry_secs: u64,
}

/// Rate caps in bytes per second; 0 means unlimited
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct BandwidthSection {
    /// Node-wide inbound cap
    #[serde(default)]
    pub total_in: u64,
    /// Node-wide outbound cap
    #[serde(default)]
    pub total_out: u64,
    /// Per-friend inbound cap
    #[serde(default)]
    pub per_peer_in: u64,
    /// Per-friend outbound cap
    #[serde(default)]
    pub per_peer_out: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// One `[[friends]]` table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FriendConfig {
    /// Peer id
    pub id: u32,
    /// Display name
    pub name: String,
    /// DER certificate file, relative to the config file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<PathBuf>,
    /// LAN address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,
    /// External address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
}

// Default values

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("confidant")
}

fn default_identity_path() -> PathBuf {
    data_dir().join("identity.json")
}

fn default_trust_path() -> PathBuf {
    data_dir().join("trust.json")
}

fn default_listen_addr() -> String {
    "0.0.0.0:7812".to_string()
}

fn default_background_retry() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            identity_file: default_identity_path(),
            trust_file: default_trust_path(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            external_addr: None,
            firewalled: false,
            background_retry_secs: default_background_retry(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl FriendConfig {
    /// Parsed LAN address
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not `ipv4:port`.
    pub fn local_addr(&self) -> anyhow::Result<Option<SocketAddrV4>> {
        parse_v4(self.local.as_deref(), "local", self.id)
    }

    /// Parsed external address
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not `ipv4:port`.
    pub fn external_addr(&self) -> anyhow::Result<Option<SocketAddrV4>> {
        parse_v4(self.external.as_deref(), "external", self.id)
    }

    /// Certificate path resolved against `base`
    #[must_use]
    pub fn certificate_path(&self, base: &Path) -> Option<PathBuf> {
        self.certificate.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                base.join(p)
            }
        })
    }
}

fn parse_v4(addr: Option<&str>, what: &str, id: u32) -> anyhow::Result<Option<SocketAddrV4>> {
    addr.map(|a| {
        a.parse::<SocketAddrV4>()
            .map_err(|e| anyhow::anyhow!("friend {} has invalid {} address '{}': {}", id, what, a, e))
    })
    .transpose()
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("confidant/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.network.listen_addr.parse()?)
    }

    /// Parse the external address, if configured
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not `ipv4:port`.
    pub fn parse_external_addr(&self) -> anyhow::Result<Option<SocketAddrV4>> {
        self.network
            .external_addr
            .as_deref()
            .map(|a| a.parse::<SocketAddrV4>().map_err(anyhow::Error::from))
            .transpose()
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;
        self.parse_external_addr()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        let mut seen = std::collections::HashSet::new();
        for friend in &self.friends {
            if !seen.insert(friend.id) {
                anyhow::bail!("Friend {} listed twice", friend.id);
            }
            if friend.name.trim().is_empty() {
                anyhow::bail!("Friend {} has an empty name", friend.id);
            }
            friend.local_addr()?;
            friend.external_addr()?;
        }

        self.node_config()?.validate()?;
        Ok(())
    }

    /// Node settings derived from this file.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address cannot be parsed.
    pub fn node_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = NodeConfig {
            listen_addr: self.parse_listen_addr()?,
            ..NodeConfig::default()
        };
        config.connectivity.firewalled = self.network.firewalled;
        config.connectivity.background_retry = match self.network.background_retry_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let bw = self.bandwidth;
        config.bandwidth = BandwidthConfig {
            total_in: bw.total_in,
            total_out: bw.total_out,
            per_peer_in: bw.per_peer_in,
            per_peer_out: bw.per_peer_out,
        };
        Ok(config)
    }
}
