//! # Configuration
//!
//! PeerBox keeps its settings in `config.toml` inside a platform-appropriate
//! directory (e.g. `~/.config/peerbox/` on Linux). Setting `PEERBOX_HOME`
//! moves the whole installation, account included, somewhere else.
//!
//! The file holds node settings only; keys, friends and files live in the
//! account directory.

use crate::dht::{DhtConfig, Peer};
use crate::discovery::{StaticResolver, DEFAULT_ANNOUNCE_PORT};
use crate::fingerprint::Fingerprint;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.toml";

/// Environment variable overriding the configuration directory.
pub const HOME_ENV: &str = "PEERBOX_HOME";

pub const DEFAULT_LISTEN_PORT: u16 = 41337;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the account: encrypted identity, keyring and file tree.
    pub account_dir: PathBuf,
    pub listen_port: u16,
    pub announce_port: u16,
    pub lan_discovery: bool,
    /// Extra DNS names and IP addresses put into the TLS certificate.
    pub advertised_names: Vec<String>,
    /// Friends reachable at fixed addresses.
    pub static_peers: Vec<PeerEntry>,
    /// DHT nodes contacted at startup.
    pub bootstrap_peers: Vec<PeerEntry>,
    pub request_timeout_secs: u64,
    /// Confirm DHT STORE requests with a ping to the announced address.
    pub dht_verify_store: bool,
    pub dht_value_ttl_secs: u64,

    #[serde(skip)]
    pub config_file_path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub fingerprint: Fingerprint,
    pub address: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        let dht = DhtConfig::default();
        Self {
            account_dir: PathBuf::new(),
            listen_port: DEFAULT_LISTEN_PORT,
            announce_port: DEFAULT_ANNOUNCE_PORT,
            lan_discovery: true,
            advertised_names: Vec::new(),
            static_peers: Vec::new(),
            bootstrap_peers: Vec::new(),
            request_timeout_secs: 30,
            dht_verify_store: dht.verify_store,
            dht_value_ttl_secs: dht.value_ttl.as_secs(),
            config_file_path: PathBuf::new(),
        }
    }
}

impl Config {
    /// Writes a default configuration to `dir`.
    pub async fn init_in(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let config = Self {
            account_dir: dir.join("account"),
            config_file_path: dir.join(CONFIG_FILE),
            ..Self::default()
        };
        config.save().await?;
        Ok(config)
    }

    /// Loads the configuration in `dir`, writing a default one only when
    /// none exists yet. An existing file is never rewritten.
    pub async fn load_or_init_in(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load_from(&path).await
        } else {
            Self::init_in(dir).await
        }
    }

    pub async fn load_or_init() -> Result<Self> {
        Self::load_or_init_in(&Self::config_dir()?).await
    }

    pub async fn load() -> Result<Self> {
        Self::load_from(&Self::config_dir()?.join(CONFIG_FILE)).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("PeerBox not initialized. Run 'peerbox init' first.");
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config =
            toml::from_str(&content).with_context(|| format!("Invalid configuration in {}", path.display()))?;
        config.config_file_path = path.to_path_buf();
        if config.account_dir.as_os_str().is_empty() {
            config.account_dir = path
                .parent()
                .map(|dir| dir.join("account"))
                .unwrap_or_else(|| PathBuf::from("account"));
        }
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&self.config_file_path, content)
            .await
            .with_context(|| format!("Failed to write {}", self.config_file_path.display()))?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    /// Adds or replaces the static address of `fingerprint`.
    pub fn set_static_peer(&mut self, fingerprint: Fingerprint, address: SocketAddr) {
        self.static_peers.retain(|p| p.fingerprint != fingerprint);
        self.static_peers.push(PeerEntry { fingerprint, address });
    }

    pub fn static_resolver(&self) -> StaticResolver {
        StaticResolver::new(
            self.static_peers
                .iter()
                .map(|p| (p.fingerprint, p.address))
                .collect(),
        )
    }

    pub fn bootstrap_peers(&self) -> Vec<Peer> {
        self.bootstrap_peers
            .iter()
            .map(|p| Peer::new(p.fingerprint, p.address))
            .collect()
    }

    pub fn dht_config(&self) -> DhtConfig {
        DhtConfig {
            verify_store: self.dht_verify_store,
            value_ttl: Duration::from_secs(self.dht_value_ttl_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn config_dir() -> Result<PathBuf> {
        if let Some(home) = std::env::var_os(HOME_ENV) {
            return Ok(PathBuf::from(home));
        }
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("peerbox");
        Ok(config_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::init_in(temp_dir.path()).await.unwrap();
        assert_eq!(config.account_dir, temp_dir.path().join("account"));

        let loaded = Config::load_from(&temp_dir.path().join(CONFIG_FILE)).await.unwrap();
        assert_eq!(loaded.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(loaded.announce_port, DEFAULT_ANNOUNCE_PORT);
        assert!(loaded.lan_discovery);
        assert!(loaded.dht_verify_store);
        assert_eq!(loaded.account_dir, config.account_dir);
    }

    #[tokio::test]
    async fn test_load_uninitialized_fails() {
        let temp_dir = TempDir::new().unwrap();
        let err = Config::load_from(&temp_dir.path().join(CONFIG_FILE)).await.unwrap_err();
        assert!(err.to_string().contains("not initialized"));
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "listen_port = 5000\n").unwrap();

        let config = Config::load_from(&path).await.unwrap();
        assert_eq!(config.listen_port, 5000);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.account_dir, temp_dir.path().join("account"));
    }

    #[tokio::test]
    async fn test_static_peers_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::init_in(temp_dir.path()).await.unwrap();
        let fp = Fingerprint::from_bytes([3; 20]);
        config.set_static_peer(fp, "10.0.0.1:7000".parse().unwrap());
        config.set_static_peer(fp, "10.0.0.2:7000".parse().unwrap());
        config.save().await.unwrap();

        let loaded = Config::load_from(config.config_path()).await.unwrap();
        assert_eq!(
            loaded.static_peers,
            vec![PeerEntry {
                fingerprint: fp,
                address: "10.0.0.2:7000".parse().unwrap(),
            }]
        );
        assert_eq!(loaded.bootstrap_peers().len(), 0);
    }

    #[tokio::test]
    async fn test_load_or_init_keeps_existing_settings() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::load_or_init_in(temp_dir.path()).await.unwrap();
        assert_eq!(config.listen_port, DEFAULT_LISTEN_PORT);

        config.listen_port = 5000;
        config.set_static_peer(Fingerprint::from_bytes([9; 20]), "10.0.0.9:7000".parse().unwrap());
        config.save().await.unwrap();

        let again = Config::load_or_init_in(temp_dir.path()).await.unwrap();
        assert_eq!(again.listen_port, 5000);
        assert_eq!(again.static_peers.len(), 1);
    }

    #[tokio::test]
    async fn test_load_or_init_rejects_broken_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "listen_port = \"nope\"\n").unwrap();

        assert!(Config::load_or_init_in(temp_dir.path()).await.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "listen_port = \"nope\"\n");
    }

    #[test]
    fn test_dht_config_mapping() {
        let config = Config {
            dht_verify_store: false,
            dht_value_ttl_secs: 60,
            ..Config::default()
        };
        let dht = config.dht_config();
        assert!(!dht.verify_store);
        assert_eq!(dht.value_ttl, Duration::from_secs(60));
    }
}
