//! WolfPeer Configuration
//!
//! This module provides configuration structures for the replication
//! peer store and its coordination backend.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::coordination::{
    CoordinationClient, MemoryCoordinator, SqliteCoordinator, TimedCoordinator,
};
use crate::paths::{validate_segment, PathLayout};
use crate::storage::PeerStorage;

/// Main WolfPeer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfPeerConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Coordination service configuration
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Data directory for the embedded coordination store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Which coordination backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Embedded SQLite tree under the data directory
    Sqlite,
    /// Process-local tree, lost on exit
    Memory,
}

/// Coordination service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Backend to use
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Base node for replication data
    #[serde(default = "default_base_znode")]
    pub base_znode: String,

    /// Child of the base node holding one node per peer
    #[serde(default = "default_peers_znode")]
    pub peers_znode: String,

    /// Per-operation timeout in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfpeer")
}

fn default_backend() -> BackendKind {
    BackendKind::Sqlite
}

fn default_base_znode() -> String {
    "/replication".to_string()
}

fn default_peers_znode() -> String {
    "peers".to_string()
}

fn default_operation_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            base_znode: default_base_znode(),
            peers_znode: default_peers_znode(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfPeerConfig {
    /// Default configuration for a node
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                id: node_id.into(),
                data_dir: default_data_dir(),
            },
            coordination: CoordinationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfPeerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if !self.coordination.base_znode.starts_with('/') {
            return Err(crate::Error::Config(
                "coordination.base_znode must be an absolute path".into(),
            ));
        }

        if let Err(reason) = validate_segment(self.coordination.peers_znode.trim_matches('/')) {
            return Err(crate::Error::Config(format!(
                "coordination.peers_znode {}",
                reason
            )));
        }

        if !["pretty", "compact"].contains(&self.logging.format.as_str()) {
            return Err(crate::Error::Config(format!(
                "logging.format must be \"pretty\" or \"compact\", got {:?}",
                self.logging.format
            )));
        }

        if self.coordination.operation_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "coordination.operation_timeout_ms must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the coordination store directory path
    pub fn coordination_dir(&self) -> PathBuf {
        self.node.data_dir.join("coordination")
    }

    /// Get operation timeout as Duration
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.operation_timeout_ms)
    }

    /// Path layout for the configured base nodes
    pub fn path_layout(&self) -> PathLayout {
        PathLayout::with_base(
            &self.coordination.base_znode,
            &self.coordination.peers_znode,
        )
    }

    /// Open the configured coordination backend, bounded by the operation timeout
    pub fn connect(&self) -> crate::Result<Arc<dyn CoordinationClient>> {
        let backend: Arc<dyn CoordinationClient> = match self.coordination.backend {
            BackendKind::Sqlite => Arc::new(SqliteCoordinator::open(self.coordination_dir())?),
            BackendKind::Memory => Arc::new(MemoryCoordinator::new()),
        };
        Ok(Arc::new(TimedCoordinator::new(
            backend,
            self.operation_timeout(),
        )))
    }

    /// Build a peer storage over the configured backend
    pub fn open_storage(&self) -> crate::Result<PeerStorage> {
        Ok(PeerStorage::new(self.connect()?, self.path_layout()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "node-1"
data_dir = "/var/lib/wolfpeer"

[coordination]
backend = "memory"
base_znode = "/hbase/replication"
operation_timeout_ms = 2500
"#;

        let config = WolfPeerConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.coordination.backend, BackendKind::Memory);
        assert_eq!(config.coordination.peers_znode, "peers");
        assert_eq!(config.operation_timeout(), Duration::from_millis(2500));
        assert_eq!(
            config.path_layout().peers_root(),
            "/hbase/replication/peers"
        );
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validation() {
        let mut config = WolfPeerConfig::new("node-1");
        assert!(config.validate().is_ok());

        config.coordination.base_znode = "replication".into();
        assert!(config.validate().is_err());

        let mut config = WolfPeerConfig::new("node-1");
        config.coordination.peers_znode = "a/b".into();
        assert!(config.validate().is_err());

        let mut config = WolfPeerConfig::new("node-1");
        config.logging.format = "json".into();
        assert!(config.validate().is_err());

        assert!(WolfPeerConfig::new("").validate().is_err());
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = WolfPeerConfig::new("node-7");
        let rendered = config.to_toml().unwrap();
        let parsed = WolfPeerConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed.node.id, "node-7");
        assert_eq!(parsed.coordination.backend, BackendKind::Sqlite);
    }

    #[tokio::test]
    async fn test_open_sqlite_storage() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WolfPeerConfig::new("node-1");
        config.node.data_dir = dir.path().to_path_buf();

        let storage = config.open_storage().unwrap();
        storage.ensure_layout().await.unwrap();
        assert!(storage.list_peer_ids().await.unwrap().is_empty());
        assert!(config.coordination_dir().join("coordination.db").exists());
    }
}
