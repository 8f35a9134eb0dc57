//! Replication Peer Types
//!
//! Identifiers, configuration and state values stored for each
//! replication peer.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::paths::validate_segment;

/// Namespace assumed for table names without an explicit `ns:` prefix
pub const DEFAULT_NAMESPACE: &str = "default";

/// Identifier of a replication peer, used verbatim as a path segment
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Validate and wrap a peer id
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_segment(&id).map_err(|reason| Error::InvalidPeerId {
            id: id.clone(),
            reason,
        })?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for PeerId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of a source region server owning a replication queue
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerName(String);

impl ServerName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_segment(&name).map_err(|reason| Error::InvalidServerName {
            name: name.clone(),
            reason,
        })?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServerName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Whether a peer is receiving edits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerEnableState {
    Enabled,
    Disabled,
}

impl PeerEnableState {
    pub fn to_byte(self) -> u8 {
        match self {
            PeerEnableState::Disabled => 0,
            PeerEnableState::Enabled => 1,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PeerEnableState::Disabled),
            1 => Some(PeerEnableState::Enabled),
            _ => None,
        }
    }

    pub fn is_enabled(self) -> bool {
        self == PeerEnableState::Enabled
    }
}

impl From<bool> for PeerEnableState {
    fn from(enabled: bool) -> Self {
        if enabled {
            PeerEnableState::Enabled
        } else {
            PeerEnableState::Disabled
        }
    }
}

impl std::fmt::Display for PeerEnableState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEnableState::Enabled => write!(f, "ENABLED"),
            PeerEnableState::Disabled => write!(f, "DISABLED"),
        }
    }
}

/// Role of a peer in a synchronous replication relationship.
///
/// The storage layer persists whatever value it is given; legal
/// transitions are enforced by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SyncReplicationState {
    #[default]
    None,
    Active,
    DowngradeActive,
    Standby,
}

impl SyncReplicationState {
    pub fn to_byte(self) -> u8 {
        match self {
            SyncReplicationState::None => 0,
            SyncReplicationState::Active => 1,
            SyncReplicationState::DowngradeActive => 2,
            SyncReplicationState::Standby => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(SyncReplicationState::None),
            1 => Some(SyncReplicationState::Active),
            2 => Some(SyncReplicationState::DowngradeActive),
            3 => Some(SyncReplicationState::Standby),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncReplicationState::None => write!(f, "NONE"),
            SyncReplicationState::Active => write!(f, "ACTIVE"),
            SyncReplicationState::DowngradeActive => write!(f, "DOWNGRADE_ACTIVE"),
            SyncReplicationState::Standby => write!(f, "STANDBY"),
        }
    }
}

impl FromStr for SyncReplicationState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "NONE" => Ok(SyncReplicationState::None),
            "ACTIVE" => Ok(SyncReplicationState::Active),
            "DOWNGRADE_ACTIVE" => Ok(SyncReplicationState::DowngradeActive),
            "STANDBY" => Ok(SyncReplicationState::Standby),
            other => Err(Error::Config(format!(
                "unknown sync replication state: {}",
                other
            ))),
        }
    }
}

/// Configuration of a replication peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Remote cluster key (quorum address and base path)
    pub cluster_key: String,
    /// Custom replication endpoint implementation
    pub replication_endpoint_impl: Option<String>,
    /// Replicate every user table except the excluded ones
    pub replicate_all_user_tables: bool,
    /// Namespaces to replicate when not replicating all tables
    pub namespaces: BTreeSet<String>,
    /// Table -> column families to replicate (empty list = all families)
    pub table_cfs: BTreeMap<String, Vec<String>>,
    /// Namespaces skipped when replicating all tables
    pub exclude_namespaces: BTreeSet<String>,
    /// Table -> column families skipped when replicating all tables
    pub exclude_table_cfs: BTreeMap<String, Vec<String>>,
    /// Bandwidth limit in bytes per second, 0 means unlimited
    pub bandwidth: u64,
    /// Preserve per-region edit ordering
    pub serial: bool,
    /// Remote WAL directory used by synchronous replication
    pub remote_wal_dir: Option<String>,
    /// Free-form endpoint configuration
    pub configuration: BTreeMap<String, String>,
    /// Opaque peer data
    pub peer_data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl PeerConfig {
    /// Config replicating every user table to `cluster_key`
    pub fn new(cluster_key: impl Into<String>) -> Self {
        Self {
            cluster_key: cluster_key.into(),
            replication_endpoint_impl: None,
            replicate_all_user_tables: true,
            namespaces: BTreeSet::new(),
            table_cfs: BTreeMap::new(),
            exclude_namespaces: BTreeSet::new(),
            exclude_table_cfs: BTreeMap::new(),
            bandwidth: 0,
            serial: false,
            remote_wal_dir: None,
            configuration: BTreeMap::new(),
            peer_data: BTreeMap::new(),
        }
    }

    /// Replicate only the given namespaces and tables
    pub fn replicate_only(
        mut self,
        namespaces: impl IntoIterator<Item = String>,
        table_cfs: impl IntoIterator<Item = (String, Vec<String>)>,
    ) -> Self {
        self.replicate_all_user_tables = false;
        self.namespaces = namespaces.into_iter().collect();
        self.table_cfs = table_cfs.into_iter().collect();
        self.exclude_namespaces.clear();
        self.exclude_table_cfs.clear();
        self
    }

    /// Replicate everything except the given namespaces and tables
    pub fn replicate_all_except(
        mut self,
        namespaces: impl IntoIterator<Item = String>,
        table_cfs: impl IntoIterator<Item = (String, Vec<String>)>,
    ) -> Self {
        self.replicate_all_user_tables = true;
        self.exclude_namespaces = namespaces.into_iter().collect();
        self.exclude_table_cfs = table_cfs.into_iter().collect();
        self.namespaces.clear();
        self.table_cfs.clear();
        self
    }

    pub fn with_bandwidth(mut self, bytes_per_sec: u64) -> Self {
        self.bandwidth = bytes_per_sec;
        self
    }

    pub fn with_serial(mut self, serial: bool) -> Self {
        self.serial = serial;
        self
    }

    pub fn with_remote_wal_dir(mut self, dir: impl Into<String>) -> Self {
        self.remote_wal_dir = Some(dir.into());
        self
    }

    pub fn with_configuration(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.configuration.insert(key.into(), value.into());
        self
    }

    /// Check the include/exclude filters are consistent
    pub fn validate(&self) -> Result<()> {
        if self.cluster_key.trim().is_empty() {
            return Err(Error::InvalidPeerConfig("cluster key cannot be empty".into()));
        }

        if self.replicate_all_user_tables {
            if !self.namespaces.is_empty() || !self.table_cfs.is_empty() {
                return Err(Error::InvalidPeerConfig(
                    "namespaces and table-cfs must be empty when replicating all user tables"
                        .into(),
                ));
            }
        } else if !self.exclude_namespaces.is_empty() || !self.exclude_table_cfs.is_empty() {
            return Err(Error::InvalidPeerConfig(
                "exclude namespaces and exclude table-cfs require replicating all user tables"
                    .into(),
            ));
        }

        for ns in self.exclude_namespaces.iter() {
            for table in self.exclude_table_cfs.keys() {
                if namespace_of(table) == ns {
                    return Err(Error::InvalidPeerConfig(format!(
                        "table {} is already excluded by namespace {}",
                        table, ns
                    )));
                }
            }
        }

        for ns in self.namespaces.iter() {
            for table in self.table_cfs.keys() {
                if namespace_of(table) == ns {
                    return Err(Error::InvalidPeerConfig(format!(
                        "table {} is already included by namespace {}",
                        table, ns
                    )));
                }
            }
        }

        Ok(())
    }

    /// Whether edits to `table` (and optionally one column family) go to this peer
    pub fn needs_to_replicate(&self, table: &str, family: Option<&str>) -> bool {
        let ns = namespace_of(table);
        let table = qualified(table);

        if self.replicate_all_user_tables {
            if self.exclude_namespaces.contains(ns) {
                return false;
            }
            match self.exclude_table_cfs.get(&table) {
                None => true,
                // An empty family list excludes the whole table
                Some(cfs) if cfs.is_empty() => false,
                Some(cfs) => match family {
                    Some(cf) => !cfs.iter().any(|c| c == cf),
                    None => true,
                },
            }
        } else {
            if self.namespaces.contains(ns) {
                return true;
            }
            match self.table_cfs.get(&table) {
                None => false,
                Some(cfs) if cfs.is_empty() => true,
                Some(cfs) => match family {
                    Some(cf) => cfs.iter().any(|c| c == cf),
                    None => true,
                },
            }
        }
    }
}

fn namespace_of(table: &str) -> &str {
    match table.split_once(':') {
        Some((ns, _)) => ns,
        None => DEFAULT_NAMESPACE,
    }
}

fn qualified(table: &str) -> String {
    if table.contains(':') {
        table.to_string()
    } else {
        format!("{}:{}", DEFAULT_NAMESPACE, table)
    }
}

/// Replication progress of one source server's log stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePosition {
    /// Log file currently being shipped
    pub log_name: String,
    /// Byte offset within that log
    pub offset: u64,
}

impl QueuePosition {
    pub fn new(log_name: impl Into<String>, offset: u64) -> Self {
        Self {
            log_name: log_name.into(),
            offset,
        }
    }
}

/// A stored value together with the node version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: crate::coordination::Version,
}
