//! Coordination Client Module
//!
//! The capability surface WolfPeer consumes from a hierarchical,
//! linearizable coordination service: a tree of versioned nodes with
//! change notifications.

mod memory;
mod sqlite;
mod timed;
pub mod watch;

pub use memory::MemoryCoordinator;
pub use sqlite::SqliteCoordinator;
pub use timed::TimedCoordinator;
pub use watch::{WatchEvent, WatchEventKind, WatchHub, WatchSubscription};

use std::collections::BTreeSet;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Node data version, incremented on every successful write
pub type Version = u32;

/// Failures reported by the coordination service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("no node: {0}")]
    NoNode(String),

    #[error("bad version for {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: Version,
        actual: Version,
    },

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("connection loss")]
    ConnectionLoss,

    #[error("session expired")]
    SessionExpired,

    #[error("operation timeout")]
    OperationTimeout,

    #[error("backend error: {0}")]
    Backend(String),
}

impl CoordinationError {
    /// Short code name, stable across releases
    pub fn code(&self) -> &'static str {
        match self {
            CoordinationError::NodeExists(_) => "NODEEXISTS",
            CoordinationError::NoNode(_) => "NONODE",
            CoordinationError::BadVersion { .. } => "BADVERSION",
            CoordinationError::NotEmpty(_) => "NOTEMPTY",
            CoordinationError::ConnectionLoss => "CONNECTIONLOSS",
            CoordinationError::SessionExpired => "SESSIONEXPIRED",
            CoordinationError::OperationTimeout => "OPERATIONTIMEOUT",
            CoordinationError::Backend(_) => "SYSTEMERROR",
        }
    }

    /// Transient failures the caller may retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordinationError::ConnectionLoss
                | CoordinationError::SessionExpired
                | CoordinationError::OperationTimeout
        )
    }
}

/// Result type for coordination client operations
pub type CoordinationResult<T> = std::result::Result<T, CoordinationError>;

/// Client for a hierarchical coordination service.
///
/// Every operation touches exactly one node (recursive delete aside) and
/// is linearizable per node. There is no multi-node atomicity.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Create a node. Fails with `NodeExists` if the path is taken and
    /// with `NoNode` if the parent does not exist.
    async fn create(&self, path: &str, data: Bytes) -> CoordinationResult<()>;

    /// Read a node's data and current version
    async fn get_data(&self, path: &str) -> CoordinationResult<(Bytes, Version)>;

    /// Overwrite a node's data. With `Some(expected)` the write only
    /// succeeds if the node is still at that version.
    async fn set_data(
        &self,
        path: &str,
        data: Bytes,
        expected: Option<Version>,
    ) -> CoordinationResult<Version>;

    /// Delete a node, and with `recursive` its whole subtree
    async fn delete(&self, path: &str, recursive: bool) -> CoordinationResult<()>;

    /// Names of a node's direct children
    async fn list_children(&self, path: &str) -> CoordinationResult<BTreeSet<String>>;

    async fn exists(&self, path: &str) -> CoordinationResult<bool>;

    /// Subscribe to changes of a node and its descendants
    async fn watch(&self, path: &str) -> CoordinationResult<WatchSubscription>;

    /// Create `path` and any missing ancestors, tolerating nodes that
    /// already exist
    async fn ensure_path(&self, path: &str) -> CoordinationResult<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self.create(&current, Bytes::new()).await {
                Ok(()) | Err(CoordinationError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
