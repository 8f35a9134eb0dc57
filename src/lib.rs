//! WolfPeer - Replication Peer Metadata Store
//!
//! Stores the replication peers of a WolfScale cluster in a hierarchical
//! coordination service so that every node sees the same peer set.
//!
//! # Architecture
//!
//! Each peer is a subtree of versioned nodes: an existence marker, its
//! encoded configuration, its enabled/disabled state, its synchronous
//! replication role, and one queue position per source server. The
//! coordination service only offers single-node conditional writes, so
//! WolfPeer leans on atomic node creation for peer uniqueness and on node
//! versions for optimistic concurrency, and does not pretend to offer
//! multi-node atomicity.
//!
//! # Features
//!
//! - Peer add/remove/list with race-free uniqueness
//! - Optimistic read-modify-write of peer config and enable state
//! - Sync replication state with two-phase transitions
//! - Per-source-server replication queue positions
//! - Versioned, checksummed binary payloads with LZ4 for large configs
//! - In-memory and SQLite coordination backends, bounded by operation timeouts
//! - Watch subscriptions over the peer tree
//! - Reconciliation of partially initialized peers

pub mod codec;
pub mod config;
pub mod coordination;
pub mod error;
pub mod maintenance;
pub mod paths;
pub mod peer;
pub mod storage;
pub mod translate;

pub use config::WolfPeerConfig;
pub use error::{Error, Result};
pub use storage::PeerStorage;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfPeerConfig;
    pub use crate::coordination::{CoordinationClient, CoordinationError, Version};
    pub use crate::error::{Error, Result};
    pub use crate::paths::PathLayout;
    pub use crate::peer::{
        PeerConfig, PeerEnableState, PeerId, QueuePosition, ServerName, SyncReplicationState,
        Versioned,
    };
    pub use crate::storage::PeerStorage;
}
