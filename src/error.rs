//! WolfPeer Error Types

use thiserror::Error;

use crate::codec::CodecError;
use crate::coordination::CoordinationError;

/// Result type alias for WolfPeer operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfPeer error types
#[derive(Error, Debug)]
pub enum Error {
    // Peer lifecycle errors
    #[error("Replication peer already exists: {peer_id}")]
    PeerAlreadyExists {
        peer_id: String,
        #[source]
        source: CoordinationError,
    },

    #[error("Replication peer not found: {peer_id}")]
    PeerNotFound {
        peer_id: String,
        #[source]
        source: CoordinationError,
    },

    #[error("Concurrent modification of peer {peer_id}, re-read and retry")]
    ConcurrentModification {
        peer_id: String,
        #[source]
        source: CoordinationError,
    },

    // Coordination service errors
    #[error("Coordination service unavailable")]
    CoordinationUnavailable {
        #[source]
        source: CoordinationError,
    },

    #[error("Coordination error: {0}")]
    Coordination(#[source] CoordinationError),

    // Payload errors
    #[error("Corrupt payload at {path}")]
    CorruptPayload {
        path: String,
        #[source]
        source: CodecError,
    },

    // Validation errors
    #[error("Invalid peer id {id:?}: {reason}")]
    InvalidPeerId { id: String, reason: &'static str },

    #[error("Invalid source server name {name:?}: {reason}")]
    InvalidServerName { name: String, reason: &'static str },

    #[error("Invalid peer config: {0}")]
    InvalidPeerConfig(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Configuration serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CoordinationUnavailable { .. } | Error::ConcurrentModification { .. }
        )
    }

    /// Check if this error needs an operator to look at stored data
    pub fn needs_operator(&self) -> bool {
        matches!(self, Error::CorruptPayload { .. })
    }

    /// The low-level coordination failure behind this error, if any
    pub fn coordination_cause(&self) -> Option<&CoordinationError> {
        match self {
            Error::PeerAlreadyExists { source, .. }
            | Error::PeerNotFound { source, .. }
            | Error::ConcurrentModification { source, .. }
            | Error::CoordinationUnavailable { source } => Some(source),
            Error::Coordination(source) => Some(source),
            _ => None,
        }
    }
}

impl From<CoordinationError> for Error {
    fn from(e: CoordinationError) -> Self {
        Error::Coordination(e)
    }
}
