//! Coordination Failure Translation
//!
//! Maps raw coordination-service failures onto WolfPeer error kinds.
//! The raw failure always travels along as the error source.

use crate::codec::CodecError;
use crate::coordination::CoordinationError;
use crate::error::Error;
use crate::peer::PeerId;

/// Translate a failure from an operation on `peer_id`'s nodes
pub fn translate(source: CoordinationError, peer_id: &PeerId) -> Error {
    match source {
        CoordinationError::NodeExists(_) => Error::PeerAlreadyExists {
            peer_id: peer_id.to_string(),
            source,
        },
        CoordinationError::NoNode(_) => Error::PeerNotFound {
            peer_id: peer_id.to_string(),
            source,
        },
        CoordinationError::BadVersion { .. } => Error::ConcurrentModification {
            peer_id: peer_id.to_string(),
            source,
        },
        other => translate_unscoped(other),
    }
}

/// Translate a failure from an operation not tied to a single peer
pub fn translate_unscoped(source: CoordinationError) -> Error {
    if source.is_transient() {
        Error::CoordinationUnavailable { source }
    } else {
        Error::Coordination(source)
    }
}

/// Wrap a payload decode failure for the node at `path`
pub fn corrupt(path: &str, source: CodecError) -> Error {
    Error::CorruptPayload {
        path: path.to_string(),
        source,
    }
}
