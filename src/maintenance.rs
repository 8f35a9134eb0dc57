//! Peer Reconciliation
//!
//! Offline sanity pass over every stored peer. Finds peers left partially
//! initialized by an interrupted add or remove and, on request, removes
//! them so the add can be retried. Peers with undecodable payloads are
//! only reported; those need an operator.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::peer::PeerId;
use crate::storage::PeerStorage;
use crate::translate::translate_unscoped;

/// Health of a single peer node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeHealth {
    Ok,
    Missing,
    Corrupt,
}

/// Result of inspecting one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerReport {
    pub peer_id: PeerId,
    pub config: NodeHealth,
    pub enable_state: NodeHealth,
    pub sync_state: NodeHealth,
}

impl PeerReport {
    /// Missing config or enable state: left behind by an interrupted add/remove
    pub fn is_incomplete(&self) -> bool {
        self.config == NodeHealth::Missing || self.enable_state == NodeHealth::Missing
    }

    pub fn is_corrupt(&self) -> bool {
        [self.config, self.enable_state, self.sync_state].contains(&NodeHealth::Corrupt)
    }

    pub fn is_healthy(&self) -> bool {
        !self.is_incomplete() && !self.is_corrupt()
    }
}

fn health<T>(result: Result<T>) -> Result<NodeHealth> {
    match result {
        Ok(_) => Ok(NodeHealth::Ok),
        Err(Error::PeerNotFound { .. }) => Ok(NodeHealth::Missing),
        Err(Error::CorruptPayload { .. }) => Ok(NodeHealth::Corrupt),
        Err(e) => Err(e),
    }
}

/// Inspect every node of one peer
pub async fn inspect_peer(storage: &PeerStorage, peer_id: &PeerId) -> Result<PeerReport> {
    let sync_path = storage.layout().sync_state(peer_id);
    let sync_state = if storage
        .client()
        .exists(&sync_path)
        .await
        .map_err(translate_unscoped)?
    {
        health(storage.get_sync_replication_state(peer_id).await)?
    } else {
        NodeHealth::Missing
    };

    Ok(PeerReport {
        peer_id: peer_id.clone(),
        config: health(storage.get_peer_config(peer_id).await)?,
        enable_state: health(storage.get_peer_enable_state(peer_id).await)?,
        sync_state,
    })
}

/// Inspect all peers
pub async fn inspect_all(storage: &PeerStorage) -> Result<Vec<PeerReport>> {
    let mut reports = Vec::new();
    for peer_id in storage.list_peer_ids().await? {
        reports.push(inspect_peer(storage, &peer_id).await?);
    }
    Ok(reports)
}

/// Remove every incomplete peer. Returns the ids removed.
pub async fn repair(storage: &PeerStorage, reports: &[PeerReport]) -> Result<Vec<PeerId>> {
    let mut removed = Vec::new();
    for report in reports.iter().filter(|r| r.is_incomplete()) {
        warn!(
            "Removing incomplete peer {} (config {:?}, enable state {:?})",
            report.peer_id, report.config, report.enable_state
        );
        match storage.remove_peer(&report.peer_id).await {
            Ok(()) => removed.push(report.peer_id.clone()),
            // Someone else finished the removal
            Err(Error::PeerNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    if !removed.is_empty() {
        info!("Reconciliation removed {} incomplete peers", removed.len());
    }
    Ok(removed)
}
