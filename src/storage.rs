//! Replication Peer Storage
//!
//! CRUD and state operations for replication peers, persisted in a
//! coordination tree. Every call is a round trip to the coordination
//! service; nothing is cached and no locks are held here.
//!
//! Each node is written independently. A peer whose creation or removal
//! is interrupted can be left with only some of its nodes; such peers
//! are found and repaired by [`crate::maintenance`], not by this type.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::codec;
use crate::coordination::{CoordinationClient, CoordinationError, Version, WatchSubscription};
use crate::error::{Error, Result};
use crate::paths::PathLayout;
use crate::peer::{
    PeerConfig, PeerEnableState, PeerId, QueuePosition, ServerName, SyncReplicationState,
    Versioned,
};
use crate::translate::{corrupt, translate, translate_unscoped};

/// Replication peer metadata store
#[derive(Clone)]
pub struct PeerStorage {
    client: Arc<dyn CoordinationClient>,
    layout: PathLayout,
}

impl PeerStorage {
    pub fn new(client: Arc<dyn CoordinationClient>, layout: PathLayout) -> Self {
        Self { client, layout }
    }

    pub fn layout(&self) -> &PathLayout {
        &self.layout
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    /// Create the peers base path if it does not exist yet
    pub async fn ensure_layout(&self) -> Result<()> {
        self.client
            .ensure_path(self.layout.peers_root())
            .await
            .map_err(translate_unscoped)
    }

    /// Whether the peer's root node exists
    pub async fn peer_exists(&self, peer_id: &PeerId) -> Result<bool> {
        self.client
            .exists(&self.layout.peer_root(peer_id))
            .await
            .map_err(translate_unscoped)
    }

    // ========== Peer Lifecycle ==========

    /// Add a new peer.
    ///
    /// The root node is created first and decides which of several
    /// concurrent adds wins. Sub-nodes follow in the order config,
    /// enable state, sync state, new sync state. A failure after the root
    /// exists leaves the peer partially initialized.
    pub async fn add_peer(
        &self,
        peer_id: &PeerId,
        config: &PeerConfig,
        enabled: PeerEnableState,
        sync_state: SyncReplicationState,
    ) -> Result<()> {
        let config_bytes = codec::encode_config(config)
            .map_err(|e| Error::InvalidPeerConfig(format!("cannot encode config: {}", e)))?;

        let root = self.layout.peer_root(peer_id);
        match self.client.create(&root, Bytes::new()).await {
            Ok(()) => {}
            Err(CoordinationError::NoNode(_)) => {
                debug!("Peers base {} missing, creating it", self.layout.peers_root());
                self.ensure_layout().await?;
                self.client
                    .create(&root, Bytes::new())
                    .await
                    .map_err(|e| translate(e, peer_id))?;
            }
            Err(e) => return Err(translate(e, peer_id)),
        }

        let nodes = [
            (self.layout.config(peer_id), config_bytes),
            (
                self.layout.enable_state(peer_id),
                codec::encode_enable_state(enabled),
            ),
            (
                self.layout.sync_state(peer_id),
                codec::encode_sync_state(sync_state),
            ),
            (
                self.layout.new_sync_state(peer_id),
                codec::encode_sync_state(SyncReplicationState::None),
            ),
        ];

        for (path, data) in nodes {
            if let Err(e) = self.client.create(&path, data).await {
                warn!(
                    "Peer {} left partially initialized, creating {} failed: {}",
                    peer_id, path, e
                );
                return Err(translate(e, peer_id));
            }
        }

        info!(
            "Added replication peer {} ({}, sync state {})",
            peer_id, enabled, sync_state
        );
        Ok(())
    }

    /// Remove a peer and everything stored under it
    pub async fn remove_peer(&self, peer_id: &PeerId) -> Result<()> {
        self.client
            .delete(&self.layout.peer_root(peer_id), true)
            .await
            .map_err(|e| translate(e, peer_id))?;

        info!("Removed replication peer {}", peer_id);
        Ok(())
    }

    /// Ids of all peers, in no meaningful order
    pub async fn list_peer_ids(&self) -> Result<BTreeSet<PeerId>> {
        let names = match self.client.list_children(self.layout.peers_root()).await {
            Ok(names) => names,
            Err(CoordinationError::NoNode(_)) => return Ok(BTreeSet::new()),
            Err(e) => return Err(translate_unscoped(e)),
        };

        let mut ids = BTreeSet::new();
        for name in names {
            match PeerId::new(name.as_str()) {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(e) => warn!("Skipping unexpected node under peers base: {}", e),
            }
        }
        Ok(ids)
    }

    // ========== Peer Config ==========

    pub async fn get_peer_config(&self, peer_id: &PeerId) -> Result<PeerConfig> {
        Ok(self.get_peer_config_versioned(peer_id).await?.value)
    }

    /// Peer config together with the version it was read at
    pub async fn get_peer_config_versioned(
        &self,
        peer_id: &PeerId,
    ) -> Result<Versioned<PeerConfig>> {
        let path = self.layout.config(peer_id);
        let (data, version) = self
            .client
            .get_data(&path)
            .await
            .map_err(|e| translate(e, peer_id))?;
        let value = codec::decode_config(&data).map_err(|e| corrupt(&path, e))?;
        Ok(Versioned { value, version })
    }

    /// Replace a peer's config. Reads the current version and writes
    /// against it once; a concurrent writer in between surfaces as
    /// `ConcurrentModification`.
    pub async fn update_peer_config(
        &self,
        peer_id: &PeerId,
        config: &PeerConfig,
    ) -> Result<Version> {
        let path = self.layout.config(peer_id);
        let (_, version) = self
            .client
            .get_data(&path)
            .await
            .map_err(|e| translate(e, peer_id))?;
        self.update_peer_config_if(peer_id, config, version).await
    }

    /// Replace a peer's config only if it is still at `expected`
    pub async fn update_peer_config_if(
        &self,
        peer_id: &PeerId,
        config: &PeerConfig,
        expected: Version,
    ) -> Result<Version> {
        let data = codec::encode_config(config)
            .map_err(|e| Error::InvalidPeerConfig(format!("cannot encode config: {}", e)))?;
        let version = self
            .client
            .set_data(&self.layout.config(peer_id), data, Some(expected))
            .await
            .map_err(|e| translate(e, peer_id))?;

        info!("Updated config of peer {} (version {})", peer_id, version);
        Ok(version)
    }

    // ========== Enable State ==========

    pub async fn get_peer_enable_state(&self, peer_id: &PeerId) -> Result<PeerEnableState> {
        let path = self.layout.enable_state(peer_id);
        let (data, _) = self
            .client
            .get_data(&path)
            .await
            .map_err(|e| translate(e, peer_id))?;
        codec::decode_enable_state(&data).map_err(|e| corrupt(&path, e))
    }

    pub async fn is_peer_enabled(&self, peer_id: &PeerId) -> Result<bool> {
        Ok(self.get_peer_enable_state(peer_id).await?.is_enabled())
    }

    /// Enable or disable a peer with a read-then-conditional-write
    pub async fn set_peer_enable_state(
        &self,
        peer_id: &PeerId,
        state: PeerEnableState,
    ) -> Result<Version> {
        let path = self.layout.enable_state(peer_id);
        let (_, version) = self
            .client
            .get_data(&path)
            .await
            .map_err(|e| translate(e, peer_id))?;
        let version = self
            .client
            .set_data(&path, codec::encode_enable_state(state), Some(version))
            .await
            .map_err(|e| translate(e, peer_id))?;

        info!("Peer {} is now {}", peer_id, state);
        Ok(version)
    }

    // ========== Sync Replication State ==========

    /// Current sync replication state; NONE when it was never stored
    pub async fn get_sync_replication_state(
        &self,
        peer_id: &PeerId,
    ) -> Result<SyncReplicationState> {
        self.read_sync_node(peer_id, self.layout.sync_state(peer_id))
            .await
    }

    /// Current sync replication state with its node version. Unlike
    /// [`Self::get_sync_replication_state`] this requires the node to exist.
    pub async fn get_sync_replication_state_versioned(
        &self,
        peer_id: &PeerId,
    ) -> Result<Versioned<SyncReplicationState>> {
        let path = self.layout.sync_state(peer_id);
        let (data, version) = self
            .client
            .get_data(&path)
            .await
            .map_err(|e| translate(e, peer_id))?;
        let value = codec::decode_sync_state(&data).map_err(|e| corrupt(&path, e))?;
        Ok(Versioned { value, version })
    }

    /// Store a sync replication state. No transition checks; last writer wins.
    pub async fn set_sync_replication_state(
        &self,
        peer_id: &PeerId,
        state: SyncReplicationState,
    ) -> Result<()> {
        self.write_sync_node(peer_id, self.layout.sync_state(peer_id), state)
            .await?;
        info!("Sync replication state of peer {} set to {}", peer_id, state);
        Ok(())
    }

    /// Store a sync replication state only if the node is still at `expected`
    pub async fn set_sync_replication_state_if(
        &self,
        peer_id: &PeerId,
        state: SyncReplicationState,
        expected: Version,
    ) -> Result<Version> {
        let version = self
            .client
            .set_data(
                &self.layout.sync_state(peer_id),
                codec::encode_sync_state(state),
                Some(expected),
            )
            .await
            .map_err(|e| translate(e, peer_id))?;
        info!("Sync replication state of peer {} set to {}", peer_id, state);
        Ok(version)
    }

    /// Pending sync replication state of a two-phase transition
    pub async fn get_new_sync_replication_state(
        &self,
        peer_id: &PeerId,
    ) -> Result<SyncReplicationState> {
        self.read_sync_node(peer_id, self.layout.new_sync_state(peer_id))
            .await
    }

    pub async fn set_new_sync_replication_state(
        &self,
        peer_id: &PeerId,
        state: SyncReplicationState,
    ) -> Result<()> {
        self.write_sync_node(peer_id, self.layout.new_sync_state(peer_id), state)
            .await?;
        debug!("Pending sync replication state of peer {} set to {}", peer_id, state);
        Ok(())
    }

    /// Promote the pending sync replication state to current and clear
    /// the pending one. The two writes are independent: a failure between
    /// them leaves both nodes holding the new state.
    pub async fn transit_sync_replication_state(
        &self,
        peer_id: &PeerId,
    ) -> Result<SyncReplicationState> {
        let new_state = self.get_new_sync_replication_state(peer_id).await?;
        self.write_sync_node(peer_id, self.layout.sync_state(peer_id), new_state)
            .await?;
        self.write_sync_node(
            peer_id,
            self.layout.new_sync_state(peer_id),
            SyncReplicationState::None,
        )
        .await?;

        info!(
            "Peer {} transited to sync replication state {}",
            peer_id, new_state
        );
        Ok(new_state)
    }

    async fn read_sync_node(&self, peer_id: &PeerId, path: String) -> Result<SyncReplicationState> {
        match self.client.get_data(&path).await {
            Ok((data, _)) => codec::decode_sync_state(&data).map_err(|e| corrupt(&path, e)),
            Err(e @ CoordinationError::NoNode(_)) => {
                if self.peer_exists(peer_id).await? {
                    Ok(SyncReplicationState::None)
                } else {
                    Err(translate(e, peer_id))
                }
            }
            Err(e) => Err(translate(e, peer_id)),
        }
    }

    async fn write_sync_node(
        &self,
        peer_id: &PeerId,
        path: String,
        state: SyncReplicationState,
    ) -> Result<()> {
        let data = codec::encode_sync_state(state);
        match self.client.set_data(&path, data.clone(), None).await {
            Ok(_) => Ok(()),
            // Never stored for this peer; the parent decides existence
            Err(CoordinationError::NoNode(_)) => self
                .create_or_overwrite(&path, data)
                .await
                .map_err(|e| translate(e, peer_id)),
            Err(e) => Err(translate(e, peer_id)),
        }
    }

    // ========== Replication Queues ==========

    /// Queue position of `server` for this peer, `None` if it has none
    pub async fn get_queue_entry(
        &self,
        peer_id: &PeerId,
        server: &ServerName,
    ) -> Result<Option<QueuePosition>> {
        let path = self.layout.queue(peer_id, server);
        match self.client.get_data(&path).await {
            Ok((data, _)) => codec::decode_queue_position(&data)
                .map(Some)
                .map_err(|e| corrupt(&path, e)),
            Err(e @ CoordinationError::NoNode(_)) => {
                if self.peer_exists(peer_id).await? {
                    Ok(None)
                } else {
                    Err(translate(e, peer_id))
                }
            }
            Err(e) => Err(translate(e, peer_id)),
        }
    }

    /// Create or overwrite the queue position of `server`
    pub async fn set_queue_entry(
        &self,
        peer_id: &PeerId,
        server: &ServerName,
        position: &QueuePosition,
    ) -> Result<()> {
        let path = self.layout.queue(peer_id, server);
        let data = codec::encode_queue_position(position).map_err(|e| corrupt(&path, e))?;

        match self.client.set_data(&path, data.clone(), None).await {
            Ok(_) => {}
            Err(CoordinationError::NoNode(_)) => {
                match self
                    .client
                    .create(&self.layout.queues_root(peer_id), Bytes::new())
                    .await
                {
                    Ok(()) | Err(CoordinationError::NodeExists(_)) => {}
                    Err(e) => return Err(translate(e, peer_id)),
                }
                self.create_or_overwrite(&path, data)
                    .await
                    .map_err(|e| translate(e, peer_id))?;
            }
            Err(e) => return Err(translate(e, peer_id)),
        }

        debug!(
            "Queue {} of peer {} at {}:{}",
            server, peer_id, position.log_name, position.offset
        );
        Ok(())
    }

    /// Drop the queue entry of `server`; a missing entry is not an error
    pub async fn remove_queue_entry(&self, peer_id: &PeerId, server: &ServerName) -> Result<()> {
        match self
            .client
            .delete(&self.layout.queue(peer_id, server), false)
            .await
        {
            Ok(()) => {
                debug!("Removed queue {} of peer {}", server, peer_id);
                Ok(())
            }
            Err(CoordinationError::NoNode(_)) => Ok(()),
            Err(e) => Err(translate(e, peer_id)),
        }
    }

    /// Source servers holding a queue for this peer
    pub async fn list_queue_servers(&self, peer_id: &PeerId) -> Result<BTreeSet<String>> {
        match self
            .client
            .list_children(&self.layout.queues_root(peer_id))
            .await
        {
            Ok(names) => Ok(names),
            Err(e @ CoordinationError::NoNode(_)) => {
                if self.peer_exists(peer_id).await? {
                    Ok(BTreeSet::new())
                } else {
                    Err(translate(e, peer_id))
                }
            }
            Err(e) => Err(translate(e, peer_id)),
        }
    }

    // ========== Watches ==========

    /// Subscribe to changes anywhere under the peers base
    pub async fn watch_peers(&self) -> Result<WatchSubscription> {
        self.client
            .watch(self.layout.peers_root())
            .await
            .map_err(translate_unscoped)
    }

    async fn create_or_overwrite(
        &self,
        path: &str,
        data: Bytes,
    ) -> std::result::Result<(), CoordinationError> {
        match self.client.create(path, data.clone()).await {
            Ok(()) => Ok(()),
            Err(CoordinationError::NodeExists(_)) => {
                self.client.set_data(path, data, None).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{MemoryCoordinator, WatchEventKind};

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    fn server(name: &str) -> ServerName {
        ServerName::new(name).unwrap()
    }

    fn config(key: &str) -> PeerConfig {
        PeerConfig::new(key).with_bandwidth(1024)
    }

    async fn storage() -> (Arc<MemoryCoordinator>, PeerStorage) {
        let zk = Arc::new(MemoryCoordinator::new());
        let storage = PeerStorage::new(zk.clone(), PathLayout::new());
        storage.ensure_layout().await.unwrap();
        (zk, storage)
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let (_, storage) = storage().await;
        let id = peer("1");
        let c = config("zk1:2181:/hbase");

        storage
            .add_peer(&id, &c, PeerEnableState::Enabled, SyncReplicationState::None)
            .await
            .unwrap();

        assert_eq!(storage.get_peer_config(&id).await.unwrap(), c);
        assert_eq!(
            storage.get_peer_enable_state(&id).await.unwrap(),
            PeerEnableState::Enabled
        );
        assert!(storage.is_peer_enabled(&id).await.unwrap());
        assert_eq!(
            storage.get_sync_replication_state(&id).await.unwrap(),
            SyncReplicationState::None
        );
    }

    #[tokio::test]
    async fn test_add_creates_base_path() {
        let zk = Arc::new(MemoryCoordinator::new());
        let storage = PeerStorage::new(zk.clone(), PathLayout::new());

        storage
            .add_peer(
                &peer("1"),
                &config("zk1:2181:/hbase"),
                PeerEnableState::Disabled,
                SyncReplicationState::Standby,
            )
            .await
            .unwrap();

        assert!(zk.exists("/replication/peers/1/config").await.unwrap());
        assert_eq!(
            storage.get_sync_replication_state(&peer("1")).await.unwrap(),
            SyncReplicationState::Standby
        );
    }

    #[tokio::test]
    async fn test_duplicate_add_keeps_first_config() {
        let (_, storage) = storage().await;
        let id = peer("1");
        let first = config("zk1:2181:/hbase");

        storage
            .add_peer(&id, &first, PeerEnableState::Enabled, SyncReplicationState::None)
            .await
            .unwrap();

        let err = storage
            .add_peer(
                &id,
                &config("zk9:2181:/other"),
                PeerEnableState::Disabled,
                SyncReplicationState::Active,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerAlreadyExists { .. }));
        assert!(matches!(
            err.coordination_cause(),
            Some(CoordinationError::NodeExists(_))
        ));

        assert_eq!(storage.get_peer_config(&id).await.unwrap(), first);
        assert_eq!(
            storage.get_peer_enable_state(&id).await.unwrap(),
            PeerEnableState::Enabled
        );
    }

    #[tokio::test]
    async fn test_remove_then_read() {
        let (zk, storage) = storage().await;
        let id = peer("1");

        storage
            .add_peer(&id, &config("zk1:2181:/hbase"), PeerEnableState::Enabled, SyncReplicationState::None)
            .await
            .unwrap();
        storage
            .set_queue_entry(&id, &server("rs1,16020,1"), &QueuePosition::new("wal.1", 10))
            .await
            .unwrap();

        storage.remove_peer(&id).await.unwrap();

        assert!(matches!(
            storage.get_peer_config(&id).await,
            Err(Error::PeerNotFound { .. })
        ));
        assert!(matches!(
            storage.remove_peer(&id).await,
            Err(Error::PeerNotFound { .. })
        ));
        assert!(matches!(
            storage.set_peer_enable_state(&id, PeerEnableState::Disabled).await,
            Err(Error::PeerNotFound { .. })
        ));
        // Only the base path remains
        assert_eq!(zk.node_count().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_race() {
        let (_, storage) = storage().await;
        let storage = Arc::new(storage);
        let id = peer("race");

        let mut handles = Vec::new();
        for i in 0..16 {
            let storage = Arc::clone(&storage);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                let c = config(&format!("zk{}:2181:/hbase", i));
                let result = storage
                    .add_peer(&id, &c, PeerEnableState::Enabled, SyncReplicationState::None)
                    .await;
                (c, result)
            }));
        }

        let mut winners = Vec::new();
        let mut losers = 0;
        for handle in handles {
            let (c, result) = handle.await.unwrap();
            match result {
                Ok(()) => winners.push(c),
                Err(Error::PeerAlreadyExists { .. }) => losers += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(losers, 15);
        assert_eq!(storage.get_peer_config(&id).await.unwrap(), winners[0]);
    }

    #[tokio::test]
    async fn test_stale_update_rejected() {
        let (_, storage) = storage().await;
        let id = peer("1");
        storage
            .add_peer(&id, &config("zk1:2181:/hbase"), PeerEnableState::Enabled, SyncReplicationState::None)
            .await
            .unwrap();

        let read = storage.get_peer_config_versioned(&id).await.unwrap();

        let other = config("zk2:2181:/hbase");
        storage.update_peer_config(&id, &other).await.unwrap();

        let err = storage
            .update_peer_config_if(&id, &config("zk3:2181:/hbase"), read.version)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConcurrentModification { .. }));
        assert!(matches!(
            err.coordination_cause(),
            Some(CoordinationError::BadVersion { .. })
        ));
        assert_eq!(storage.get_peer_config(&id).await.unwrap(), other);
    }

    #[tokio::test]
    async fn test_update_missing_peer() {
        let (_, storage) = storage().await;
        assert!(matches!(
            storage
                .update_peer_config(&peer("ghost"), &config("zk1:2181:/hbase"))
                .await,
            Err(Error::PeerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_listing() {
        let (_, storage) = storage().await;
        for id in ["a", "b", "c"] {
            storage
                .add_peer(&peer(id), &config("zk1:2181:/hbase"), PeerEnableState::Enabled, SyncReplicationState::None)
                .await
                .unwrap();
        }
        storage.remove_peer(&peer("b")).await.unwrap();

        let ids = storage.list_peer_ids().await.unwrap();
        assert_eq!(ids, [peer("a"), peer("c")].into_iter().collect());
    }

    #[tokio::test]
    async fn test_listing_without_base() {
        let storage = PeerStorage::new(Arc::new(MemoryCoordinator::new()), PathLayout::new());
        assert!(storage.list_peer_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enable_state_transitions() {
        let (_, storage) = storage().await;
        let id = peer("1");
        storage
            .add_peer(&id, &config("zk1:2181:/hbase"), PeerEnableState::Disabled, SyncReplicationState::None)
            .await
            .unwrap();

        storage
            .set_peer_enable_state(&id, PeerEnableState::Enabled)
            .await
            .unwrap();
        assert!(storage.is_peer_enabled(&id).await.unwrap());

        storage
            .set_peer_enable_state(&id, PeerEnableState::Disabled)
            .await
            .unwrap();
        assert!(!storage.is_peer_enabled(&id).await.unwrap());

        // Config is untouched by state changes
        assert_eq!(storage.get_peer_config_versioned(&id).await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_sync_state_persists_any_value() {
        let (_, storage) = storage().await;
        let id = peer("1");
        storage
            .add_peer(&id, &config("zk1:2181:/hbase"), PeerEnableState::Enabled, SyncReplicationState::None)
            .await
            .unwrap();

        // ACTIVE straight from NONE is stored as given
        storage
            .set_sync_replication_state(&id, SyncReplicationState::Active)
            .await
            .unwrap();
        assert_eq!(
            storage.get_sync_replication_state(&id).await.unwrap(),
            SyncReplicationState::Active
        );

        let current = storage
            .get_sync_replication_state_versioned(&id)
            .await
            .unwrap();
        storage
            .set_sync_replication_state(&id, SyncReplicationState::Standby)
            .await
            .unwrap();
        assert!(matches!(
            storage
                .set_sync_replication_state_if(&id, SyncReplicationState::None, current.version)
                .await,
            Err(Error::ConcurrentModification { .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_state_defaults_to_none_when_missing() {
        let (zk, storage) = storage().await;
        let id = peer("legacy");
        zk.create("/replication/peers/legacy", Bytes::new()).await.unwrap();

        assert_eq!(
            storage.get_sync_replication_state(&id).await.unwrap(),
            SyncReplicationState::None
        );
        storage
            .set_sync_replication_state(&id, SyncReplicationState::DowngradeActive)
            .await
            .unwrap();
        assert_eq!(
            storage.get_sync_replication_state(&id).await.unwrap(),
            SyncReplicationState::DowngradeActive
        );

        assert!(matches!(
            storage.get_sync_replication_state(&peer("ghost")).await,
            Err(Error::PeerNotFound { .. })
        ));
        assert!(matches!(
            storage
                .set_sync_replication_state(&peer("ghost"), SyncReplicationState::Active)
                .await,
            Err(Error::PeerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_transit_sync_state() {
        let (_, storage) = storage().await;
        let id = peer("1");
        storage
            .add_peer(&id, &config("zk1:2181:/hbase"), PeerEnableState::Enabled, SyncReplicationState::Standby)
            .await
            .unwrap();

        storage
            .set_new_sync_replication_state(&id, SyncReplicationState::DowngradeActive)
            .await
            .unwrap();
        assert_eq!(
            storage.get_sync_replication_state(&id).await.unwrap(),
            SyncReplicationState::Standby
        );

        let state = storage.transit_sync_replication_state(&id).await.unwrap();
        assert_eq!(state, SyncReplicationState::DowngradeActive);
        assert_eq!(
            storage.get_sync_replication_state(&id).await.unwrap(),
            SyncReplicationState::DowngradeActive
        );
        assert_eq!(
            storage.get_new_sync_replication_state(&id).await.unwrap(),
            SyncReplicationState::None
        );
    }

    #[tokio::test]
    async fn test_queue_entries() {
        let (_, storage) = storage().await;
        let id = peer("1");
        let rs = server("rs1.example.com,16020,1700000000000");
        storage
            .add_peer(&id, &config("zk1:2181:/hbase"), PeerEnableState::Enabled, SyncReplicationState::None)
            .await
            .unwrap();

        assert_eq!(storage.get_queue_entry(&id, &rs).await.unwrap(), None);
        assert!(storage.list_queue_servers(&id).await.unwrap().is_empty());

        storage
            .set_queue_entry(&id, &rs, &QueuePosition::new("wal.100", 0))
            .await
            .unwrap();
        storage
            .set_queue_entry(&id, &rs, &QueuePosition::new("wal.100", 4096))
            .await
            .unwrap();
        assert_eq!(
            storage.get_queue_entry(&id, &rs).await.unwrap(),
            Some(QueuePosition::new("wal.100", 4096))
        );
        assert_eq!(
            storage.list_queue_servers(&id).await.unwrap(),
            std::iter::once(rs.to_string()).collect()
        );

        storage.remove_queue_entry(&id, &rs).await.unwrap();
        assert_eq!(storage.get_queue_entry(&id, &rs).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_queue_removal_is_idempotent() {
        let (_, storage) = storage().await;
        let id = peer("1");
        storage
            .add_peer(&id, &config("zk1:2181:/hbase"), PeerEnableState::Enabled, SyncReplicationState::None)
            .await
            .unwrap();

        storage
            .remove_queue_entry(&id, &server("never-created"))
            .await
            .unwrap();
        storage
            .remove_queue_entry(&peer("ghost"), &server("never-created"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_queue_on_missing_peer() {
        let (_, storage) = storage().await;
        let id = peer("ghost");
        assert!(matches!(
            storage
                .set_queue_entry(&id, &server("rs1"), &QueuePosition::new("wal.1", 1))
                .await,
            Err(Error::PeerNotFound { .. })
        ));
        assert!(matches!(
            storage.get_queue_entry(&id, &server("rs1")).await,
            Err(Error::PeerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_config() {
        let (zk, storage) = storage().await;
        let id = peer("1");
        storage
            .add_peer(&id, &config("zk1:2181:/hbase"), PeerEnableState::Enabled, SyncReplicationState::None)
            .await
            .unwrap();

        zk.put_raw("/replication/peers/1/config", Bytes::from_static(b"\x09junk"))
            .await
            .unwrap();
        let err = storage.get_peer_config(&id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::CorruptPayload {
                source: codec::CodecError::UnknownVersion(9),
                ..
            }
        ));

        zk.put_raw("/replication/peers/1/peer-state", Bytes::from_static(b"\x05"))
            .await
            .unwrap();
        assert!(matches!(
            storage.get_peer_enable_state(&id).await,
            Err(Error::CorruptPayload { .. })
        ));
    }

    #[tokio::test]
    async fn test_connection_loss_is_unavailable() {
        let (zk, storage) = storage().await;
        zk.fail_next(CoordinationError::SessionExpired).await;

        let err = storage.list_peer_ids().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.coordination_cause(), Some(&CoordinationError::SessionExpired));

        zk.fail_next(CoordinationError::ConnectionLoss).await;
        assert!(matches!(
            storage.get_peer_config(&peer("1")).await,
            Err(Error::CoordinationUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_partial_add_then_remove_and_retry() {
        let (zk, storage) = storage().await;
        let id = peer("1");
        let c = config("zk1:2181:/hbase");

        // Root and config succeed, enable state fails
        zk.fail_after(2, CoordinationError::ConnectionLoss).await;
        let err = storage
            .add_peer(&id, &c, PeerEnableState::Enabled, SyncReplicationState::None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CoordinationUnavailable { .. }));

        assert!(storage.list_peer_ids().await.unwrap().contains(&id));
        assert_eq!(storage.get_peer_config(&id).await.unwrap(), c);
        assert!(matches!(
            storage.get_peer_enable_state(&id).await,
            Err(Error::PeerNotFound { .. })
        ));

        // Retrying the add is refused until the leftovers are removed
        assert!(matches!(
            storage
                .add_peer(&id, &c, PeerEnableState::Enabled, SyncReplicationState::None)
                .await,
            Err(Error::PeerAlreadyExists { .. })
        ));
        storage.remove_peer(&id).await.unwrap();
        storage
            .add_peer(&id, &c, PeerEnableState::Enabled, SyncReplicationState::None)
            .await
            .unwrap();
        assert!(storage.is_peer_enabled(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_watch_peers() {
        let (_, storage) = storage().await;
        let mut watch = storage.watch_peers().await.unwrap();

        storage
            .add_peer(&peer("w"), &config("zk1:2181:/hbase"), PeerEnableState::Enabled, SyncReplicationState::None)
            .await
            .unwrap();

        let event = watch.next_event().await.unwrap();
        assert_eq!(event.path, "/replication/peers/w");
        assert_eq!(event.kind, WatchEventKind::NodeCreated);
        assert_eq!(storage.layout().peer_id_of(&event.path), Some(peer("w")));
        watch.cancel();
    }

    #[tokio::test]
    async fn test_sqlite_peer_survives_reopen() {
        use crate::coordination::SqliteCoordinator;

        let dir = tempfile::tempdir().unwrap();
        let id = peer("2");
        {
            let zk = Arc::new(SqliteCoordinator::open(dir.path().to_path_buf()).unwrap());
            let storage = PeerStorage::new(zk, PathLayout::new());
            storage
                .add_peer(&id, &config("zk2:2181:/hbase"), PeerEnableState::Disabled, SyncReplicationState::Standby)
                .await
                .unwrap();
            storage
                .set_queue_entry(&id, &server("rs1,16020,1"), &QueuePosition::new("wal.1", 42))
                .await
                .unwrap();
        }

        let zk = Arc::new(SqliteCoordinator::open(dir.path().to_path_buf()).unwrap());
        let storage = PeerStorage::new(zk, PathLayout::new());
        assert_eq!(storage.list_peer_ids().await.unwrap().len(), 1);
        assert_eq!(storage.get_peer_config(&id).await.unwrap(), config("zk2:2181:/hbase"));
        assert!(!storage.is_peer_enabled(&id).await.unwrap());
        assert_eq!(
            storage.get_sync_replication_state(&id).await.unwrap(),
            SyncReplicationState::Standby
        );
        assert_eq!(
            storage.get_queue_entry(&id, &server("rs1,16020,1")).await.unwrap(),
            Some(QueuePosition::new("wal.1", 42))
        );
    }
}
