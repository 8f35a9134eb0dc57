//! Coordination Tree Path Layout
//!
//! Pure mapping from peer ids to node paths. Nothing here touches the
//! coordination service.
//!
//! ```text
//! <base>/<peer_id>                       existence marker
//! <base>/<peer_id>/peer-state            enable state
//! <base>/<peer_id>/config                encoded peer config
//! <base>/<peer_id>/sync-rep-state        sync replication state
//! <base>/<peer_id>/new-sync-rep-state    pending sync replication state
//! <base>/<peer_id>/queues/<server>       queue position per source server
//! ```

use crate::peer::{PeerId, ServerName};

/// Path delimiter used by the coordination tree
pub const DELIMITER: char = '/';

pub const PEER_STATE_NODE: &str = "peer-state";
pub const CONFIG_NODE: &str = "config";
pub const SYNC_REP_STATE_NODE: &str = "sync-rep-state";
pub const NEW_SYNC_REP_STATE_NODE: &str = "new-sync-rep-state";
pub const QUEUES_NODE: &str = "queues";

/// Check that a string can be used verbatim as one path segment
pub fn validate_segment(segment: &str) -> std::result::Result<(), &'static str> {
    if segment.is_empty() {
        return Err("must not be empty");
    }
    if segment.contains(DELIMITER) {
        return Err("must not contain the path delimiter '/'");
    }
    if segment.contains('\0') {
        return Err("must not contain NUL");
    }
    if segment == "." || segment == ".." {
        return Err("must not be a relative path component");
    }
    Ok(())
}

/// Join a parent path and a child segment
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of a path, or `None` for the root
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind(DELIMITER) {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Path layout for replication peers under a fixed base path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLayout {
    peers_root: String,
}

impl PathLayout {
    /// Default layout rooted at `/replication/peers`
    pub fn new() -> Self {
        Self::with_base("/replication", "peers")
    }

    /// Layout rooted at `<base_znode>/<peers_znode>`
    pub fn with_base(base_znode: &str, peers_znode: &str) -> Self {
        let base = base_znode.trim_end_matches(DELIMITER);
        let base = if base.is_empty() { "/" } else { base };
        Self {
            peers_root: join(base, peers_znode.trim_matches(DELIMITER)),
        }
    }

    /// Parent of every peer root
    pub fn peers_root(&self) -> &str {
        &self.peers_root
    }

    pub fn peer_root(&self, peer_id: &PeerId) -> String {
        join(&self.peers_root, peer_id.as_str())
    }

    pub fn config(&self, peer_id: &PeerId) -> String {
        join(&self.peer_root(peer_id), CONFIG_NODE)
    }

    pub fn enable_state(&self, peer_id: &PeerId) -> String {
        join(&self.peer_root(peer_id), PEER_STATE_NODE)
    }

    pub fn sync_state(&self, peer_id: &PeerId) -> String {
        join(&self.peer_root(peer_id), SYNC_REP_STATE_NODE)
    }

    pub fn new_sync_state(&self, peer_id: &PeerId) -> String {
        join(&self.peer_root(peer_id), NEW_SYNC_REP_STATE_NODE)
    }

    pub fn queues_root(&self, peer_id: &PeerId) -> String {
        join(&self.peer_root(peer_id), QUEUES_NODE)
    }

    pub fn queue(&self, peer_id: &PeerId, server: &ServerName) -> String {
        join(&self.queues_root(peer_id), server.as_str())
    }

    /// Ancestors of the peers root, outermost first, including the peers root
    pub fn base_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        let mut current = self.peers_root.as_str();
        while current != "/" {
            paths.push(current.to_string());
            match parent(current) {
                Some(p) => current = p,
                None => break,
            }
        }
        paths.reverse();
        paths
    }

    /// Which peer a path belongs to, if it lies under the peers root
    pub fn peer_id_of(&self, path: &str) -> Option<PeerId> {
        let rest = path.strip_prefix(self.peers_root.as_str())?;
        let rest = rest.strip_prefix(DELIMITER)?;
        let segment = rest.split(DELIMITER).next()?;
        PeerId::new(segment).ok()
    }
}

impl Default for PathLayout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    #[test]
    fn test_default_layout() {
        let layout = PathLayout::new();
        let id = peer("1");

        assert_eq!(layout.peers_root(), "/replication/peers");
        assert_eq!(layout.peer_root(&id), "/replication/peers/1");
        assert_eq!(layout.config(&id), "/replication/peers/1/config");
        assert_eq!(layout.enable_state(&id), "/replication/peers/1/peer-state");
        assert_eq!(layout.sync_state(&id), "/replication/peers/1/sync-rep-state");
        assert_eq!(
            layout.new_sync_state(&id),
            "/replication/peers/1/new-sync-rep-state"
        );

        let server = ServerName::new("rs1.example.com,16020,1700000000000").unwrap();
        assert_eq!(
            layout.queue(&id, &server),
            "/replication/peers/1/queues/rs1.example.com,16020,1700000000000"
        );
    }

    #[test]
    fn test_custom_base() {
        let layout = PathLayout::with_base("/hbase/replication/", "/peers");
        assert_eq!(layout.peers_root(), "/hbase/replication/peers");
        assert_eq!(
            layout.base_paths(),
            vec!["/hbase", "/hbase/replication", "/hbase/replication/peers"]
        );

        let layout = PathLayout::with_base("/", "peers");
        assert_eq!(layout.peers_root(), "/peers");
        assert_eq!(layout.base_paths(), vec!["/peers"]);
    }

    #[test]
    fn test_segment_validation() {
        assert!(validate_segment("peer_1").is_ok());
        assert!(validate_segment("").is_err());
        assert!(validate_segment("a/b").is_err());
        assert!(validate_segment("..").is_err());
        assert!(validate_segment("a\0b").is_err());
    }

    #[test]
    fn test_distinct_ids_do_not_collide() {
        let layout = PathLayout::new();
        // "1" must not be a prefix-match for "10" when mapping back
        assert_ne!(layout.peer_root(&peer("1")), layout.peer_root(&peer("10")));
        assert_eq!(
            layout.peer_id_of("/replication/peers/10/config"),
            Some(peer("10"))
        );
        assert_eq!(layout.peer_id_of("/replication/peers"), None);
        assert_eq!(layout.peer_id_of("/replication/peersX/1"), None);
    }

    #[test]
    fn test_parent() {
        assert_eq!(parent("/a/b"), Some("/a"));
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/"), None);
    }
}
