//! In-Memory Coordinator
//!
//! A process-local coordination tree. Used as the test double for the
//! storage facade and for ephemeral single-process setups. Supports
//! fault injection so callers can exercise connection failures.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};

use super::watch::{WatchEventKind, WatchHub, WatchSubscription};
use super::{CoordinationClient, CoordinationError, CoordinationResult, Version};
use crate::paths;

#[derive(Debug, Clone)]
struct Node {
    data: Bytes,
    version: Version,
}

/// A fault to inject after a number of successful operations
#[derive(Debug, Clone)]
struct Fault {
    skip: usize,
    error: CoordinationError,
}

/// In-memory coordination tree
pub struct MemoryCoordinator {
    nodes: RwLock<BTreeMap<String, Node>>,
    faults: Mutex<VecDeque<Fault>>,
    watches: WatchHub,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            faults: Mutex::new(VecDeque::new()),
            watches: WatchHub::default(),
        }
    }

    /// Fail the next operation with `error`
    pub async fn fail_next(&self, error: CoordinationError) {
        self.fail_after(0, error).await;
    }

    /// Let `skip` operations succeed, then fail one with `error`
    pub async fn fail_after(&self, skip: usize, error: CoordinationError) {
        self.faults.lock().await.push_back(Fault { skip, error });
    }

    /// Number of nodes in the tree
    pub async fn node_count(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Overwrite a node's raw bytes without a version check
    pub async fn put_raw(&self, path: &str, data: Bytes) -> CoordinationResult<()> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        node.data = data;
        node.version += 1;
        Ok(())
    }

    async fn check_fault(&self) -> CoordinationResult<()> {
        let mut faults = self.faults.lock().await;
        if let Some(front) = faults.front_mut() {
            if front.skip == 0 {
                if let Some(fault) = faults.pop_front() {
                    return Err(fault.error);
                }
            } else {
                front.skip -= 1;
            }
        }
        Ok(())
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_exists(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
    match paths::parent(path) {
        Some("/") | None => true,
        Some(parent) => nodes.contains_key(parent),
    }
}

fn is_descendant(path: &str, ancestor: &str) -> bool {
    path.strip_prefix(ancestor)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

#[async_trait]
impl CoordinationClient for MemoryCoordinator {
    async fn create(&self, path: &str, data: Bytes) -> CoordinationResult<()> {
        self.check_fault().await?;
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(path) {
            return Err(CoordinationError::NodeExists(path.to_string()));
        }
        if !parent_exists(&nodes, path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        nodes.insert(path.to_string(), Node { data, version: 0 });
        drop(nodes);

        self.watches.publish(path, WatchEventKind::NodeCreated);
        Ok(())
    }

    async fn get_data(&self, path: &str) -> CoordinationResult<(Bytes, Version)> {
        self.check_fault().await?;
        let nodes = self.nodes.read().await;
        nodes
            .get(path)
            .map(|node| (node.data.clone(), node.version))
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))
    }

    async fn set_data(
        &self,
        path: &str,
        data: Bytes,
        expected: Option<Version>,
    ) -> CoordinationResult<Version> {
        self.check_fault().await?;
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;

        if let Some(expected) = expected {
            if node.version != expected {
                return Err(CoordinationError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }

        node.data = data;
        node.version += 1;
        let version = node.version;
        drop(nodes);

        self.watches.publish(path, WatchEventKind::NodeDataChanged);
        Ok(version)
    }

    async fn delete(&self, path: &str, recursive: bool) -> CoordinationResult<()> {
        self.check_fault().await?;
        let mut nodes = self.nodes.write().await;
        if !nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }

        let descendants: Vec<String> = nodes
            .keys()
            .filter(|p| is_descendant(p, path))
            .cloned()
            .collect();
        if !descendants.is_empty() && !recursive {
            return Err(CoordinationError::NotEmpty(path.to_string()));
        }

        // Deepest first, as a sequence of single-node deletes would
        let mut removed = descendants;
        removed.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        removed.push(path.to_string());
        for p in removed.iter() {
            nodes.remove(p);
        }
        drop(nodes);

        for p in removed.iter() {
            self.watches.publish(p, WatchEventKind::NodeDeleted);
        }
        Ok(())
    }

    async fn list_children(&self, path: &str) -> CoordinationResult<BTreeSet<String>> {
        self.check_fault().await?;
        let nodes = self.nodes.read().await;
        if path != "/" && !nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }

        Ok(nodes
            .keys()
            .filter(|p| paths::parent(p) == Some(path))
            .filter_map(|p| p.rsplit('/').next())
            .map(|name| name.to_string())
            .collect())
    }

    async fn exists(&self, path: &str) -> CoordinationResult<bool> {
        self.check_fault().await?;
        Ok(path == "/" || self.nodes.read().await.contains_key(path))
    }

    async fn watch(&self, path: &str) -> CoordinationResult<WatchSubscription> {
        self.check_fault().await?;
        Ok(self.watches.subscribe(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_requires_parent() {
        let zk = MemoryCoordinator::new();
        assert_eq!(
            zk.create("/a/b", Bytes::new()).await,
            Err(CoordinationError::NoNode("/a/b".into()))
        );
        zk.create("/a", Bytes::new()).await.unwrap();
        zk.create("/a/b", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(
            zk.create("/a/b", Bytes::new()).await,
            Err(CoordinationError::NodeExists("/a/b".into()))
        );
    }

    #[tokio::test]
    async fn test_conditional_set() {
        let zk = MemoryCoordinator::new();
        zk.create("/n", Bytes::from_static(b"v0")).await.unwrap();

        let (_, version) = zk.get_data("/n").await.unwrap();
        assert_eq!(version, 0);
        assert_eq!(
            zk.set_data("/n", Bytes::from_static(b"v1"), Some(0)).await,
            Ok(1)
        );
        assert!(matches!(
            zk.set_data("/n", Bytes::from_static(b"v2"), Some(0)).await,
            Err(CoordinationError::BadVersion { expected: 0, actual: 1, .. })
        ));
        assert_eq!(zk.set_data("/n", Bytes::from_static(b"v3"), None).await, Ok(2));
        assert_eq!(zk.get_data("/n").await.unwrap().0, Bytes::from_static(b"v3"));
    }

    #[tokio::test]
    async fn test_delete_and_children() {
        let zk = MemoryCoordinator::new();
        zk.ensure_path("/r/p/q").await.unwrap();
        zk.create("/r/p2", Bytes::new()).await.unwrap();

        assert_eq!(
            zk.list_children("/r").await.unwrap(),
            ["p", "p2"].iter().map(|s| s.to_string()).collect()
        );
        assert_eq!(
            zk.delete("/r/p", false).await,
            Err(CoordinationError::NotEmpty("/r/p".into()))
        );
        zk.delete("/r/p", true).await.unwrap();
        assert!(!zk.exists("/r/p/q").await.unwrap());
        assert_eq!(zk.node_count().await, 2);
        assert_eq!(
            zk.delete("/r/p", true).await,
            Err(CoordinationError::NoNode("/r/p".into()))
        );
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let zk = MemoryCoordinator::new();
        zk.fail_after(1, CoordinationError::ConnectionLoss).await;

        assert!(zk.exists("/x").await.is_ok());
        assert_eq!(zk.exists("/x").await, Err(CoordinationError::ConnectionLoss));
        assert!(zk.exists("/x").await.is_ok());
    }

    #[tokio::test]
    async fn test_watch_sees_subtree_changes() {
        let zk = MemoryCoordinator::new();
        zk.create("/w", Bytes::new()).await.unwrap();
        let mut sub = zk.watch("/w").await.unwrap();

        zk.create("/w/c", Bytes::new()).await.unwrap();
        let event = sub.next_event().await.unwrap();
        assert_eq!(event.path, "/w/c");
        assert_eq!(event.kind, WatchEventKind::NodeCreated);
    }
}
