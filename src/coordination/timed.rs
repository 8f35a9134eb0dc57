//! Operation Timeouts
//!
//! Wraps any coordination client so that no call blocks longer than the
//! configured operation timeout.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::timeout;

use super::watch::WatchSubscription;
use super::{CoordinationClient, CoordinationError, CoordinationResult, Version};

/// Coordination client with a per-operation deadline
pub struct TimedCoordinator {
    inner: Arc<dyn CoordinationClient>,
    operation_timeout: Duration,
}

impl TimedCoordinator {
    pub fn new(inner: Arc<dyn CoordinationClient>, operation_timeout: Duration) -> Self {
        Self {
            inner,
            operation_timeout,
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    async fn bounded<T, F>(&self, op: &'static str, path: &str, fut: F) -> CoordinationResult<T>
    where
        F: Future<Output = CoordinationResult<T>> + Send,
    {
        match timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "Coordination {} on {} timed out after {:?}",
                    op,
                    path,
                    self.operation_timeout
                );
                Err(CoordinationError::OperationTimeout)
            }
        }
    }
}

#[async_trait]
impl CoordinationClient for TimedCoordinator {
    async fn create(&self, path: &str, data: Bytes) -> CoordinationResult<()> {
        self.bounded("create", path, self.inner.create(path, data)).await
    }

    async fn get_data(&self, path: &str) -> CoordinationResult<(Bytes, Version)> {
        self.bounded("get_data", path, self.inner.get_data(path)).await
    }

    async fn set_data(
        &self,
        path: &str,
        data: Bytes,
        expected: Option<Version>,
    ) -> CoordinationResult<Version> {
        self.bounded("set_data", path, self.inner.set_data(path, data, expected))
            .await
    }

    async fn delete(&self, path: &str, recursive: bool) -> CoordinationResult<()> {
        self.bounded("delete", path, self.inner.delete(path, recursive))
            .await
    }

    async fn list_children(&self, path: &str) -> CoordinationResult<BTreeSet<String>> {
        self.bounded("list_children", path, self.inner.list_children(path))
            .await
    }

    async fn exists(&self, path: &str) -> CoordinationResult<bool> {
        self.bounded("exists", path, self.inner.exists(path)).await
    }

    async fn watch(&self, path: &str) -> CoordinationResult<WatchSubscription> {
        self.bounded("watch", path, self.inner.watch(path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinator;

    /// Client whose reads never complete
    struct Stalled;

    #[async_trait]
    impl CoordinationClient for Stalled {
        async fn create(&self, _path: &str, _data: Bytes) -> CoordinationResult<()> {
            Ok(())
        }

        async fn get_data(&self, _path: &str) -> CoordinationResult<(Bytes, Version)> {
            futures::future::pending().await
        }

        async fn set_data(
            &self,
            _path: &str,
            _data: Bytes,
            _expected: Option<Version>,
        ) -> CoordinationResult<Version> {
            futures::future::pending().await
        }

        async fn delete(&self, _path: &str, _recursive: bool) -> CoordinationResult<()> {
            Ok(())
        }

        async fn list_children(&self, _path: &str) -> CoordinationResult<BTreeSet<String>> {
            Ok(BTreeSet::new())
        }

        async fn exists(&self, _path: &str) -> CoordinationResult<bool> {
            Ok(false)
        }

        async fn watch(&self, path: &str) -> CoordinationResult<WatchSubscription> {
            Ok(crate::coordination::WatchHub::default().subscribe(path))
        }
    }

    #[tokio::test]
    async fn test_stalled_call_times_out() {
        let client = TimedCoordinator::new(Arc::new(Stalled), Duration::from_millis(20));
        assert_eq!(
            client.get_data("/x").await,
            Err(CoordinationError::OperationTimeout)
        );
        assert_eq!(client.exists("/x").await, Ok(false));
    }

    #[tokio::test]
    async fn test_passes_through() {
        let client = TimedCoordinator::new(
            Arc::new(MemoryCoordinator::new()),
            Duration::from_secs(5),
        );
        client.create("/a", Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(client.get_data("/a").await.unwrap().1, 0);
        assert_eq!(
            client.create("/a", Bytes::new()).await,
            Err(CoordinationError::NodeExists("/a".into()))
        );
    }
}
