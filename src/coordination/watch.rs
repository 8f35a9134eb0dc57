//! Watch Notifications
//!
//! Change events fanned out to subscribers over a broadcast channel.
//! A subscription only sees events at or below the path it watches, and
//! stops receiving once cancelled or dropped.

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

/// Kind of change observed on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WatchEventKind {
    NodeCreated,
    NodeDataChanged,
    NodeDeleted,
}

impl std::fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchEventKind::NodeCreated => f.pad("CREATED"),
            WatchEventKind::NodeDataChanged => f.pad("CHANGED"),
            WatchEventKind::NodeDeleted => f.pad("DELETED"),
        }
    }
}

/// A single change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

/// Broadcast point for change events
#[derive(Debug, Clone)]
pub struct WatchHub {
    sender: broadcast::Sender<WatchEvent>,
}

impl WatchHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; silently dropped when nobody is subscribed
    pub fn publish(&self, path: &str, kind: WatchEventKind) {
        let _ = self.sender.send(WatchEvent {
            path: path.to_string(),
            kind,
        });
    }

    pub fn subscribe(&self, path: &str) -> WatchSubscription {
        WatchSubscription {
            id: Uuid::new_v4(),
            path: path.to_string(),
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for WatchHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Cancellable subscription to a subtree's change events
#[derive(Debug)]
pub struct WatchSubscription {
    id: Uuid,
    path: String,
    receiver: broadcast::Receiver<WatchEvent>,
}

impl WatchSubscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Watched path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the next matching event. Returns `None` once the
    /// publisher is gone. Events lost to lag are skipped.
    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if covers(&self.path, &event.path) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "Watch {} on {} lagged, {} events skipped",
                        self.id,
                        self.path,
                        skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a stream of matching events
    pub fn into_stream(self) -> impl Stream<Item = WatchEvent> + Send + 'static {
        let path = self.path;
        BroadcastStream::new(self.receiver).filter_map(move |item| {
            let event = match item {
                Ok(event) if covers(&path, &event.path) => Some(event),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(_)) => None,
            };
            futures::future::ready(event)
        })
    }

    /// Stop receiving events
    pub fn cancel(self) {
        tracing::debug!("Watch {} on {} cancelled", self.id, self.path);
    }
}

fn covers(watched: &str, path: &str) -> bool {
    if watched == "/" || path == watched {
        return true;
    }
    path.strip_prefix(watched)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}
