//! SQLite Coordinator
//!
//! Durable coordination tree backed by an embedded SQLite database.
//! Survives process restarts and can be shared by several processes on
//! one host; watches only fire for changes made through the same
//! instance.

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::Mutex;

use super::watch::{WatchEventKind, WatchHub, WatchSubscription};
use super::{CoordinationClient, CoordinationError, CoordinationResult, Version};
use crate::paths;

/// Coordination tree persisted in SQLite
pub struct SqliteCoordinator {
    /// Database connection
    conn: Mutex<Connection>,
    /// Database file
    db_path: PathBuf,
    watches: WatchHub,
}

impl SqliteCoordinator {
    /// Create or open the coordination database in `data_dir`
    pub fn open(data_dir: PathBuf) -> crate::Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("coordination.db");
        let conn = Connection::open(&db_path).map_err(backend)?;

        // Initialize schema
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS znodes (
                path TEXT PRIMARY KEY,
                parent TEXT NOT NULL,
                data BLOB NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_znodes_parent
                ON znodes(parent);
            "#,
        )
        .map_err(backend)?;

        tracing::debug!("Opened coordination database at {:?}", db_path);

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            watches: WatchHub::default(),
        })
    }

    /// Path of the database file
    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }
}

fn backend(e: rusqlite::Error) -> CoordinationError {
    match e {
        rusqlite::Error::SqliteFailure(ref err, _)
            if err.code == rusqlite::ErrorCode::DatabaseBusy
                || err.code == rusqlite::ErrorCode::DatabaseLocked =>
        {
            CoordinationError::OperationTimeout
        }
        other => CoordinationError::Backend(other.to_string()),
    }
}

fn node_exists(conn: &Connection, path: &str) -> rusqlite::Result<bool> {
    if path == "/" {
        return Ok(true);
    }
    conn.query_row(
        "SELECT 1 FROM znodes WHERE path = ?1",
        params![path],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
}

fn subtree_prefix(path: &str) -> String {
    format!("{}/", path)
}

#[async_trait]
impl CoordinationClient for SqliteCoordinator {
    async fn create(&self, path: &str, data: Bytes) -> CoordinationResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(backend)?;

        let parent = paths::parent(path).unwrap_or("/");
        if !node_exists(&tx, parent).map_err(backend)? {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        if node_exists(&tx, path).map_err(backend)? {
            return Err(CoordinationError::NodeExists(path.to_string()));
        }

        tx.execute(
            "INSERT INTO znodes (path, parent, data, version) VALUES (?1, ?2, ?3, 0)",
            params![path, parent, data.as_ref()],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;
        drop(conn);

        self.watches.publish(path, WatchEventKind::NodeCreated);
        Ok(())
    }

    async fn get_data(&self, path: &str) -> CoordinationResult<(Bytes, Version)> {
        let conn = self.conn.lock().await;
        let row: Option<(Vec<u8>, i64)> = conn
            .query_row(
                "SELECT data, version FROM znodes WHERE path = ?1",
                params![path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(backend)?;

        match row {
            Some((data, version)) => Ok((Bytes::from(data), version as Version)),
            None => Err(CoordinationError::NoNode(path.to_string())),
        }
    }

    async fn set_data(
        &self,
        path: &str,
        data: Bytes,
        expected: Option<Version>,
    ) -> CoordinationResult<Version> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(backend)?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT version FROM znodes WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;

        let current = match current {
            Some(v) => v as Version,
            None => return Err(CoordinationError::NoNode(path.to_string())),
        };
        if let Some(expected) = expected {
            if expected != current {
                return Err(CoordinationError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: current,
                });
            }
        }

        let version = current + 1;
        tx.execute(
            r#"
            UPDATE znodes SET data = ?2, version = ?3, updated_at = CURRENT_TIMESTAMP
            WHERE path = ?1
            "#,
            params![path, data.as_ref(), version as i64],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;
        drop(conn);

        self.watches.publish(path, WatchEventKind::NodeDataChanged);
        Ok(version)
    }

    async fn delete(&self, path: &str, recursive: bool) -> CoordinationResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(backend)?;

        if !node_exists(&tx, path).map_err(backend)? {
            return Err(CoordinationError::NoNode(path.to_string()));
        }

        // Exact, case-sensitive prefix match over the subtree
        let prefix = subtree_prefix(path);
        let mut removed: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT path FROM znodes WHERE substr(path, 1, length(?1)) = ?1")
                .map_err(backend)?;
            let rows = stmt
                .query_map(params![prefix], |row| row.get::<_, String>(0))
                .map_err(backend)?;
            let mut found = Vec::new();
            for row in rows {
                found.push(row.map_err(backend)?);
            }
            found
        };

        if !removed.is_empty() && !recursive {
            return Err(CoordinationError::NotEmpty(path.to_string()));
        }

        tx.execute(
            "DELETE FROM znodes WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2",
            params![path, prefix],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;
        drop(conn);

        removed.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        removed.push(path.to_string());
        for p in removed.iter() {
            self.watches.publish(p, WatchEventKind::NodeDeleted);
        }
        Ok(())
    }

    async fn list_children(&self, path: &str) -> CoordinationResult<BTreeSet<String>> {
        let conn = self.conn.lock().await;
        if !node_exists(&conn, path).map_err(backend)? {
            return Err(CoordinationError::NoNode(path.to_string()));
        }

        let mut stmt = conn
            .prepare("SELECT path FROM znodes WHERE parent = ?1")
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![path], |row| row.get::<_, String>(0))
            .map_err(backend)?;

        let mut children = BTreeSet::new();
        for row in rows {
            let child = row.map_err(backend)?;
            if let Some(name) = child.rsplit('/').next() {
                children.insert(name.to_string());
            }
        }
        Ok(children)
    }

    async fn exists(&self, path: &str) -> CoordinationResult<bool> {
        let conn = self.conn.lock().await;
        node_exists(&conn, path).map_err(backend)
    }

    async fn watch(&self, path: &str) -> CoordinationResult<WatchSubscription> {
        Ok(self.watches.subscribe(path))
    }
}
