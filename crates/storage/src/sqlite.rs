use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use strand_core::{Error, Result, ThreadState};
use tracing::debug;

use crate::record::{self, CheckpointMeta};
use crate::CheckpointStore;

/// Embedded single-file checkpoint store.
///
/// Last write wins per thread: each save becomes `max(checkpoint_id) + 1`.
/// `synchronous=FULL` makes a returned save survive power loss. Each save
/// stores the full state, so old rows are pruned past `history_limit`.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    inner: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    history_limit: u32,
}

fn storage_err(context: &str) -> impl Fn(rusqlite::Error) -> Error + '_ {
    move |e| Error::Storage(format!("{}: {}", context, e))
}

impl SqliteCheckpointStore {
    /// Open (or create) the checkpoint database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(db_path).map_err(storage_err("Failed to open checkpoint db"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .map_err(storage_err("Failed to configure checkpoint db"))?;

        let store = Self {
            inner: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
            history_limit: 0,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Keep at most `limit` checkpoints per thread (0 keeps all).
    pub fn with_history_limit(mut self, limit: u32) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self
            .inner
            .lock()
            .map_err(|e| Error::Storage(format!("Lock error: {}", e)))?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id TEXT NOT NULL,
                checkpoint_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (thread_id, checkpoint_id)
            );
            ",
        )
        .map_err(storage_err("Failed to init checkpoint schema"))?;

        debug!("Checkpoint store schema initialized");
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = inner
                .lock()
                .map_err(|e| Error::Storage(format!("Lock error: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Storage(format!("Checkpoint task failed: {}", e)))?
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, state: &ThreadState) -> Result<u64> {
        let body = record::encode(state)?;
        let thread_id = state.thread_id.clone();
        let status = state.status.as_str();
        let keep = i64::from(self.history_limit);

        let checkpoint_id = self
            .with_conn(move |conn| {
                let tx = conn.transaction().map_err(storage_err("Begin failed"))?;
                let current: i64 = tx
                    .query_row(
                        "SELECT COALESCE(MAX(checkpoint_id), 0) FROM checkpoints WHERE thread_id = ?1",
                        params![thread_id],
                        |row| row.get(0),
                    )
                    .map_err(storage_err("Query error"))?;
                let next = current + 1;
                tx.execute(
                    "INSERT INTO checkpoints (thread_id, checkpoint_id, status, state, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![thread_id, next, status, body, Utc::now().to_rfc3339()],
                )
                .map_err(storage_err("Insert error"))?;
                if keep > 0 {
                    tx.execute(
                        "DELETE FROM checkpoints WHERE thread_id = ?1 AND checkpoint_id <= ?2",
                        params![thread_id, next - keep],
                    )
                    .map_err(storage_err("Prune error"))?;
                }
                tx.commit().map_err(storage_err("Commit failed"))?;
                Ok(next as u64)
            })
            .await?;

        debug!(thread_id = %state.thread_id, checkpoint_id, "Checkpoint saved");
        Ok(checkpoint_id)
    }

    async fn load(&self, thread_id: &str) -> Result<ThreadState> {
        let id = thread_id.to_string();
        let row: Option<(i64, String)> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT checkpoint_id, state FROM checkpoints
                     WHERE thread_id = ?1 ORDER BY checkpoint_id DESC LIMIT 1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(storage_err("Query error"))
            })
            .await?;

        let (checkpoint_id, body) =
            row.ok_or_else(|| Error::NotFound(format!("Thread '{}'", thread_id)))?;
        record::decode(thread_id, checkpoint_id as u64, &body)
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<CheckpointMeta>> {
        let id = thread_id.to_string();
        let rows: Vec<(i64, String, String)> = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT checkpoint_id, status, created_at FROM checkpoints
                         WHERE thread_id = ?1 ORDER BY checkpoint_id DESC",
                    )
                    .map_err(storage_err("Prepare error"))?;
                let rows = stmt
                    .query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                    .map_err(storage_err("Query error"))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(storage_err("Row error"))?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(checkpoint_id, status, created_at)| {
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| Error::Storage(format!("Bad timestamp '{}': {}", created_at, e)))?
                    .with_timezone(&Utc);
                Ok(CheckpointMeta {
                    thread_id: thread_id.to_string(),
                    checkpoint_id: checkpoint_id as u64,
                    status: record::parse_status(&status)?,
                    created_at,
                })
            })
            .collect()
    }

    async fn delete(&self, thread_id: &str) -> Result<bool> {
        let id = thread_id.to_string();
        let removed = self
            .with_conn(move |conn| {
                conn.execute("DELETE FROM checkpoints WHERE thread_id = ?1", params![id])
                    .map_err(storage_err("Delete error"))
            })
            .await?;
        debug!(thread_id, removed, "Thread checkpoints deleted");
        Ok(removed > 0)
    }

    fn backend_name(&self) -> &'static str {
        "embedded"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::ThreadStatus;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, SqliteCheckpointStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteCheckpointStore::open(&dir.path().join("checkpoints.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let (_dir, store) = open_temp();
        assert!(matches!(store.load("nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_save_assigns_increasing_ids() {
        let (_dir, store) = open_temp();
        let mut state = ThreadState::new("t1");
        state.messages.push_user("hi").unwrap();

        assert_eq!(store.save(&state).await.unwrap(), 1);
        state.messages.push_assistant("hello", vec![]).unwrap();
        state.status = ThreadStatus::Completed;
        assert_eq!(store.save(&state).await.unwrap(), 2);

        let loaded = store.load("t1").await.unwrap();
        assert_eq!(loaded.checkpoint_id, 2);
        assert_eq!(loaded.status, ThreadStatus::Completed);
        assert_eq!(loaded.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let (_dir, store) = open_temp();
        let base = ThreadState::new("t1");
        store.save(&base).await.unwrap();

        // Two writers holding the same loaded version both succeed.
        let mut a = store.load("t1").await.unwrap();
        let mut b = a.clone();
        a.messages.push_user("from a").unwrap();
        b.messages.push_user("from b").unwrap();
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();

        let loaded = store.load("t1").await.unwrap();
        assert_eq!(loaded.messages.last().and_then(|m| m.text()), Some("from b"));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("checkpoints.db");
        {
            let store = SqliteCheckpointStore::open(&path).unwrap();
            let mut state = ThreadState::new("t1");
            state.messages.push_user("persist me").unwrap();
            store.save(&state).await.unwrap();
        }
        let store = SqliteCheckpointStore::open(&path).unwrap();
        let loaded = store.load("t1").await.unwrap();
        assert_eq!(loaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_history_limit_prunes_old_rows() {
        let dir = TempDir::new().unwrap();
        let store = SqliteCheckpointStore::open(&dir.path().join("checkpoints.db"))
            .unwrap()
            .with_history_limit(3);
        let mut state = ThreadState::new("t1");
        for i in 0..6 {
            state.messages.push_user(&format!("m{}", i)).unwrap();
            state.checkpoint_id = store.save(&state).await.unwrap();
        }
        assert_eq!(state.checkpoint_id, 6);

        let ids: Vec<u64> = store.history("t1").await.unwrap().iter().map(|m| m.checkpoint_id).collect();
        assert_eq!(ids, vec![6, 5, 4]);
        assert_eq!(store.load("t1").await.unwrap().messages.len(), 6);
        // Pruning never touches other threads.
        store.save(&ThreadState::new("t2")).await.unwrap();
        assert_eq!(store.history("t2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_history_and_delete() {
        let (_dir, store) = open_temp();
        let mut state = ThreadState::new("t1");
        store.save(&state).await.unwrap();
        state.status = ThreadStatus::Failed;
        store.save(&state).await.unwrap();

        let history = store.history("t1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].checkpoint_id, 2);
        assert_eq!(history[0].status, ThreadStatus::Failed);
        assert_eq!(history[1].status, ThreadStatus::Running);

        assert!(store.delete("t1").await.unwrap());
        assert!(!store.delete("t1").await.unwrap());
        assert!(store.history("t1").await.unwrap().is_empty());
    }
}
