use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use strand_core::{Error, Result, ThreadState};
use tracing::{debug, info, warn};

use crate::record::{self, CheckpointMeta};
use crate::CheckpointStore;

/// Networked checkpoint store on PostgreSQL.
///
/// `{table}` holds one pointer row per thread; `{table}_checkpoints` holds the
/// versioned bodies. A save locks the pointer row, checks it against the
/// caller's checkpoint id, inserts the new body and advances the pointer in one
/// transaction, so two engines racing on a thread cannot both win.
pub struct PostgresCheckpointStore {
    pool: PgPool,
    table: String,
    checkpoints_table: String,
    history_limit: u32,
}

fn sql_err(e: sqlx::Error) -> Error {
    Error::Storage(e.to_string())
}

impl PostgresCheckpointStore {
    /// Use an existing pool with the default `strand_threads` table.
    pub fn new(pool: PgPool) -> Self {
        Self::with_table(pool, "strand_threads")
    }

    /// Use a custom table name. Checkpoint bodies go to `{table}_checkpoints`.
    pub fn with_table(pool: PgPool, table: impl Into<String>) -> Self {
        let table = table.into();
        let checkpoints_table = format!("{}_checkpoints", table);
        Self {
            pool,
            table,
            checkpoints_table,
            history_limit: 0,
        }
    }

    /// Keep at most `limit` checkpoints per thread (0 keeps all).
    pub fn with_history_limit(mut self, limit: u32) -> Self {
        self.history_limit = limit;
        self
    }

    /// Connect a pool and make sure the tables exist.
    pub async fn connect(url: &str, max_connections: u32, history_limit: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| Error::Storage(format!("Failed to connect checkpoint database: {}", e)))?;
        let store = Self::new(pool).with_history_limit(history_limit);
        store.ensure_table().await?;
        info!(table = %store.table, "Networked checkpoint store ready");
        Ok(store)
    }

    /// Create the storage tables if they do not exist.
    pub async fn ensure_table(&self) -> Result<()> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {threads} (
                thread_id     TEXT PRIMARY KEY,
                checkpoint_id BIGINT NOT NULL,
                updated_at    TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE TABLE IF NOT EXISTS {checkpoints} (
                thread_id     TEXT NOT NULL REFERENCES {threads}(thread_id) ON DELETE CASCADE,
                checkpoint_id BIGINT NOT NULL,
                status        TEXT NOT NULL,
                state         TEXT NOT NULL,
                created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (thread_id, checkpoint_id)
            );
            "#,
            threads = self.table,
            checkpoints = self.checkpoints_table,
        );
        sqlx::raw_sql(&sql).execute(&self.pool).await.map_err(sql_err)?;
        Ok(())
    }

    fn conflict(state: &ThreadState, actual: i64) -> Error {
        warn!(
            thread_id = %state.thread_id,
            expected = state.checkpoint_id,
            actual,
            "Rejected stale checkpoint write"
        );
        Error::CheckpointConflict {
            thread_id: state.thread_id.clone(),
            expected: state.checkpoint_id,
            actual: actual as u64,
        }
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn save(&self, state: &ThreadState) -> Result<u64> {
        let body = record::encode(state)?;
        let expected = state.checkpoint_id as i64;
        let mut tx = self.pool.begin().await.map_err(sql_err)?;

        // Lock the pointer row for the read-check-advance sequence.
        let sql = format!("SELECT checkpoint_id FROM {} WHERE thread_id = $1 FOR UPDATE", self.table);
        let row: Option<(i64,)> = sqlx::query_as(&sql)
            .bind(&state.thread_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sql_err)?;

        let next = match row {
            Some((current,)) if current != expected => return Err(Self::conflict(state, current)),
            Some((current,)) => {
                let sql = format!(
                    "UPDATE {} SET checkpoint_id = $2, updated_at = now() WHERE thread_id = $1",
                    self.table
                );
                sqlx::query(&sql)
                    .bind(&state.thread_id)
                    .bind(current + 1)
                    .execute(&mut *tx)
                    .await
                    .map_err(sql_err)?;
                current + 1
            }
            None if expected != 0 => return Err(Self::conflict(state, 0)),
            None => {
                // First save: a concurrent creator makes this insert a no-op.
                let sql = format!(
                    "INSERT INTO {} (thread_id, checkpoint_id) VALUES ($1, 1) ON CONFLICT (thread_id) DO NOTHING",
                    self.table
                );
                let inserted = sqlx::query(&sql)
                    .bind(&state.thread_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(sql_err)?
                    .rows_affected();
                if inserted == 0 {
                    return Err(Self::conflict(state, 1));
                }
                1
            }
        };

        let sql = format!(
            "INSERT INTO {} (thread_id, checkpoint_id, status, state) VALUES ($1, $2, $3, $4)",
            self.checkpoints_table
        );
        sqlx::query(&sql)
            .bind(&state.thread_id)
            .bind(next)
            .bind(state.status.as_str())
            .bind(&body)
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?;

        if self.history_limit > 0 {
            let sql = format!(
                "DELETE FROM {} WHERE thread_id = $1 AND checkpoint_id <= $2",
                self.checkpoints_table
            );
            sqlx::query(&sql)
                .bind(&state.thread_id)
                .bind(next - i64::from(self.history_limit))
                .execute(&mut *tx)
                .await
                .map_err(sql_err)?;
        }

        tx.commit().await.map_err(sql_err)?;
        debug!(thread_id = %state.thread_id, checkpoint_id = next, "Checkpoint saved");
        Ok(next as u64)
    }

    async fn load(&self, thread_id: &str) -> Result<ThreadState> {
        let sql = format!(
            "SELECT c.checkpoint_id, c.state FROM {threads} t
             JOIN {checkpoints} c ON c.thread_id = t.thread_id AND c.checkpoint_id = t.checkpoint_id
             WHERE t.thread_id = $1",
            threads = self.table,
            checkpoints = self.checkpoints_table,
        );
        let row: Option<(i64, String)> = sqlx::query_as(&sql)
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err)?;

        let (checkpoint_id, body) =
            row.ok_or_else(|| Error::NotFound(format!("Thread '{}'", thread_id)))?;
        record::decode(thread_id, checkpoint_id as u64, &body)
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<CheckpointMeta>> {
        let sql = format!(
            "SELECT checkpoint_id, status, created_at FROM {} WHERE thread_id = $1 ORDER BY checkpoint_id DESC",
            self.checkpoints_table
        );
        let rows: Vec<(i64, String, DateTime<Utc>)> = sqlx::query_as(&sql)
            .bind(thread_id)
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?;

        rows.into_iter()
            .map(|(checkpoint_id, status, created_at)| {
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
        let sql = format!("DELETE FROM {} WHERE thread_id = $1", self.table);
        let removed = sqlx::query(&sql)
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?
            .rows_affected();
        Ok(removed > 0)
    }

    fn backend_name(&self) -> &'static str {
        "networked"
    }
}

#[cfg(test)]
mod tests {
    //! These tests need a scratch PostgreSQL database named by
    //! `STRAND_TEST_DATABASE_URL` and return early without one. The
    //! single-writer rule itself is also covered without a database by the
    //! memory store's concurrent-writer test, which uses the same
    //! compare-then-advance check.
    use super::*;
    use std::sync::Arc;
    use strand_core::ThreadStatus;

    /// Skips unless `STRAND_TEST_DATABASE_URL` points at a scratch database.
    async fn test_store() -> Option<PostgresCheckpointStore> {
        let url = std::env::var("STRAND_TEST_DATABASE_URL").ok()?;
        let pool = PgPoolOptions::new().max_connections(4).connect(&url).await.ok()?;
        let table = format!("strand_test_{}", std::process::id());
        let store = PostgresCheckpointStore::with_table(pool, table);
        store.ensure_table().await.ok()?;
        Some(store)
    }

    fn unique_thread(tag: &str) -> String {
        format!("{}-{}", tag, Utc::now().timestamp_nanos_opt().unwrap_or_default())
    }

    #[tokio::test]
    async fn test_save_load_history() {
        let Some(store) = test_store().await else {
            return;
        };
        let thread_id = unique_thread("history");
        let mut state = ThreadState::new(&thread_id);
        state.messages.push_user("hello").unwrap();
        state.checkpoint_id = store.save(&state).await.unwrap();
        state.status = ThreadStatus::Completed;
        state.checkpoint_id = store.save(&state).await.unwrap();
        assert_eq!(state.checkpoint_id, 2);

        let loaded = store.load(&thread_id).await.unwrap();
        assert_eq!(loaded, state);
        let history = store.history(&thread_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, ThreadStatus::Completed);

        assert!(store.delete(&thread_id).await.unwrap());
        assert!(matches!(store.load(&thread_id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_history_limit_prunes_old_rows() {
        let Some(store) = test_store().await else {
            return;
        };
        let store = store.with_history_limit(2);
        let thread_id = unique_thread("prune");
        let mut state = ThreadState::new(&thread_id);
        for i in 0..4 {
            state.messages.push_user(&format!("m{}", i)).unwrap();
            state.checkpoint_id = store.save(&state).await.unwrap();
        }
        let ids: Vec<u64> = store.history(&thread_id).await.unwrap().iter().map(|m| m.checkpoint_id).collect();
        assert_eq!(ids, vec![4, 3]);
        assert_eq!(store.load(&thread_id).await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_concurrent_writers_one_wins() {
        let Some(store) = test_store().await else {
            return;
        };
        let store = Arc::new(store);
        let thread_id = unique_thread("race");
        let mut base = ThreadState::new(&thread_id);
        base.checkpoint_id = store.save(&base).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let store = store.clone();
            let mut state = base.clone();
            state.messages.push_user(&format!("writer {}", i)).unwrap();
            handles.push(tokio::spawn(async move { store.save(&state).await }));
        }

        let mut wins = 0;
        let mut conflicts = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(id) => {
                    assert_eq!(id, 2);
                    wins += 1;
                }
                Err(Error::CheckpointConflict { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 3);
    }
}
