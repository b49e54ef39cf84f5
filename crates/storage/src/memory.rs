use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use strand_core::{Error, Result, ThreadState};
use tokio::sync::RwLock;

use crate::record::{self, CheckpointMeta};
use crate::CheckpointStore;

struct Row {
    meta: CheckpointMeta,
    body: String,
}

/// In-process checkpoint store for tests and ephemeral runs.
///
/// Enforces the single-writer rule the same way the networked backend does:
/// a save must name the checkpoint id it was loaded at.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    threads: RwLock<HashMap<String, Vec<Row>>>,
    history_limit: u32,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` checkpoints per thread (0 keeps all).
    pub fn with_history_limit(mut self, limit: u32) -> Self {
        self.history_limit = limit;
        self
    }

    /// Number of checkpoints written for `thread_id`.
    pub async fn checkpoint_count(&self, thread_id: &str) -> usize {
        self.threads.read().await.get(thread_id).map_or(0, Vec::len)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, state: &ThreadState) -> Result<u64> {
        let body = record::encode(state)?;
        let mut threads = self.threads.write().await;

        let current = threads
            .get(&state.thread_id)
            .and_then(|rows| rows.last())
            .map_or(0, |r| r.meta.checkpoint_id);
        if current != state.checkpoint_id {
            return Err(Error::CheckpointConflict {
                thread_id: state.thread_id.clone(),
                expected: state.checkpoint_id,
                actual: current,
            });
        }

        let checkpoint_id = current + 1;
        let rows = threads.entry(state.thread_id.clone()).or_default();
        rows.push(Row {
            meta: CheckpointMeta {
                thread_id: state.thread_id.clone(),
                checkpoint_id,
                status: state.status,
                created_at: Utc::now(),
            },
            body,
        });
        let limit = self.history_limit as usize;
        if limit > 0 && rows.len() > limit {
            rows.drain(..rows.len() - limit);
        }
        Ok(checkpoint_id)
    }

    async fn load(&self, thread_id: &str) -> Result<ThreadState> {
        let threads = self.threads.read().await;
        let row = threads
            .get(thread_id)
            .and_then(|rows| rows.last())
            .ok_or_else(|| Error::NotFound(format!("Thread '{}'", thread_id)))?;
        record::decode(thread_id, row.meta.checkpoint_id, &row.body)
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<CheckpointMeta>> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(thread_id)
            .map(|rows| rows.iter().rev().map(|r| r.meta.clone()).collect())
            .unwrap_or_default())
    }

    async fn delete(&self, thread_id: &str) -> Result<bool> {
        Ok(self.threads.write().await.remove(thread_id).is_some())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
