pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod record;
pub mod sqlite;

use async_trait::async_trait;
use std::sync::Arc;
use strand_core::{CheckpointBackend, Config, Paths, Result, ThreadState};
use tracing::info;

pub use memory::MemoryCheckpointStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresCheckpointStore;
pub use record::CheckpointMeta;
pub use sqlite::SqliteCheckpointStore;

/// Durable, versioned snapshots of thread state.
///
/// Every backend stores the same logical record
/// `(thread_id, checkpoint_id, status, state)` with the same serialized body,
/// so callers never need to know which one they hold.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist `state` and return its new checkpoint id.
    ///
    /// `state.checkpoint_id` is the version the caller loaded; backends that
    /// enforce a single writer reject the save with `CheckpointConflict` when
    /// the stored pointer has moved past it.
    async fn save(&self, state: &ThreadState) -> Result<u64>;

    /// Latest checkpoint of a thread, or `NotFound`.
    async fn load(&self, thread_id: &str) -> Result<ThreadState>;

    /// Checkpoint metadata for a thread, newest first.
    async fn history(&self, thread_id: &str) -> Result<Vec<CheckpointMeta>>;

    /// Remove every checkpoint of a thread. Returns false when none existed.
    async fn delete(&self, thread_id: &str) -> Result<bool>;

    fn backend_name(&self) -> &'static str;
}

/// Open the backend the configuration selects. Called once at startup.
pub async fn open_checkpoint_store(config: &Config, paths: &Paths) -> Result<Arc<dyn CheckpointStore>> {
    match config.checkpoint_backend(paths) {
        CheckpointBackend::Embedded(path) => {
            info!(path = %path.display(), "Using embedded checkpoint store");
            let store = SqliteCheckpointStore::open(&path)?.with_history_limit(config.checkpoint.history_limit);
            Ok(Arc::new(store))
        }
        CheckpointBackend::Networked(url) => open_networked(&url, config).await,
    }
}

#[cfg(feature = "postgres")]
async fn open_networked(url: &str, config: &Config) -> Result<Arc<dyn CheckpointStore>> {
    let max_connections = config.checkpoint.max_connections;
    info!(max_connections, "Using networked checkpoint store");
    let store = PostgresCheckpointStore::connect(url, max_connections, config.checkpoint.history_limit).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn open_networked(_url: &str, _config: &Config) -> Result<Arc<dyn CheckpointStore>> {
    Err(strand_core::Error::Config(
        "checkpoint.backendConnection is set but this build has no networked backend".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_factory_defaults_to_embedded() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let store = open_checkpoint_store(&Config::default(), &paths).await.unwrap();
        assert_eq!(store.backend_name(), "embedded");
        assert!(paths.checkpoint_db().exists());
    }
}
