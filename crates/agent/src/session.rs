use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use strand_core::{Error, Result, ThreadState};
use strand_storage::CheckpointMeta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::{Engine, RunOutcome};

/// Supplies instructions for a reasoning run. Consulted on every run and
/// never persisted, so a change takes effect on the next run of any thread.
pub trait InstructionSource: Send + Sync {
    fn instructions(&self, thread_id: &str) -> String;
}

/// The same instructions for every thread.
pub struct StaticInstructions(String);

impl StaticInstructions {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }
}

impl InstructionSource for StaticInstructions {
    fn instructions(&self, _thread_id: &str) -> String {
        self.0.clone()
    }
}

type ActiveSet = Arc<Mutex<HashSet<String>>>;

/// Marks a thread as running until dropped.
struct ActiveRun {
    active: ActiveSet,
    thread_id: String,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.thread_id);
        }
    }
}

/// Entry point for callers: maps thread ids to runs, one run per thread.
pub struct SessionCoordinator {
    engine: Engine,
    instructions: Arc<dyn InstructionSource>,
    active: ActiveSet,
}

impl SessionCoordinator {
    pub fn new(engine: Engine, instructions: Arc<dyn InstructionSource>) -> Self {
        Self {
            engine,
            instructions,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn is_active(&self, thread_id: &str) -> bool {
        self.active
            .lock()
            .map(|active| active.contains(thread_id))
            .unwrap_or(false)
    }

    fn acquire(&self, thread_id: &str) -> Result<ActiveRun> {
        let mut active = self
            .active
            .lock()
            .map_err(|e| Error::Other(format!("Lock error: {}", e)))?;
        if !active.insert(thread_id.to_string()) {
            debug!(thread_id, "Thread already has an active run");
            return Err(Error::ThreadBusy(thread_id.to_string()));
        }
        Ok(ActiveRun {
            active: self.active.clone(),
            thread_id: thread_id.to_string(),
        })
    }

    /// Append `user_message` to the thread (creating it on first use) and run.
    pub async fn run(&self, thread_id: &str, user_message: &str) -> Result<RunOutcome> {
        self.run_with(thread_id, Some(user_message), &CancellationToken::new())
            .await
    }

    /// Continue a thread from its last checkpoint without new input.
    pub async fn resume(&self, thread_id: &str) -> Result<RunOutcome> {
        self.run_with(thread_id, None, &CancellationToken::new()).await
    }

    /// Run with an external cancellation token.
    ///
    /// Errors are returned only when no run could start: the thread is busy,
    /// a resumed thread does not exist, or the checkpoint cannot be read.
    /// Everything after that is reported in the [`RunOutcome`].
    pub async fn run_with(
        &self,
        thread_id: &str,
        user_message: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let _guard = self.acquire(thread_id)?;

        let state = match self.engine.store().load(thread_id).await {
            Ok(state) => state,
            Err(Error::NotFound(_)) if user_message.is_some() => {
                info!(thread_id, "Starting new thread");
                ThreadState::new(thread_id)
            }
            Err(e) => return Err(e),
        };
        info!(
            thread_id,
            checkpoint_id = state.checkpoint_id,
            status = %state.status,
            resume = user_message.is_none(),
            "Run starting"
        );

        let instructions = self.instructions.instructions(thread_id);
        let outcome = self.engine.run(state, user_message, &instructions, cancel).await;
        info!(
            thread_id,
            status = %outcome.status,
            checkpoint_id = outcome.checkpoint_id,
            "Run finished"
        );
        Ok(outcome)
    }

    pub async fn thread(&self, thread_id: &str) -> Result<ThreadState> {
        self.engine.store().load(thread_id).await
    }

    pub async fn history(&self, thread_id: &str) -> Result<Vec<CheckpointMeta>> {
        self.engine.store().history(thread_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_guard_releases_on_drop() {
        let active: ActiveSet = Arc::new(Mutex::new(HashSet::new()));
        active.lock().unwrap().insert("t".to_string());
        {
            let _guard = ActiveRun {
                active: active.clone(),
                thread_id: "t".to_string(),
            };
        }
        assert!(active.lock().unwrap().is_empty());
    }

    #[test]
    fn test_static_instructions() {
        let source = StaticInstructions::new("be brief");
        assert_eq!(source.instructions("any"), "be brief");
    }
}
