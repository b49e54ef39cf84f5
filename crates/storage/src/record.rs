//! Serialized form shared by every checkpoint backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strand_core::{Error, Result, ThreadState, ThreadStatus};

/// One row of a thread's checkpoint history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub thread_id: String,
    pub checkpoint_id: u64,
    pub status: ThreadStatus,
    pub created_at: DateTime<Utc>,
}

/// Serialize the body of a checkpoint. The checkpoint id lives in the row.
pub fn encode(state: &ThreadState) -> Result<String> {
    Ok(serde_json::to_string(state)?)
}

/// Rebuild a state from a stored body, re-validating the message log.
pub fn decode(thread_id: &str, checkpoint_id: u64, body: &str) -> Result<ThreadState> {
    let mut state: ThreadState = serde_json::from_str(body).map_err(|e| {
        Error::Storage(format!(
            "Corrupt checkpoint {} of thread '{}': {}",
            checkpoint_id, thread_id, e
        ))
    })?;
    if state.thread_id != thread_id {
        return Err(Error::Storage(format!(
            "Checkpoint {} belongs to thread '{}', not '{}'",
            checkpoint_id, state.thread_id, thread_id
        )));
    }
    state.checkpoint_id = checkpoint_id;
    Ok(state)
}

pub(crate) fn parse_status(raw: &str) -> Result<ThreadStatus> {
    ThreadStatus::parse(raw).ok_or_else(|| Error::Storage(format!("Unknown thread status '{}'", raw)))
}
