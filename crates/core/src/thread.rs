use serde::{Deserialize, Serialize};

use crate::message::MessageLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadStatus {
    Running,
    AwaitingInvocation,
    Completed,
    Failed,
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadStatus::Running => "running",
            ThreadStatus::AwaitingInvocation => "awaiting-invocation",
            ThreadStatus::Completed => "completed",
            ThreadStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ThreadStatus::Running),
            "awaiting-invocation" => Some(ThreadStatus::AwaitingInvocation),
            "completed" => Some(ThreadStatus::Completed),
            "failed" => Some(ThreadStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of persistence: one thread's full execution state.
///
/// `checkpoint_id` is the version this state was loaded at (0 for a thread
/// that was never saved). It is carried by the checkpoint row, not by the
/// serialized body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadState {
    pub thread_id: String,
    #[serde(skip)]
    pub checkpoint_id: u64,
    pub status: ThreadStatus,
    pub messages: MessageLog,
}

impl ThreadState {
    pub fn new(thread_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            checkpoint_id: 0,
            status: ThreadStatus::Running,
            messages: MessageLog::new(),
        }
    }

    pub fn is_new(&self) -> bool {
        self.checkpoint_id == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            ThreadStatus::Running,
            ThreadStatus::AwaitingInvocation,
            ThreadStatus::Completed,
            ThreadStatus::Failed,
        ] {
            assert_eq!(ThreadStatus::parse(status.as_str()), Some(status));
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::Value::String(status.to_string())
            );
        }
    }

    #[test]
    fn test_parse_rejects_unknown_status() {
        assert_eq!(ThreadStatus::parse("paused"), None);
        assert_eq!(ThreadStatus::parse("Running"), None);
    }

    #[test]
    fn test_checkpoint_id_not_in_body() {
        let mut state = ThreadState::new("t-1");
        state.checkpoint_id = 7;
        let v = serde_json::to_value(&state).unwrap();
        assert!(v.get("checkpoint_id").is_none());
        assert_eq!(v["status"], "running");
    }
}
