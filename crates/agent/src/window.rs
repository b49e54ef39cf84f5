//! Trimming of the log before it is shown to a reasoner.
//!
//! Only a copy is trimmed. The persisted log stays complete.

use std::collections::HashSet;
use strand_core::{Message, MessageLog};

/// The trailing `size` messages of `log`, made self-consistent.
///
/// A `size` of 0 keeps the whole log. Tool-results whose request fell
/// outside the window are dropped, and an assistant message whose requests
/// are not all answered inside the window is shown as plain text.
pub fn window(log: &MessageLog, size: usize) -> Vec<Message> {
    let messages = log.messages();
    let start = if size == 0 { 0 } else { messages.len().saturating_sub(size) };
    let tail = &messages[start..];

    let answered: HashSet<&str> = tail.iter().filter_map(Message::invocation_id).collect();
    let fully_answered = |m: &Message| {
        m.invocations()
            .iter()
            .all(|r| answered.contains(r.invocation_id.as_str()))
    };
    // Requests that stay visible as requests. Results are kept only for these.
    let visible: HashSet<&str> = tail
        .iter()
        .filter(|m| fully_answered(*m))
        .flat_map(Message::invocations)
        .map(|r| r.invocation_id.as_str())
        .collect();

    tail.iter()
        .filter(|m| m.invocation_id().map_or(true, |id| visible.contains(id)))
        .map(|m| match m {
            Message::Assistant {
                sequence_index,
                content,
                ..
            } if !fully_answered(m) => Message::Assistant {
                sequence_index: *sequence_index,
                content: content.clone(),
                invocations: Vec::new(),
            },
            other => other.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_core::{InvocationRequest, InvocationResult};

    fn request(id: &str) -> InvocationRequest {
        InvocationRequest {
            invocation_id: id.to_string(),
            capability_name: "calc".to_string(),
            arguments: json!({}),
        }
    }

    fn sample_log() -> MessageLog {
        let mut log = MessageLog::new();
        log.push_user("hi").unwrap();
        log.push_assistant("calling", vec![request("a"), request("b")]).unwrap();
        log.push_result(InvocationResult::output(&request("a"), json!(1))).unwrap();
        log.push_result(InvocationResult::output(&request("b"), json!(2))).unwrap();
        log.push_assistant("done", vec![]).unwrap();
        log
    }

    #[test]
    fn test_zero_keeps_everything() {
        let log = sample_log();
        assert_eq!(window(&log, 0), log.messages().to_vec());
        assert_eq!(window(&log, 50), log.messages().to_vec());
    }

    #[test]
    fn test_orphan_results_are_dropped() {
        let log = sample_log();
        let w = window(&log, 2);
        assert_eq!(w.len(), 1);
        assert_eq!(w[0].role(), "assistant");

        let w = window(&log, 3);
        let roles: Vec<&str> = w.iter().map(Message::role).collect();
        assert_eq!(roles, vec!["assistant"]);
    }

    #[test]
    fn test_partially_answered_request_becomes_text() {
        let mut log = MessageLog::new();
        log.push_user("hi").unwrap();
        log.push_assistant("calling", vec![request("a"), request("b")]).unwrap();
        log.push_result(InvocationResult::output(&request("a"), json!(1))).unwrap();

        let w = window(&log, 0);
        let roles: Vec<&str> = w.iter().map(Message::role).collect();
        assert_eq!(roles, vec!["user", "assistant"]);
        assert!(w[1].invocations().is_empty());
        assert_eq!(w[1].text(), Some("calling"));
    }

    #[test]
    fn test_log_is_untouched() {
        let log = sample_log();
        let before = log.clone();
        let _ = window(&log, 1);
        assert_eq!(log, before);
    }
}
