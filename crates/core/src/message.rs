use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::error::{Error, Result};

/// A capability call requested by an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub invocation_id: String,
    pub capability_name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl InvocationRequest {
    pub fn new(capability_name: &str, arguments: Value) -> Self {
        Self {
            invocation_id: new_invocation_id(),
            capability_name: capability_name.to_string(),
            arguments,
        }
    }
}

/// Generate an invocation id. Ids are engine-issued and never chosen by the reasoner.
pub fn new_invocation_id() -> String {
    format!("inv_{}", uuid::Uuid::new_v4().simple())
}

/// Error payload carried by a failed invocation, in the logs and on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationError {
    pub code: String,
    pub message: String,
}

impl InvocationError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<&Error> for InvocationError {
    fn from(e: &Error) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOutcome {
    Output(Value),
    Error(InvocationError),
}

impl InvocationOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, InvocationOutcome::Error(_))
    }
}

/// The resolved half of an invocation, before it is appended to a log.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResult {
    pub invocation_id: String,
    pub capability_name: String,
    pub outcome: InvocationOutcome,
}

impl InvocationResult {
    pub fn output(request: &InvocationRequest, output: Value) -> Self {
        Self {
            invocation_id: request.invocation_id.clone(),
            capability_name: request.capability_name.clone(),
            outcome: InvocationOutcome::Output(output),
        }
    }

    pub fn error(request: &InvocationRequest, error: &Error) -> Self {
        Self {
            invocation_id: request.invocation_id.clone(),
            capability_name: request.capability_name.clone(),
            outcome: InvocationOutcome::Error(error.into()),
        }
    }
}

/// One entry of a thread's execution log.
///
/// Serialized with an explicit `role` discriminant so the persisted form is
/// never ambiguous about which fields are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "kebab-case")]
pub enum Message {
    System {
        sequence_index: u64,
        content: String,
    },
    User {
        sequence_index: u64,
        content: String,
    },
    Assistant {
        sequence_index: u64,
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        invocations: Vec<InvocationRequest>,
    },
    ToolResult {
        sequence_index: u64,
        invocation_id: String,
        capability_name: String,
        outcome: InvocationOutcome,
    },
}

impl Message {
    pub fn sequence_index(&self) -> u64 {
        match self {
            Message::System { sequence_index, .. }
            | Message::User { sequence_index, .. }
            | Message::Assistant { sequence_index, .. }
            | Message::ToolResult { sequence_index, .. } => *sequence_index,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Message::System { .. } => "system",
            Message::User { .. } => "user",
            Message::Assistant { .. } => "assistant",
            Message::ToolResult { .. } => "tool-result",
        }
    }

    /// The invocation id of a tool-result entry.
    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            Message::ToolResult { invocation_id, .. } => Some(invocation_id),
            _ => None,
        }
    }

    pub fn invocations(&self) -> &[InvocationRequest] {
        match self {
            Message::Assistant { invocations, .. } => invocations,
            _ => &[],
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Message::System { content, .. }
            | Message::User { content, .. }
            | Message::Assistant { content, .. } => Some(content),
            Message::ToolResult { .. } => None,
        }
    }
}

/// Append-only, correlation-checked message sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Message>", into = "Vec<Message>")]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl TryFrom<Vec<Message>> for MessageLog {
    type Error = Error;

    fn try_from(messages: Vec<Message>) -> Result<Self> {
        Self::from_messages(messages)
    }
}

impl From<MessageLog> for Vec<Message> {
    fn from(log: MessageLog) -> Self {
        log.messages
    }
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from raw messages, checking every invariant an append would.
    pub fn from_messages(messages: Vec<Message>) -> Result<Self> {
        let mut log = Self::new();
        for msg in messages {
            if msg.sequence_index() != log.next_index() {
                return Err(Error::Storage(format!(
                    "Message sequence gap: expected index {}, found {}",
                    log.next_index(),
                    msg.sequence_index()
                )));
            }
            match msg {
                Message::System { content, .. } => {
                    log.push_system(&content)?;
                }
                Message::User { content, .. } => {
                    log.push_user(&content)?;
                }
                Message::Assistant {
                    content,
                    invocations,
                    ..
                } => {
                    log.push_assistant(&content, invocations)?;
                }
                Message::ToolResult {
                    invocation_id,
                    capability_name,
                    outcome,
                    ..
                } => {
                    log.push_result(InvocationResult {
                        invocation_id,
                        capability_name,
                        outcome,
                    })?;
                }
            }
        }
        Ok(log)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    fn next_index(&self) -> u64 {
        self.messages.len() as u64
    }

    /// Requests that have no matching tool-result yet, in request order.
    pub fn outstanding(&self) -> Vec<&InvocationRequest> {
        let resolved: HashSet<&str> = self.messages.iter().filter_map(Message::invocation_id).collect();
        self.messages
            .iter()
            .flat_map(Message::invocations)
            .filter(|req| !resolved.contains(req.invocation_id.as_str()))
            .collect()
    }

    pub fn has_outstanding(&self) -> bool {
        !self.outstanding().is_empty()
    }

    /// Text of the most recent assistant message.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|m| match m {
            Message::Assistant { content, .. } => Some(content.as_str()),
            _ => None,
        })
    }

    fn ensure_settled(&self) -> Result<()> {
        let pending = self.outstanding().len();
        if pending > 0 {
            return Err(Error::OutstandingInvocations(pending));
        }
        Ok(())
    }

    pub fn push_system(&mut self, content: &str) -> Result<()> {
        self.ensure_settled()?;
        self.messages.push(Message::System {
            sequence_index: self.next_index(),
            content: content.to_string(),
        });
        Ok(())
    }

    pub fn push_user(&mut self, content: &str) -> Result<()> {
        self.ensure_settled()?;
        self.messages.push(Message::User {
            sequence_index: self.next_index(),
            content: content.to_string(),
        });
        Ok(())
    }

    pub fn push_assistant(&mut self, content: &str, invocations: Vec<InvocationRequest>) -> Result<()> {
        self.ensure_settled()?;
        let mut seen: HashSet<&str> = self
            .messages
            .iter()
            .flat_map(Message::invocations)
            .map(|r| r.invocation_id.as_str())
            .collect();
        for req in &invocations {
            if !seen.insert(req.invocation_id.as_str()) {
                return Err(Error::Other(format!(
                    "Duplicate invocation id in thread: {}",
                    req.invocation_id
                )));
            }
        }
        self.messages.push(Message::Assistant {
            sequence_index: self.next_index(),
            content: content.to_string(),
            invocations,
        });
        Ok(())
    }

    /// Append a tool-result. Fails unless it answers exactly one outstanding request.
    pub fn push_result(&mut self, result: InvocationResult) -> Result<()> {
        let matched = self
            .outstanding()
            .iter()
            .any(|req| req.invocation_id == result.invocation_id);
        if !matched {
            return Err(Error::UnmatchedResult(result.invocation_id));
        }
        self.messages.push(Message::ToolResult {
            sequence_index: self.next_index(),
            invocation_id: result.invocation_id,
            capability_name: result.capability_name,
            outcome: result.outcome,
        });
        Ok(())
    }
}
