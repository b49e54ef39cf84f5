use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strand_core::{CapabilityDescriptor, Message, Result};

/// Everything a reasoning step may look at.
///
/// `instructions` is supplied fresh for every step and never stored in the
/// thread log. `messages` is the trimmed tail of the log, not the whole log.
#[derive(Debug, Clone)]
pub struct ReasoningContext {
    pub thread_id: String,
    pub instructions: String,
    pub messages: Vec<Message>,
    pub capabilities: Vec<CapabilityDescriptor>,
}

/// A capability call the reasoner wants made. The engine assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedInvocation {
    pub capability_name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Outcome of one reasoning step: a reply, optionally with calls to make.
///
/// An empty `invocations` list ends the run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decision {
    pub content: String,
    pub invocations: Vec<PlannedInvocation>,
}

impl Decision {
    pub fn reply(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            invocations: Vec::new(),
        }
    }

    pub fn invoke(capability_name: &str, arguments: Value) -> Self {
        Self::default().and_invoke(capability_name, arguments)
    }

    pub fn and_invoke(mut self, capability_name: &str, arguments: Value) -> Self {
        self.invocations.push(PlannedInvocation {
            capability_name: capability_name.to_string(),
            arguments,
        });
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.invocations.is_empty()
    }
}

/// The reasoning policy. Implementations must be side-effect free with
/// respect to thread state: they only return a decision.
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn reason(&self, context: &ReasoningContext) -> Result<Decision>;
}
