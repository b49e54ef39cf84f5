use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Schema violation for '{capability}': {message}")]
    SchemaViolation { capability: String, message: String },

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Capability '{capability}' already registered")]
    DuplicateCapability { capability: String },

    #[error("Handler failure in '{capability}': {message}")]
    HandlerFailure { capability: String, message: String },

    #[error("Reasoning timed out after {0}ms")]
    ReasoningTimeout(u64),

    #[error("Reasoning failed: {0}")]
    ReasoningFailure(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Checkpoint conflict on thread '{thread_id}': expected checkpoint {expected}, found {actual}")]
    CheckpointConflict {
        thread_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Cycle limit of {0} exceeded")]
    CycleLimitExceeded(u32),

    #[error("Tool result references unmatched invocation '{0}'")]
    UnmatchedResult(String),

    #[error("Thread has {0} outstanding invocation(s)")]
    OutstandingInvocations(usize),

    #[error("Thread '{0}' already has an active run")]
    ThreadBusy(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable reason code, shared by run outcomes, tool-result payloads and
    /// protocol error records.
    pub fn code(&self) -> &'static str {
        match self {
            Error::SchemaViolation { .. } => "SchemaViolation",
            Error::UnknownCapability(_) => "UnknownCapability",
            Error::DuplicateCapability { .. } => "DuplicateCapability",
            Error::HandlerFailure { .. } => "HandlerFailure",
            Error::ReasoningTimeout(_) => "ReasoningTimeout",
            Error::ReasoningFailure(_) => "ReasoningFailure",
            Error::Transport(_) => "TransportError",
            Error::Protocol(_) => "ProtocolViolation",
            Error::CheckpointConflict { .. } => "CheckpointConflict",
            Error::CycleLimitExceeded(_) => "CycleLimitExceeded",
            Error::UnmatchedResult(_) => "UnmatchedResult",
            Error::OutstandingInvocations(_) => "OutstandingInvocations",
            Error::ThreadBusy(_) => "ThreadBusy",
            Error::NotFound(_) => "NotFound",
            Error::Config(_) => "ConfigError",
            Error::Storage(_) => "StorageError",
            Error::Io(_) => "IoError",
            Error::Json(_) => "JsonError",
            Error::Other(_) => "Other",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::HandlerFailure { .. } | Error::ReasoningTimeout(_) | Error::ReasoningFailure(_)
        )
    }

    pub fn handler(capability: &str, message: impl std::fmt::Display) -> Self {
        Error::HandlerFailure {
            capability: capability.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
