pub mod capability;
pub mod config;
pub mod error;
pub mod message;
pub mod paths;
pub mod thread;

pub use capability::CapabilityDescriptor;
pub use config::{CheckpointBackend, Config, DataServerConfig, ReasonerConfig, RuntimeConfig};
pub use error::{Error, Result};
pub use message::{
    InvocationError, InvocationOutcome, InvocationRequest, InvocationResult, Message, MessageLog,
};
pub use paths::Paths;
pub use thread::{ThreadState, ThreadStatus};
