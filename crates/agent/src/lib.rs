pub mod engine;
pub mod openai;
pub mod reasoner;
pub mod session;
pub mod window;

pub use engine::{Engine, RunError, RunOutcome, RunStatus};
pub use openai::OpenAiReasoner;
pub use reasoner::{Decision, PlannedInvocation, Reasoner, ReasoningContext};
pub use session::{InstructionSource, SessionCoordinator, StaticInstructions};
pub use window::window;
