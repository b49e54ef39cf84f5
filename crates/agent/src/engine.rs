use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use strand_core::{
    Error, InvocationRequest, InvocationResult, Message, Result, RuntimeConfig, ThreadState, ThreadStatus,
};
use strand_storage::CheckpointStore;
use strand_tools::CapabilityRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::reasoner::{Decision, Reasoner, ReasoningContext};
use crate::window::window;

/// How a run ended, as seen by its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Done,
    Error,
    /// Stopped early but resumable.
    Running,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunStatus::Done => "DONE",
            RunStatus::Error => "ERROR",
            RunStatus::Running => "running",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunError {
    pub code: String,
    pub message: String,
}

impl From<&Error> for RunError {
    fn from(e: &Error) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// Result of one run. Failures are reported here, never raised.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub thread_id: String,
    pub status: RunStatus,
    pub thread_status: ThreadStatus,
    /// Text of the last assistant message in the thread, if any.
    pub final_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub checkpoint_id: u64,
    pub reasoning_steps: u32,
    pub cycles: u32,
}

impl RunOutcome {
    pub fn is_done(&self) -> bool {
        self.status == RunStatus::Done
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

enum Step {
    Reason,
    Invoke,
}

enum Exit {
    Done,
    Cancelled,
}

/// Per-run counters. Nothing here survives the run.
#[derive(Default)]
struct Counters {
    cycles: u32,
    reasoning_steps: u32,
}

/// The REASON / INVOKE state machine.
///
/// Every run starts in REASON. Where a run actually resumes is derived from
/// the log alone: outstanding requests are resolved before anything else, so
/// a thread reloaded after a crash continues exactly where its last
/// checkpoint left it.
pub struct Engine {
    registry: Arc<CapabilityRegistry>,
    reasoner: Arc<dyn Reasoner>,
    store: Arc<dyn CheckpointStore>,
    config: RuntimeConfig,
}

impl Engine {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        reasoner: Arc<dyn Reasoner>,
        store: Arc<dyn CheckpointStore>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            reasoner,
            store,
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Drive `state` until DONE, ERROR or cancellation.
    ///
    /// The caller must hold the thread exclusively for the whole call.
    pub async fn run(
        &self,
        mut state: ThreadState,
        user_message: Option<&str>,
        instructions: &str,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let mut counters = Counters::default();
        let result = self
            .drive(&mut state, user_message, instructions, cancel, &mut counters)
            .await;

        match result {
            Ok(Exit::Done) => Self::outcome(&state, RunStatus::Done, None, &counters),
            Ok(Exit::Cancelled) => Self::outcome(&state, RunStatus::Running, None, &counters),
            Err(e) => {
                error!(thread_id = %state.thread_id, code = e.code(), error = %e, "Run failed");
                state.status = ThreadStatus::Failed;
                // A conflicting writer owns the thread now; never overwrite it.
                if !matches!(e, Error::CheckpointConflict { .. }) {
                    if let Err(save_err) = self.checkpoint(&mut state).await {
                        error!(thread_id = %state.thread_id, error = %save_err, "Failed to checkpoint failed run");
                    }
                }
                Self::outcome(&state, RunStatus::Error, Some(RunError::from(&e)), &counters)
            }
        }
    }

    fn outcome(state: &ThreadState, status: RunStatus, error: Option<RunError>, counters: &Counters) -> RunOutcome {
        RunOutcome {
            thread_id: state.thread_id.clone(),
            status,
            thread_status: state.status,
            final_message: state.messages.last_assistant_text().map(str::to_string),
            error,
            checkpoint_id: state.checkpoint_id,
            reasoning_steps: counters.reasoning_steps,
            cycles: counters.cycles,
        }
    }

    async fn drive(
        &self,
        state: &mut ThreadState,
        user_message: Option<&str>,
        instructions: &str,
        cancel: &CancellationToken,
        counters: &mut Counters,
    ) -> Result<Exit> {
        let mut pending_user = user_message.map(str::to_string);
        let mut step = Step::Reason;

        // Accept the new turn before anything can stop the run. With requests
        // still outstanding it waits until they are resolved.
        if !state.messages.has_outstanding() {
            if let Some(text) = pending_user.take() {
                self.accept_user(state, &text).await?;
            }
        }

        loop {
            if cancel.is_cancelled() {
                info!(thread_id = %state.thread_id, "Run cancelled");
                if pending_user.is_some() {
                    // Every earlier change is already checkpointed.
                    warn!(thread_id = %state.thread_id, "Cancelled before the user message was accepted");
                    return Ok(Exit::Cancelled);
                }
                state.status = ThreadStatus::Running;
                self.checkpoint(state).await?;
                return Ok(Exit::Cancelled);
            }

            step = match step {
                // Requests left over from an interrupted run come first.
                Step::Reason if state.messages.has_outstanding() => Step::Invoke,
                Step::Reason => {
                    if let Some(text) = pending_user.take() {
                        self.accept_user(state, &text).await?;
                    } else if !has_user_turn(state) {
                        debug!(thread_id = %state.thread_id, "No user turn to answer");
                        return Ok(Exit::Done);
                    } else if counters.reasoning_steps == 0 && ends_with_reply(state) {
                        debug!(thread_id = %state.thread_id, "Nothing to resume");
                        if state.status != ThreadStatus::Completed {
                            state.status = ThreadStatus::Completed;
                            self.checkpoint(state).await?;
                        }
                        return Ok(Exit::Done);
                    }

                    let decision = self.reason(state, instructions, counters).await?;
                    if decision.is_terminal() {
                        state.messages.push_assistant(&decision.content, Vec::new())?;
                        state.status = ThreadStatus::Completed;
                        self.checkpoint(state).await?;
                        info!(
                            thread_id = %state.thread_id,
                            cycles = counters.cycles,
                            checkpoint_id = state.checkpoint_id,
                            "Run completed"
                        );
                        return Ok(Exit::Done);
                    }

                    if counters.cycles >= self.config.max_cycles {
                        warn!(
                            thread_id = %state.thread_id,
                            max_cycles = self.config.max_cycles,
                            "Cycle limit reached"
                        );
                        return Err(Error::CycleLimitExceeded(self.config.max_cycles));
                    }
                    counters.cycles += 1;

                    let requests: Vec<InvocationRequest> = decision
                        .invocations
                        .into_iter()
                        .map(|p| InvocationRequest::new(&p.capability_name, p.arguments))
                        .collect();
                    debug!(
                        thread_id = %state.thread_id,
                        cycle = counters.cycles,
                        count = requests.len(),
                        "Invocations requested"
                    );
                    state.messages.push_assistant(&decision.content, requests)?;
                    state.status = ThreadStatus::AwaitingInvocation;
                    self.checkpoint(state).await?;
                    Step::Invoke
                }
                Step::Invoke => {
                    let next = state.messages.outstanding().first().map(|r| (*r).clone());
                    match next {
                        Some(request) => {
                            self.resolve(state, &request).await?;
                            Step::Invoke
                        }
                        None => {
                            state.status = ThreadStatus::Running;
                            Step::Reason
                        }
                    }
                }
            };
        }
    }

    async fn accept_user(&self, state: &mut ThreadState, text: &str) -> Result<()> {
        state.messages.push_user(text)?;
        state.status = ThreadStatus::Running;
        self.checkpoint(state).await
    }

    /// Run one request and append its tool-result.
    async fn resolve(&self, state: &mut ThreadState, request: &InvocationRequest) -> Result<()> {
        let result = self.invoke_with_retry(&state.thread_id, request).await;
        let failure = match result {
            Ok(output) => {
                state.messages.push_result(InvocationResult::output(request, output))?;
                None
            }
            Err(e) => {
                state.messages.push_result(InvocationResult::error(request, &e))?;
                Some(e)
            }
        };

        match failure {
            None | Some(Error::SchemaViolation { .. }) | Some(Error::UnknownCapability(_)) => {
                if let Some(e) = &failure {
                    warn!(
                        thread_id = %state.thread_id,
                        capability = %request.capability_name,
                        error = %e,
                        "Invocation rejected; reported to reasoner"
                    );
                }
                state.status = if state.messages.has_outstanding() {
                    ThreadStatus::AwaitingInvocation
                } else {
                    ThreadStatus::Running
                };
                self.checkpoint(state).await
            }
            // The error result is already in the log; the failed checkpoint
            // is written by `run`.
            Some(fatal) => Err(fatal),
        }
    }

    async fn invoke_with_retry(&self, thread_id: &str, request: &InvocationRequest) -> Result<Value> {
        let limit = self.config.invocation_retry_limit;
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                let delay = self.config.retry_delay(attempt);
                warn!(
                    thread_id,
                    capability = %request.capability_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying invocation"
                );
                tokio::time::sleep(delay).await;
            }

            debug!(
                thread_id,
                invocation_id = %request.invocation_id,
                capability = %request.capability_name,
                "Invoking capability"
            );
            let call = self
                .registry
                .invoke(&request.capability_name, request.arguments.clone());
            let result = match tokio::time::timeout(self.config.invocation_timeout(), call).await {
                Ok(result) => result,
                Err(_) => Err(Error::handler(
                    &request.capability_name,
                    format!("timed out after {}ms", self.config.invocation_timeout_ms),
                )),
            };

            match result {
                Ok(output) => {
                    if attempt > 0 {
                        info!(thread_id, capability = %request.capability_name, attempt, "Invocation succeeded after retry");
                    }
                    return Ok(output);
                }
                Err(e) if e.is_retryable() && attempt < limit => {
                    warn!(thread_id, capability = %request.capability_name, attempt, error = %e, "Invocation failed");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn reason(&self, state: &ThreadState, instructions: &str, counters: &mut Counters) -> Result<Decision> {
        let context = ReasoningContext {
            thread_id: state.thread_id.clone(),
            instructions: instructions.to_string(),
            messages: window(&state.messages, self.config.context_window),
            capabilities: self.registry.descriptors(),
        };

        let limit = self.config.reasoning_retry_limit;
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                let delay = self.config.retry_delay(attempt);
                warn!(thread_id = %state.thread_id, attempt, delay_ms = delay.as_millis() as u64, "Retrying reasoning step");
                tokio::time::sleep(delay).await;
            }

            let result = match tokio::time::timeout(self.config.reasoning_timeout(), self.reasoner.reason(&context)).await {
                Ok(Ok(decision)) => Ok(decision),
                Ok(Err(e @ (Error::ReasoningFailure(_) | Error::ReasoningTimeout(_)))) => Err(e),
                Ok(Err(other)) => Err(Error::ReasoningFailure(other.to_string())),
                Err(_) => Err(Error::ReasoningTimeout(self.config.reasoning_timeout_ms)),
            };

            match result {
                Ok(decision) => {
                    counters.reasoning_steps += 1;
                    debug!(
                        thread_id = %state.thread_id,
                        step = counters.reasoning_steps,
                        invocations = decision.invocations.len(),
                        "Reasoning step complete"
                    );
                    return Ok(decision);
                }
                Err(e) if attempt < limit => {
                    warn!(thread_id = %state.thread_id, attempt, error = %e, "Reasoning step failed");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn checkpoint(&self, state: &mut ThreadState) -> Result<()> {
        let checkpoint_id = self.store.save(state).await?;
        state.checkpoint_id = checkpoint_id;
        debug!(
            thread_id = %state.thread_id,
            checkpoint_id,
            status = %state.status,
            messages = state.messages.len(),
            "Checkpoint written"
        );
        Ok(())
    }
}

fn has_user_turn(state: &ThreadState) -> bool {
    state.messages.iter().any(|m| matches!(m, Message::User { .. }))
}

/// True when the log already ends in a final assistant reply.
fn ends_with_reply(state: &ThreadState) -> bool {
    matches!(
        state.messages.last(),
        Some(Message::Assistant { invocations, .. }) if invocations.is_empty()
    )
}
