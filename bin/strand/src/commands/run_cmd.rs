use strand_agent::{RunOutcome, RunStatus};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Cancelled on Ctrl-C; the run stops after its current step and stays resumable.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current step");
            child.cancel();
        }
    });
    token
}

fn report(outcome: &RunOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else {
        if let Some(text) = &outcome.final_message {
            println!("{}", text);
        }
        eprintln!(
            "[{}] thread={} checkpoint={} cycles={}",
            outcome.status, outcome.thread_id, outcome.checkpoint_id, outcome.cycles
        );
    }

    match (&outcome.status, &outcome.error) {
        (RunStatus::Error, Some(err)) => anyhow::bail!("{}: {}", err.code, err.message),
        (RunStatus::Running, _) => {
            eprintln!("Run interrupted. Continue with `strand resume --thread {}`.", outcome.thread_id);
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Append a message to a thread and run it.
pub async fn run(thread: &str, message: &str, json: bool) -> anyhow::Result<()> {
    let coordinator = super::build_coordinator().await?;
    let cancel = cancel_on_ctrl_c();
    let outcome = coordinator.run_with(thread, Some(message), &cancel).await?;
    report(&outcome, json)
}

/// Resume a thread without new input.
pub async fn resume(thread: &str, json: bool) -> anyhow::Result<()> {
    let coordinator = super::build_coordinator().await?;
    let cancel = cancel_on_ctrl_c();
    let outcome = coordinator.run_with(thread, None, &cancel).await?;
    report(&outcome, json)
}
