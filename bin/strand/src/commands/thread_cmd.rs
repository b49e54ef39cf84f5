use strand_storage::open_checkpoint_store;

/// Print the latest checkpointed state of a thread as JSON.
pub async fn show(thread: &str) -> anyhow::Result<()> {
    let (config, paths) = super::load_config()?;
    let store = open_checkpoint_store(&config, &paths).await?;
    let state = store.load(thread).await?;

    println!();
    println!("Thread {} (checkpoint {}, {})", state.thread_id, state.checkpoint_id, state.status);
    let outstanding = state.messages.outstanding();
    if !outstanding.is_empty() {
        println!("  {} outstanding invocation(s)", outstanding.len());
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&state.messages)?);
    Ok(())
}

pub async fn history(thread: &str) -> anyhow::Result<()> {
    let (config, paths) = super::load_config()?;
    let store = open_checkpoint_store(&config, &paths).await?;
    let rows = store.history(thread).await?;
    if rows.is_empty() {
        anyhow::bail!("Thread '{}' has no checkpoints", thread);
    }

    println!();
    println!("  {:<12} {:<22} {}", "CHECKPOINT", "STATUS", "CREATED");
    for row in rows {
        println!(
            "  {:<12} {:<22} {}",
            row.checkpoint_id,
            row.status.as_str(),
            row.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
    Ok(())
}

pub async fn delete(thread: &str) -> anyhow::Result<()> {
    let (config, paths) = super::load_config()?;
    let store = open_checkpoint_store(&config, &paths).await?;
    if store.delete(thread).await? {
        println!("Deleted thread {}", thread);
    } else {
        println!("Thread {} not found", thread);
    }
    Ok(())
}
