use strand_core::{Config, Paths};

/// Show the effective configuration (file plus environment overrides).
pub async fn show() -> anyhow::Result<()> {
    let (config, paths) = super::load_config()?;
    let mut json = serde_json::to_value(&config)?;
    if let Some(key) = json.pointer_mut("/reasoner/apiKey") {
        if key.as_str().is_some_and(|k| !k.is_empty()) {
            *key = serde_json::Value::String("***".to_string());
        }
    }

    println!();
    println!("Current configuration");
    println!("  File: {}", paths.config_file().display());
    println!("  Checkpoint backend: {:?}", config.checkpoint_backend(&paths));
    println!();
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

/// Write the default configuration file.
pub async fn init(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let path = paths.config_file();
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
