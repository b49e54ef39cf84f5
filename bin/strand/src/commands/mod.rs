pub mod capabilities;
pub mod config_cmd;
pub mod run_cmd;
pub mod serve;
pub mod thread_cmd;

use std::sync::Arc;
use strand_agent::{Engine, OpenAiReasoner, SessionCoordinator, StaticInstructions};
use strand_core::{Config, Paths};
use strand_storage::open_checkpoint_store;
use strand_tools::{CapabilityRegistry, ProtocolClient};
use tracing::info;

/// Endpoint name used in logs for the configured data server.
const DATA_SERVER_ENDPOINT: &str = "data-server";

pub(crate) fn load_config() -> anyhow::Result<(Config, Paths)> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    config.validate()?;
    Ok((config, paths))
}

/// Built-in capabilities plus whatever the configured data server declares.
///
/// The registry is complete before it is returned; nothing is added once a
/// run has started.
pub(crate) async fn build_registry(config: &Config) -> anyhow::Result<CapabilityRegistry> {
    let mut registry = CapabilityRegistry::with_defaults();
    if let Some(server) = &config.data_server {
        let client = ProtocolClient::spawn(DATA_SERVER_ENDPOINT, &server.command, &server.args, &server.env).await?;
        let count = registry.register_remote(Arc::new(client))?;
        info!(command = %server.command, count, "Discovered remote capabilities");
    }
    Ok(registry)
}

pub(crate) async fn build_coordinator() -> anyhow::Result<SessionCoordinator> {
    let (config, paths) = load_config()?;
    let registry = build_registry(&config).await?;
    let store = open_checkpoint_store(&config, &paths).await?;
    let reasoner = OpenAiReasoner::new(&config.reasoner, config.runtime.reasoning_timeout())?;

    info!(
        backend = store.backend_name(),
        capabilities = registry.len(),
        model = %config.reasoner.model,
        "Runtime ready"
    );
    let engine = Engine::new(Arc::new(registry), Arc::new(reasoner), store, config.runtime.clone());
    Ok(SessionCoordinator::new(
        engine,
        Arc::new(StaticInstructions::new(config.instructions)),
    ))
}
