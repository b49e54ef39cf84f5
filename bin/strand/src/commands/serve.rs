use std::path::PathBuf;
use strand_core::Paths;
use strand_tools::{finance, profile, ProtocolServer};
use tracing::info;

/// Run the profile data server on stdin/stdout until the peer disconnects.
pub async fn run(profiles: Option<PathBuf>, with_finance: bool) -> anyhow::Result<()> {
    let path = profiles.unwrap_or_else(|| Paths::new().profiles_file());
    let mut registry = profile::profile_registry(&path)?;
    if with_finance {
        for capability in finance::capabilities() {
            registry.register(capability)?;
        }
    }

    info!(
        profiles = %path.display(),
        capabilities = ?registry.names(),
        "Serving data protocol on stdio"
    );
    ProtocolServer::new(registry).serve_stdio().await?;
    info!("Data protocol peer disconnected");
    Ok(())
}
