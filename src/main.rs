use std::sync::Arc;

use shadow_mesh::logging;
use shadow_mesh::{Janitor, MeshConfig};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration comes from SHADOW_MESH_CONFIG / SHADOW_MESH_ROOT
    let config = MeshConfig::from_env()?;

    // Keep the guard so file logs flush on exit
    let _log_guard = logging::init_logging(&config)?;

    tracing::info!("=== Mesh Janitor Starting ===");

    let janitor = Janitor::new(Arc::new(config.file_store()), config.clone());

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
        }
        shutdown.cancel();
    });

    // Run until Ctrl-C
    janitor.run(cancel).await;

    tracing::info!("=== Mesh Janitor Shutting Down ===");

    Ok(())
}
