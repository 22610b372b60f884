use std::sync::Arc;

use reforger_core::config::GlobalConfig;
use reforger_core::ipc::IPCServer;
use reforger_core::supervisor::Supervisor;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("Reforger daemon starting");

    let cfg = GlobalConfig::load()?;
    tracing::info!(
        "Instances under {}, SteamCMD under {}",
        cfg.instances_dir().display(),
        cfg.steamcmd_dir().display()
    );

    let listen_addr = cfg.listen_addr.clone();
    let supervisor = Arc::new(Supervisor::new(cfg));
    supervisor.initialize().await?;

    // Graceful shutdown: Ctrl+C stops every server before the listener closes.
    let supervisor_shutdown = supervisor.clone();
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received, stopping servers...");
        supervisor_shutdown.shutdown().await;
        tracing::info!("Cleanup complete");
    };

    let ipc_server = IPCServer::new(supervisor, &listen_addr);
    if let Err(e) = ipc_server.start(shutdown).await {
        tracing::error!("IPC server error: {}", e);
        return Err(e);
    }

    tracing::info!("Reforger daemon shutting down");
    Ok(())
}
