//! EdgeOne pipe daemon.
//!
//! Loads configuration, builds the key pool and gateway client, and
//! serves the host over a local JSON-RPC socket.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use edgeone_pipe::adapters::edgeone::EdgeOneGateway;
use edgeone_pipe::{Pipe, PipeConfig, PIPE_ID};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edgeone_pipe=info".into()),
        )
        .with_target(false)
        .init();

    info!("🌐 EdgeOne pipe v{} ({})", env!("CARGO_PKG_VERSION"), PIPE_ID);

    let config = PipeConfig::load().context("Failed to load configuration")?;

    let missing = config.missing_settings();
    if missing.is_empty() {
        info!(
            keys = config.keys().len(),
            models = config.models().len(),
            gateway = %config.gateway_name,
            "Configuration ready"
        );
    } else {
        warn!(missing = ?missing, "Pipe is not fully configured; chat requests will be rejected");
    }

    let gateway = EdgeOneGateway::new(&config).context("Failed to build gateway client")?;
    let socket_path = config.socket_path.clone();
    let pipe = Arc::new(Pipe::new(config, Arc::new(gateway)).context("Failed to initialise pipe")?);

    // ── Reload on SIGHUP ──
    {
        let pipe = Arc::clone(&pipe);
        let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                info!("SIGHUP received, reloading configuration");
                match PipeConfig::load().and_then(|c| pipe.reload(c)) {
                    Ok(()) => info!("Configuration reloaded"),
                    Err(e) => error!("Reload failed, keeping previous configuration: {}", e),
                }
            }
        });
    }

    let srv = edgeone_pipe::server::Server::new(socket_path, pipe);
    srv.run().await?;

    Ok(())
}
