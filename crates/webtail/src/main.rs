use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use webtail::{Config, ProxyInstance, ProxyManager};
use webtail_tailnet::{LoopbackTailnet, TailnetBackend};

/// Set at build time via the WEBTAIL_VERSION environment variable.
const VERSION: &str = match option_env!("WEBTAIL_VERSION") {
    Some(version) => version,
    None => env!("CARGO_PKG_VERSION"),
};

/// Webtail - expose local services as TLS-terminated tailnet nodes
#[derive(Parser, Debug)]
#[command(name = "webtail")]
#[command(version = VERSION)]
#[command(about = "Expose local services as TLS-terminated nodes on a private tailnet")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("webtail=info".parse()?)
                .add_directive("webtail_tailnet=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;

    tracing::info!(services = config.services.len(), "loaded configuration");

    let settings = Arc::new(config.tailscale);
    let backend: Arc<dyn TailnetBackend> = LoopbackTailnet::new(settings.tailnet_domain.clone());

    let proxies = config
        .services
        .into_iter()
        .map(|spec| ProxyInstance::new(spec, settings.clone(), backend.clone()))
        .collect();
    let manager = ProxyManager::new(proxies);

    let started = manager.start_all().await;
    if started == 0 {
        anyhow::bail!("no proxies could be started");
    }
    tracing::info!(started, "proxies running, press Ctrl+C to stop");

    shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping proxies");

    manager.stop_all().await;
    tracing::info!("shutdown complete");

    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
