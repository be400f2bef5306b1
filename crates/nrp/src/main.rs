use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use nrp::{ClientConfig, TunnelClient};

/// nrp - expose local services through a reverse tunnel
#[derive(Parser, Debug)]
#[command(name = "nrp")]
#[command(about = "Expose local HTTP and WebSocket services through a tunnel server")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "client.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("nrp=info".parse()?)
                .add_directive("nrp_protocol=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config = ClientConfig::load_and_resolve(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config))?;

    for (name, service) in &config.settings.http {
        tracing::info!(
            "Service {}: {}.{} -> 127.0.0.1:{}",
            name,
            service.subdomain,
            config.settings.subdomain_host.as_deref().unwrap_or("<server default>"),
            service.local_port
        );
    }

    let client = TunnelClient::new(config.settings, config.ping_interval)
        .context("Failed to create tunnel client")?;
    client
        .run_until(shutdown_signal())
        .await
        .context("Tunnel client stopped")?;

    tracing::info!("Client shutdown complete");
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
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
