use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use nrp_server::{ClientRegistry, ControlPlane, HttpPlane, ServerConfig};

/// Tunnel server - accepts tunnel connections and routes public traffic
#[derive(Parser, Debug)]
#[command(name = "nrp-server")]
#[command(about = "Reverse-tunnel proxy server")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "server.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("nrp_server=info".parse()?)
                .add_directive("nrp_protocol=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting tunnel server with config: {}", args.config);

    let config = ServerConfig::load_and_resolve(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    match &config.subdomain_host {
        Some(host) => tracing::info!("Fallback subdomain host: {}", host),
        None => tracing::info!("No fallback subdomain host, clients must send their own"),
    }

    let registry = ClientRegistry::new(config.subdomain_host.clone());
    let control_plane = ControlPlane::new(registry.clone(), config.idle_timeout);
    let http_plane = HttpPlane::new(registry, config.response_timeout);

    let control_addr = SocketAddr::new(config.bind_addr, config.port);
    let http_addr = SocketAddr::new(config.bind_addr, config.vhost_http_port);

    tokio::select! {
        result = control_plane.run(control_addr) => {
            result.with_context(|| format!("Control plane on {} stopped", control_addr))?;
        }
        result = http_plane.run(http_addr) => {
            result.with_context(|| format!("HTTP plane on {} stopped", http_addr))?;
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, closing tunnels...");
        }
    }

    tracing::info!("Server shutdown complete");
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
