//! Test server harness for E2E tests
//!
//! Starts both server planes on ephemeral ports, sharing one registry, so a
//! test can point a tunnel client at `control_addr` and public requests at
//! `http_addr`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use nrp_server::{ClientRegistry, ControlPlane, HttpPlane};

/// Parent domain every test tunnel is exposed under
pub const TEST_SUBDOMAIN_HOST: &str = "t.test";

/// A running test server instance
pub struct TestServer {
    /// Tunnel listener address
    pub control_addr: SocketAddr,
    /// Public edge address
    pub http_addr: SocketAddr,
    /// Fallback parent domain for clients that do not name one
    pub subdomain_host: String,
    /// Registry shared by both planes, for assertions
    pub registry: Arc<ClientRegistry>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    /// Start a test server with generous timeouts
    pub async fn start() -> Self {
        Self::start_with(Duration::from_secs(10), Duration::from_secs(60)).await
    }

    /// Start a test server with explicit edge response and tunnel idle timeouts
    pub async fn start_with(response_timeout: Duration, idle_timeout: Duration) -> Self {
        let subdomain_host = TEST_SUBDOMAIN_HOST.to_string();
        let registry = ClientRegistry::new(Some(subdomain_host.clone()));

        let control_plane = ControlPlane::new(registry.clone(), idle_timeout);
        let http_plane = HttpPlane::new(registry.clone(), response_timeout);

        let control_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind control plane");
        let http_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind HTTP plane");

        let control_addr = control_listener.local_addr().unwrap();
        let http_addr = http_listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            tokio::select! {
                result = control_plane.run_with_listener(control_listener) => {
                    if let Err(e) = result {
                        tracing::error!("Control plane error: {}", e);
                    }
                }
                result = http_plane.run_with_listener(http_listener) => {
                    if let Err(e) = result {
                        tracing::error!("HTTP plane error: {}", e);
                    }
                }
                _ = shutdown_rx => {
                    tracing::debug!("Test server shutting down");
                }
            }
        });

        Self {
            control_addr,
            http_addr,
            subdomain_host,
            registry,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Get the Host header value for a subdomain (e.g., "app.t.test")
    pub fn host_for(&self, subdomain: &str) -> String {
        format!("{}.{}", subdomain, self.subdomain_host)
    }

    /// Get a URL on the public edge; the Host header selects the tunnel
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.http_addr, path)
    }

    /// Get a WebSocket URL on the public edge
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.http_addr, path)
    }

    /// Poll until `host` resolves to a registered tunnel, or `expected` is false and it no longer does
    pub async fn wait_for_route(&self, host: &str, expected: bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.registry.resolve(host).is_some() != expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "route for {} never became {}",
                host,
                if expected { "present" } else { "absent" }
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the client with `id` is no longer registered
    pub async fn wait_for_unregistered(&self, id: u64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.registry.is_registered(id) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "client {} never unregistered",
                id
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop accepting tunnel and public connections
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
