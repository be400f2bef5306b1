//! Test client for E2E tests
//!
//! Runs the real [`TunnelClient`] in a background task with settings suited
//! to tests: fast reconnects and no pings to clutter frame recordings.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use nrp::{ClientError, ClientState, TunnelClient};
use nrp_protocol::{Backoff, ClientSettings, HttpSetting, ProtocolRevision};

/// A tunnel client running against a test server
pub struct TestClient {
    pub client: Arc<TunnelClient>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<Result<(), ClientError>>>,
}

impl TestClient {
    /// Settings exposing each `(subdomain, local_port)` under `subdomain_host`
    pub fn settings(
        server: SocketAddr,
        subdomain_host: Option<&str>,
        services: &[(&str, u16)],
    ) -> ClientSettings {
        let http = services
            .iter()
            .map(|(subdomain, port)| {
                (
                    subdomain.to_string(),
                    HttpSetting {
                        subdomain: subdomain.to_string(),
                        local_port: *port,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();

        ClientSettings {
            bind_port: server.port(),
            bind_host: server.ip().to_string(),
            subdomain_host: subdomain_host.map(str::to_string),
            timeout: Some(2_000),
            retry: None,
            backoff: Some(Backoff {
                min: 50,
                max: 200,
                factor: 2.0,
            }),
            protocol: ProtocolRevision::Extended,
            http,
        }
    }

    /// Start a client exposing `services` through the server (or tap proxy) at `server`
    pub async fn connect(server: SocketAddr, subdomain_host: &str, services: &[(&str, u16)]) -> Self {
        Self::connect_with(Self::settings(server, Some(subdomain_host), services)).await
    }

    /// Start a client with explicit settings and wait for its registration
    pub async fn connect_with(settings: ClientSettings) -> Self {
        let client = TunnelClient::new(settings, Duration::from_secs(3600))
            .expect("Failed to build tunnel client");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(client.clone().run_until(async move {
            let _ = shutdown_rx.await;
        }));

        let test_client = Self {
            client,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        };
        test_client.wait_registered().await;
        test_client
    }

    /// Wait for the server to acknowledge the current connection's settings
    pub async fn wait_registered(&self) -> u64 {
        self.wait_registration(|_| true).await
    }

    /// Wait for a registration with an id other than `previous`
    pub async fn wait_reregistered(&self, previous: u64) -> u64 {
        self.wait_registration(|id| id != previous).await
    }

    async fn wait_registration(&self, accept: impl Fn(u64) -> bool) -> u64 {
        let mut registrations = self.client.registrations();
        let id = *tokio::time::timeout(
            Duration::from_secs(5),
            registrations.wait_for(|id| (*id).is_some_and(&accept)),
        )
        .await
        .expect("Timed out waiting for registration")
        .expect("Client dropped");
        id.expect("registration present")
    }

    pub fn state(&self) -> ClientState {
        self.client.state()
    }

    /// Stop the client and wait for its connection to be torn down
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
