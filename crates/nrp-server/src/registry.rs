use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use nrp_protocol::ClientSettings;

use crate::session::TunnelSession;

/// A tunnel client that completed the SETTINGS handshake
pub struct RegisteredClient {
    pub id: u64,
    pub session: Arc<TunnelSession>,
    pub settings: ClientSettings,
    /// Public domains routed to this client
    pub domains: Vec<String>,
}

/// Registered clients and the virtual-host map that routes to them
pub struct ClientRegistry {
    next_id: AtomicU64,
    clients: DashMap<u64, RegisteredClient>,
    /// Domain -> tunnel session
    hosts: DashMap<String, Arc<TunnelSession>>,
    /// Parent domain for clients whose settings omit `subdomain_host`
    fallback_host: Option<String>,
}

impl ClientRegistry {
    pub fn new(fallback_host: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            clients: DashMap::new(),
            hosts: DashMap::new(),
            fallback_host,
        })
    }

    /// Register (or re-register) the client behind a tunnel session
    ///
    /// Returns the client id to acknowledge the handshake with. A session that
    /// sends SETTINGS again keeps its id and has its domains replaced.
    pub fn register(
        &self,
        session: &Arc<TunnelSession>,
        settings: ClientSettings,
    ) -> Result<u64, RegistryError> {
        let domains = settings.domains(self.fallback_host.as_deref());
        if domains.is_empty() && !settings.http.is_empty() {
            return Err(RegistryError::MissingSubdomainHost);
        }

        let id = match session.client_id() {
            Some(id) => {
                self.remove_hosts(session);
                id
            }
            None => self.next_id.fetch_add(1, Ordering::Relaxed),
        };

        let mut names = Vec::with_capacity(domains.len());
        for (domain, local_port) in domains {
            if let Some(previous) = self.hosts.insert(domain.clone(), session.clone()) {
                if !Arc::ptr_eq(&previous, session) {
                    tracing::warn!(
                        "Domain {} taken over by client {} (was {:?})",
                        domain,
                        id,
                        previous.client_id()
                    );
                }
            }
            tracing::info!("Client {}: {} -> local port {}", id, domain, local_port);
            names.push(domain);
        }

        session.set_client_id(Some(id));
        self.clients.insert(
            id,
            RegisteredClient {
                id,
                session: session.clone(),
                settings,
                domains: names,
            },
        );
        Ok(id)
    }

    /// Remove the client behind a session and every domain pointing at it
    pub fn unregister(&self, session: &Arc<TunnelSession>) -> Option<RegisteredClient> {
        self.remove_hosts(session);
        let id = session.client_id()?;
        session.set_client_id(None);
        self.clients.remove(&id).map(|(_, client)| client)
    }

    fn remove_hosts(&self, session: &Arc<TunnelSession>) {
        self.hosts.retain(|_, s| !Arc::ptr_eq(s, session));
    }

    /// Find the tunnel session serving a `Host` header value
    ///
    /// The exact (lower-cased) value wins; otherwise the port is stripped.
    pub fn resolve(&self, host: &str) -> Option<Arc<TunnelSession>> {
        let host = host.trim().to_ascii_lowercase();
        if let Some(session) = self.hosts.get(&host) {
            return Some(session.clone());
        }

        let bare = host.rsplit_once(':').map(|(name, _)| name)?;
        self.hosts.get(bare).map(|s| s.clone())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_registered(&self, id: u64) -> bool {
        self.clients.contains_key(&id)
    }

    /// List all routed domains
    pub fn list_domains(&self) -> Vec<String> {
        self.hosts.iter().map(|r| r.key().clone()).collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Settings expose services but carry no subdomain_host")]
    MissingSubdomainHost,
}
