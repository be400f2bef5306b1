//! nrp tunnel server library
//!
//! The control plane accepts tunnel client connections and answers their
//! SETTINGS handshake; the HTTP plane is the public edge that turns HTTP
//! requests and WebSocket upgrades into tunnel streams. Both share one
//! [`ClientRegistry`]. Embedding the planes directly is how the end-to-end
//! tests run a server.

mod config;
mod control_plane;
mod http_plane;
mod registry;
mod session;

pub use config::{ResolvedServerConfig, ServerConfig};
pub use control_plane::ControlPlane;
pub use http_plane::{EdgeBody, HttpPlane};
pub use registry::{ClientRegistry, RegisteredClient, RegistryError};
pub use session::{ExchangeGuard, ExchangeKind, PendingExchange, SessionError, TunnelSession};
