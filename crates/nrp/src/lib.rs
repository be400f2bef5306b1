//! nrp tunnel client library
//!
//! [`TunnelClient`] keeps one tunnel connection to the server alive and
//! replays the streams it carries against local services through a
//! [`LocalRelay`].

mod config;
mod connector;
mod forwarder;
mod ws_forwarder;

pub use config::{ClientConfig, ResolvedClientConfig};
pub use connector::{
    backoff_delay, ClientError, ClientState, TunnelClient, TunnelConnection,
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_PING_INTERVAL,
};
pub use forwarder::{ExchangeKind, HostMap, LocalRelay, LOCAL_HOST};
