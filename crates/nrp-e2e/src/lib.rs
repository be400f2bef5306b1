//! End-to-end test utilities for the nrp tunnel system
//!
//! Everything runs in-process on ephemeral ports: the server planes, the
//! tunnel client, the local services it exposes and a proxy that records the
//! frames crossing the tunnel connection.

pub mod harness;
pub mod mock_service;
pub mod mock_ws_service;
pub mod tap_proxy;
pub mod test_client;

pub use harness::TestServer;
pub use mock_service::{MockHttpService, RecordedRequest};
pub use mock_ws_service::MockWsService;
pub use tap_proxy::{Direction, TapProxy, TappedFrame};
pub use test_client::TestClient;

/// Initialize tracing for tests (idempotent)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("nrp=debug,nrp_server=debug,nrp_e2e=debug")
        .with_test_writer()
        .try_init();
}
