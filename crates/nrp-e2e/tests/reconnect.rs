//! Tunnel lifecycle E2E tests
//!
//! Broken tunnels, reconnects and idle timeouts.

use std::time::Duration;

use reqwest::StatusCode;

use nrp::ClientState;
use nrp_e2e::{init_tracing, Direction, MockHttpService, TapProxy, TestClient, TestServer};
use nrp_protocol::{FrameType, SettingsAck};

fn init_test() {
    init_tracing();
}

async fn get(server: &TestServer, host: &str) -> reqwest::Response {
    reqwest::Client::new()
        .get(server.url("/"))
        .header("Host", host)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_client_reconnects_after_tunnel_drop() {
    init_test();

    let server = TestServer::start().await;
    let tap = TapProxy::start(server.control_addr).await;
    let service = MockHttpService::start().await;
    service.set_response_body("back");

    let client = TestClient::connect(tap.addr(), "t.test", &[("r", service.port())]).await;
    let first_id = client.client.client_id().unwrap();
    assert_eq!(get(&server, "r.t.test").await.status(), StatusCode::OK);

    tap.drop_connections();

    let second_id = client.wait_reregistered(first_id).await;
    assert_ne!(first_id, second_id);
    assert_eq!(client.state(), ClientState::Active);

    // Each connection opened with SETTINGS and was acknowledged with its id
    assert_eq!(tap.count(Direction::ToServer, FrameType::Settings), 2);
    let acks: Vec<u64> = tap
        .frames()
        .into_iter()
        .filter(|t| t.direction == Direction::ToClient && t.frame.kind() == FrameType::Settings)
        .map(|t| t.frame.json::<SettingsAck>().unwrap().id)
        .collect();
    assert_eq!(acks, vec![first_id, second_id]);

    server.wait_for_route("r.t.test", true).await;
    server.wait_for_unregistered(first_id).await;
    assert!(server.registry.is_registered(second_id));

    let resp = get(&server, "r.t.test").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "back");
}

#[tokio::test]
async fn test_inflight_request_fails_when_tunnel_drops() {
    init_test();

    let server = TestServer::start().await;
    let tap = TapProxy::start(server.control_addr).await;
    let service = MockHttpService::start().await;
    service.set_response_delay(Duration::from_secs(2));

    let _client = TestClient::connect(tap.addr(), "t.test", &[("drop", service.port())]).await;

    let pending = tokio::spawn({
        let url = server.url("/");
        async move {
            reqwest::Client::new()
                .get(url)
                .header("Host", "drop.t.test")
                .timeout(Duration::from_secs(5))
                .send()
                .await
        }
    });

    // Let the request reach the local service before breaking the tunnel
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while service.get_requests().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "request never forwarded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tap.drop_connections();

    let resp = pending.await.unwrap().unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_idle_tunnel_is_dropped_and_reestablished() {
    init_test();

    // No pings from the test client, so the server's idle timeout fires
    let server = TestServer::start_with(Duration::from_secs(5), Duration::from_millis(300)).await;
    let service = MockHttpService::start().await;

    let client = TestClient::connect(
        server.control_addr,
        &server.subdomain_host,
        &[("idle", service.port())],
    )
    .await;
    let first_id = client.client.client_id().unwrap();

    let second_id = client.wait_reregistered(first_id).await;
    assert!(second_id > first_id);
    server.wait_for_unregistered(first_id).await;
}
