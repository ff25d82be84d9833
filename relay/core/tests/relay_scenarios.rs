//! End-to-End Relay Scenarios
//!
//! Drives the orchestrator against real HTTP upstreams (wiremock servers)
//! through the production provider factory and client pool.
//!
//! # Running
//!
//! ```bash
//! cargo test -p relay-core --test relay_scenarios
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use wiremock::matchers::{body_json, header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relay_core::provider::{ClientConfig, ClientPool, HttpProviderFactory};
use relay_core::quota::{InMemoryQuotaStore, PriceTable, QuotaLedger, QuotaStore};
use relay_core::relay::{RelayOrchestrator, RelaySettings};
use relay_core::routing::health::{ChannelHealthTracker, HealthConfig};
use relay_core::routing::selector::{ModelAliases, StaticChannelRegistry};
use relay_core::{Channel, InboundRequest, RelayError};

// =============================================================================
// Test Infrastructure
// =============================================================================

struct Gateway {
    relay: RelayOrchestrator,
    store: Arc<InMemoryQuotaStore>,
}

impl Gateway {
    fn new(channels: Vec<Channel>) -> Self {
        Self::with_cooldown(channels, Duration::ZERO)
    }

    fn with_cooldown(channels: Vec<Channel>, cooldown: Duration) -> Self {
        let store = Arc::new(InMemoryQuotaStore::new().with_balance("alice", 100));
        let ledger = Arc::new(QuotaLedger::new(store.clone(), PriceTable::default()));
        let pool = Arc::new(ClientPool::new(ClientConfig {
            response_header_timeout: Duration::from_secs(5),
            ..ClientConfig::default()
        }));

        let relay = RelayOrchestrator::new(
            &RelaySettings::default(),
            Arc::new(StaticChannelRegistry::new(channels)),
            ModelAliases::default(),
            Arc::new(HttpProviderFactory::new(pool)),
            ledger,
            Arc::new(ChannelHealthTracker::with_config(HealthConfig { cooldown })),
        )
        .unwrap();

        Self { relay, store }
    }

    fn balance(&self) -> i64 {
        self.store.balance("alice").unwrap()
    }
}

fn channel(id: i64, server: &MockServer) -> Channel {
    Channel::new(id, server.uri())
        .with_name(format!("upstream-{id}"))
        .with_model("solver")
}

fn request(model: &str) -> InboundRequest {
    InboundRequest::new(Method::POST, "/generalProxy/v1/run")
        .with_header("X-API-Model", model)
        .with_header("Content-Type", "application/json")
        .with_body(r#"{"input":1}"#)
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_missing_model_header_is_bad_request_without_reservation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let gw = Gateway::new(vec![channel(1, &server)]);
    let inbound = InboundRequest::new(Method::POST, "/generalProxy/v1/run").with_body("{}");
    let err = gw.relay.relay("alice", inbound).await.unwrap_err();

    assert!(matches!(err, RelayError::BadRequest(_)));
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    assert_eq!(gw.relay.ledger().stats().reserved, 0);
    assert_eq!(gw.balance(), 100);
}

#[tokio::test]
async fn test_single_channel_success_passes_response_through() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/run"))
        .and(header("content-type", "application/json"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-upstream-id", "abc")
                .set_body_string(r#"{"ok":true}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let gw = Gateway::new(vec![channel(1, &server)]);
    let outcome = gw.relay.relay("alice", request("solver")).await.unwrap();

    assert_eq!(outcome.response.status, StatusCode::OK);
    assert_eq!(outcome.response.headers.get("x-upstream-id").unwrap(), "abc");
    assert_eq!(outcome.channel_id, 1);
    assert_eq!(outcome.attempts, 1);

    let body = outcome.response.collect_body().await.unwrap();
    assert_eq!(body, Bytes::from_static(br#"{"ok":true}"#));

    // Small payloads round down to zero units; the flat request price applies
    assert_eq!(outcome.usage.total_units, 0);
    assert_eq!(outcome.settlement.charged, 1);
    assert_eq!(gw.balance(), 99);

    let stats = gw.relay.ledger().stats();
    assert_eq!(stats.reserved, 1);
    assert_eq!(stats.consumed, 1);
    assert_eq!(stats.released, 0);
}

#[tokio::test]
async fn test_server_error_fails_over_and_disables_channel() {
    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(1)
        .mount(&failing)
        .await;

    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("second"))
        .expect(1)
        .mount(&healthy)
        .await;

    let gw = Gateway::new(vec![
        channel(1, &failing).with_priority(10),
        channel(2, &healthy),
    ]);
    let outcome = gw.relay.relay("alice", request("solver")).await.unwrap();

    assert_eq!(outcome.response.status, StatusCode::OK);
    assert_eq!(outcome.channel_id, 2);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(
        outcome.response.collect_body().await.unwrap(),
        Bytes::from_static(b"second")
    );
    assert!(gw.relay.health().is_disabled(1));
    assert!(!gw.relay.health().is_disabled(2));

    let metrics = gw.relay.metrics().snapshot();
    assert_eq!(metrics.attempts_total, 2);
    assert_eq!(metrics.retries_total, 1);
    assert_eq!(metrics.upstream_server_errors, 1);
    assert_eq!(metrics.channels_disabled, 1);
}

#[tokio::test]
async fn test_rate_limited_only_channel_exhausts_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let gw = Gateway::new(vec![channel(1, &server)]);
    let err = gw.relay.relay("alice", request("solver")).await.unwrap_err();

    match &err {
        RelayError::Exhausted {
            attempts, status, ..
        } => {
            assert_eq!(*attempts, 4);
            assert_eq!(*status, StatusCode::BAD_GATEWAY);
        }
        other => panic!("expected exhausted, got {other:?}"),
    }
    assert!(err.to_string().contains("slow down"));
    assert!(gw.relay.health().is_disabled(1));

    // Disabled after the first 429, so later attempts never reach upstream
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(gw.balance(), 100);

    let stats = gw.relay.ledger().stats();
    assert_eq!(stats.released, 1);
    assert_eq!(stats.consumed, 0);
}

#[tokio::test]
async fn test_client_error_stops_without_disabling() {
    let first = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid task"))
        .expect(1)
        .mount(&first)
        .await;

    let second = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&second)
        .await;

    let gw = Gateway::new(vec![channel(1, &first).with_priority(10), channel(2, &second)]);
    let err = gw.relay.relay("alice", request("solver")).await.unwrap_err();

    assert!(matches!(err, RelayError::Exhausted { attempts: 1, .. }));
    assert!(err.to_string().contains("invalid task"));
    assert!(!gw.relay.health().is_disabled(1));
    assert_eq!(gw.balance(), 100);
}

#[tokio::test]
async fn test_transport_fault_retries_on_another_channel() {
    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&healthy)
        .await;

    let gw = Gateway::new(vec![
        Channel::new(1, "http://127.0.0.1:1")
            .with_model("solver")
            .with_priority(10),
        channel(2, &healthy),
    ]);
    let outcome = gw.relay.relay("alice", request("solver")).await.unwrap();

    assert_eq!(outcome.channel_id, 2);
    assert_eq!(outcome.attempts, 2);
    assert!(!gw.relay.health().is_disabled(1));
    assert_eq!(gw.relay.metrics().snapshot().transport_faults, 1);
}

#[tokio::test]
async fn test_misconfigured_channel_is_disabled_and_fails_over() {
    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/run"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(2)
        .mount(&healthy)
        .await;

    let gw = Gateway::new(vec![
        Channel::new(1, "").with_model("solver").with_priority(10),
        channel(2, &healthy),
    ]);
    let outcome = gw.relay.relay("alice", request("solver")).await.unwrap();

    assert_eq!(outcome.channel_id, 2);
    assert_eq!(outcome.attempts, 2);
    assert!(gw.relay.health().is_disabled(1));
    assert!(!gw.relay.health().is_disabled(2));

    // The broken channel stays out of rotation for later requests
    let outcome = gw.relay.relay("alice", request("solver")).await.unwrap();
    assert_eq!(outcome.channel_id, 2);
    assert_eq!(outcome.attempts, 1);

    let metrics = gw.relay.metrics().snapshot();
    assert_eq!(metrics.internal_errors, 1);
    assert_eq!(metrics.channels_disabled, 1);
    assert_eq!(gw.balance(), 98);
}

#[tokio::test]
async fn test_cooldown_spreads_back_to_back_requests() {
    let a = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("a"))
        .expect(1)
        .mount(&a)
        .await;

    let b = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("b"))
        .expect(1)
        .mount(&b)
        .await;

    let gw = Gateway::with_cooldown(
        vec![channel(1, &a).with_priority(10), channel(2, &b)],
        Duration::from_secs(60),
    );

    let first = gw.relay.relay("alice", request("solver")).await.unwrap();
    let second = gw.relay.relay("alice", request("solver")).await.unwrap();

    assert_eq!(first.channel_id, 1);
    assert_eq!(second.channel_id, 2);

    // Both channels cooling: nothing left to pick
    let err = gw.relay.relay("alice", request("solver")).await.unwrap_err();
    assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(gw.balance(), 98);
}

#[tokio::test]
async fn test_credentials_and_auth_proxy_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .and(query_param("verbose", "1"))
        .and(header("authorization", "Basic dXNlcjpwYXNz"))
        .and(header("x-vendor-key", "k-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let gw = Gateway::new(vec![channel(1, &server).with_key(r#"{"X-Vendor-Key":"k-1"}"#)]);
    let inbound = InboundRequest::new(Method::GET, "/generalProxy/status")
        .with_query("verbose=1")
        .with_header("X-API-Model", "solver")
        .with_header("Authorization", "Bearer caller-token")
        .with_header("Auth-proxy", "Basic dXNlcjpwYXNz");

    let outcome = gw.relay.relay("alice", inbound).await.unwrap();
    assert_eq!(outcome.response.status, StatusCode::OK);

    let received = server.received_requests().await.unwrap();
    assert!(received[0].headers.get("x-api-model").is_none());
    assert!(received[0].headers.get("auth-proxy").is_none());
}

#[tokio::test]
async fn test_task_model_body_rewrite() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/createTask"))
        .and(body_json(serde_json::json!({
            "appId": "app-7",
            "clientKey": "ck-9",
            "task": {"type": "AntiTurnstileTaskProxyLess", "websiteURL": "https://site"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"taskId":1}"#))
        .expect(1)
        .mount(&server)
        .await;

    let gw = Gateway::new(vec![Channel::new(1, server.uri())
        .with_model("CapchaTurnstileTask")
        .with_key(r#"{"appId":"app-7","clientKey":"ck-9"}"#)]);

    let inbound = InboundRequest::new(Method::POST, "/generalProxy/createTask")
        .with_header("X-API-Model", "CapchaTurnstileTask")
        .with_body(r#"{"task":{"websiteURL":"https://site"}}"#);

    let outcome = gw.relay.relay("alice", inbound).await.unwrap();
    assert_eq!(outcome.response.status, StatusCode::OK);

    let received = server.received_requests().await.unwrap();
    assert!(received[0].headers.get("appid").is_none());
}

#[tokio::test]
async fn test_malformed_task_body_is_bad_request() {
    let server = MockServer::start().await;
    Mock::given(header_exists("x-never"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let gw = Gateway::new(vec![
        Channel::new(1, server.uri()).with_model("CapchaTurnstileTask")
    ]);
    let inbound = InboundRequest::new(Method::POST, "/generalProxy/createTask")
        .with_header("X-API-Model", "CapchaTurnstileTask")
        .with_body("not json");

    let err = gw.relay.relay("alice", inbound).await.unwrap_err();
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    assert_eq!(err.kind(), "bad_request");
    assert!(server.received_requests().await.unwrap().is_empty());
    assert_eq!(gw.balance(), 100);
}
