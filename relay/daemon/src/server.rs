//! Gateway HTTP Server
//!
//! Hosts the relay orchestrator behind axum:
//!
//! ```text
//!   client ──► ANY {prefix} | {prefix}/ | {prefix}/{*path}
//!                   │ caller auth (Bearer token)
//!                   │ buffer body
//!                   ▼
//!            RelayOrchestrator::relay ──► upstream
//!                   │
//!                   ▼
//!   status + headers copied, body streamed back
//! ```
//!
//! Every request runs inside a panic boundary. A panic anywhere in the
//! serving path becomes a structured 500 and the process keeps serving;
//! reservations held by the unwound request are released by their guards.

use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, CONNECTION, CONTENT_TYPE, TRANSFER_ENCODING};
use axum::http::{HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, error, warn};

use relay_core::config::{CallerConfig, GatewayConfig};
use relay_core::provider::{ClientPool, HttpProviderFactory};
use relay_core::quota::{InMemoryQuotaStore, QuotaLedger};
use relay_core::routing::health::ChannelHealthTracker;
use relay_core::routing::metrics::{FailureKind, RelayMetrics};
use relay_core::routing::selector::{ModelAliases, StaticChannelRegistry};
use relay_core::{InboundRequest, RelayError, RelayOrchestrator};

/// Largest inbound body buffered for replay across attempts
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Error kind reported for caught panics
pub const PANIC_ERROR_KIND: &str = "relay_panic";

// ============================================================================
// Shared State
// ============================================================================

/// Bearer token to caller id
#[derive(Clone, Debug, Default)]
pub struct CallerTable {
    by_token: HashMap<String, String>,
}

impl CallerTable {
    /// Build from configured callers
    pub fn new(callers: &[CallerConfig]) -> Self {
        let by_token = callers
            .iter()
            .map(|c| (c.token.clone(), c.name.clone()))
            .collect();
        Self { by_token }
    }

    /// Caller id for a presented token
    pub fn caller_for(&self, token: &str) -> Option<&str> {
        self.by_token.get(token).map(String::as_str)
    }

    /// Number of callers
    pub fn len(&self) -> usize {
        self.by_token.len()
    }
}

/// State shared by all handlers
#[derive(Clone)]
pub struct AppState {
    relay: Arc<RelayOrchestrator>,
    callers: Arc<CallerTable>,
}

impl AppState {
    /// Wrap an orchestrator and caller table
    pub fn new(relay: Arc<RelayOrchestrator>, callers: CallerTable) -> Self {
        Self {
            relay,
            callers: Arc::new(callers),
        }
    }

    /// Wire the production stack from configuration
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        config.validate().context("Invalid gateway configuration")?;

        let store = InMemoryQuotaStore::new();
        for caller in &config.callers {
            store.set_balance(caller.name.clone(), caller.quota);
        }
        let ledger = Arc::new(QuotaLedger::new(
            Arc::new(store),
            config.pricing.clone(),
        ));

        let pool = Arc::new(ClientPool::new(config.upstream.clone()));
        let relay = RelayOrchestrator::new(
            &config.relay,
            Arc::new(StaticChannelRegistry::new(config.channels.clone())),
            ModelAliases::new(config.aliases.clone()),
            Arc::new(HttpProviderFactory::new(pool)),
            ledger,
            Arc::new(ChannelHealthTracker::with_config(config.health.clone())),
        )
        .context("Failed to build relay orchestrator")?;

        Ok(Self::new(Arc::new(relay), CallerTable::new(&config.callers)))
    }

    /// Orchestrator
    pub fn relay(&self) -> &Arc<RelayOrchestrator> {
        &self.relay
    }

    /// Caller table
    pub fn callers(&self) -> &CallerTable {
        &self.callers
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("relay", &self.relay)
            .field("callers", &self.callers.len())
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Build the gateway router with its panic boundary
pub fn router(state: AppState) -> Router {
    let prefix = state.relay.forwarder().route_prefix().to_string();
    let metrics = Arc::clone(state.relay.metrics());

    let routes: Router<AppState> = if prefix.is_empty() {
        Router::new()
            .route("/", any(relay_handler))
            .route("/{*path}", any(relay_handler))
    } else {
        Router::new()
            .route(&prefix, any(relay_handler))
            .route(&format!("{prefix}/"), any(relay_handler))
            .route(&format!("{prefix}/{{*path}}"), any(relay_handler))
    };

    routes
        .fallback(not_found)
        .with_state(state)
        .layer(CatchPanicLayer::custom(
            move |panic: Box<dyn Any + Send + 'static>| panic_response(&metrics, panic),
        ))
}

async fn relay_handler(State(state): State<AppState>, request: Request) -> Response {
    let Some(caller) = bearer_token(&request)
        .and_then(|token| state.callers.caller_for(token))
        .map(str::to_string)
    else {
        debug!(path = %request.uri().path(), "Rejected request without a known caller token");
        return error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or unknown api key",
        );
    };

    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(caller = %caller, error = %e, "Failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "bad_request",
                &format!("failed to read request body: {e}"),
            );
        }
    };

    let inbound = InboundRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
    };

    match state.relay.relay(&caller, inbound).await {
        Ok(outcome) => {
            let upstream = outcome.response;
            let mut response = Response::new(Body::from_stream(upstream.body));
            *response.status_mut() = upstream.status;
            *response.headers_mut() = upstream.headers;
            response.headers_mut().remove(CONNECTION);
            response.headers_mut().remove(TRANSFER_ENCODING);
            response
        }
        Err(err) => relay_error_response(&err),
    }
}

async fn not_found(uri: Uri) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "not_found",
        &format!("no relay route for {}", uri.path()),
    )
}

fn bearer_token(request: &Request) -> Option<&str> {
    let value = request.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

// ============================================================================
// Error Responses
// ============================================================================

/// Structured error body: `{"error": {"message": .., "type": ..}}`
pub fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    let body = json!({
        "error": {
            "message": message,
            "type": kind,
        }
    });
    let mut response = (status, body.to_string()).into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn relay_error_response(err: &RelayError) -> Response {
    error_response(err.status(), err.kind(), &err.to_string())
}

fn panic_response(metrics: &RelayMetrics, panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic payload"
    };

    metrics.record_failure(None, FailureKind::Internal);
    error!(panic = %detail, "Caught panic in serving path");

    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        PANIC_ERROR_KIND,
        "internal error while relaying request",
    )
}

/// Log every panic with a full backtrace before the boundary converts it
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = Backtrace::force_capture();
        error!(panic = %info, backtrace = %backtrace, "Panic");
    }));
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::http::Method;
    use http_body_util::BodyExt;
    use relay_core::quota::{PriceTable, QuotaStore};
    use relay_core::routing::health::HealthConfig;
    use relay_core::routing::selector::ChannelRegistry;
    use relay_core::test_utils::{MockProviderFactory, MockReply, PanickingRegistry};
    use relay_core::{Channel, RelaySettings};
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        state: AppState,
        store: Arc<InMemoryQuotaStore>,
        factory: Arc<MockProviderFactory>,
    }

    fn app_with_registry(registry: Arc<dyn ChannelRegistry>) -> TestApp {
        let factory = Arc::new(MockProviderFactory::new());
        let store = Arc::new(InMemoryQuotaStore::new().with_balance("alice", 10));
        let ledger = Arc::new(QuotaLedger::new(store.clone(), PriceTable::default()));
        let relay = RelayOrchestrator::new(
            &RelaySettings::default(),
            registry,
            ModelAliases::default(),
            factory.clone(),
            ledger,
            Arc::new(ChannelHealthTracker::with_config(HealthConfig {
                cooldown: Duration::ZERO,
            })),
        )
        .unwrap();

        let callers = CallerTable::new(&[CallerConfig {
            token: "sk-alice".to_string(),
            name: "alice".to_string(),
            quota: 10,
        }]);
        let state = AppState::new(Arc::new(relay), callers);
        TestApp {
            router: router(state.clone()),
            state,
            store,
            factory,
        }
    }

    fn app() -> TestApp {
        app_with_registry(Arc::new(StaticChannelRegistry::new(vec![Channel::new(
            1,
            "https://up.example",
        )
        .with_model("m")])))
    }

    fn request(path: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("authorization", "Bearer sk-alice")
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_success_streams_upstream_response() {
        let app = app();
        app.factory
            .script(1)
            .always(MockReply::ok(r#"{"ok":true}"#).with_header("x-upstream", "1"));

        let response = app
            .router
            .oneshot(
                request("/generalProxy/v1/run?x=1")
                    .header("x-api-model", "m")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-upstream").unwrap(), "1");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], br#"{"ok":true}"#);

        let sent = app.factory.script(1).requests();
        assert_eq!(sent[0].url, "https://up.example/v1/run?x=1");
        assert!(sent[0].headers.get("authorization").is_none());
        assert_eq!(app.store.balance("alice"), Some(9));
    }

    #[tokio::test]
    async fn test_missing_model_header_is_structured_400() {
        let app = app();
        let response = app
            .router
            .oneshot(request("/generalProxy").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["type"], "bad_request");
        assert_eq!(app.state.relay().ledger().stats().reserved, 0);
    }

    #[tokio::test]
    async fn test_unknown_token_is_unauthorized() {
        let app = app();
        let response = app
            .router
            .oneshot(
                Request::builder()
                    .uri("/generalProxy")
                    .header("authorization", "Bearer nope")
                    .header("x-api-model", "m")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"]["type"], "unauthorized");
        assert_eq!(app.factory.total_requests(), 0);
    }

    #[tokio::test]
    async fn test_quota_exhausted_is_forbidden() {
        let app = app();
        app.store.set_balance("alice", 0);

        let response = app
            .router
            .oneshot(
                request("/generalProxy")
                    .header("x-api-model", "m")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["error"]["type"], "quota_exhausted");
    }

    #[tokio::test]
    async fn test_exhausted_upstream_is_bad_gateway() {
        let app = app();
        app.factory.script(1).always(MockReply::status(503));

        let response = app
            .router
            .oneshot(
                request("/generalProxy/x")
                    .header("x-api-model", "m")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(response).await["error"]["type"], "relay_exhausted");
        assert_eq!(app.store.balance("alice"), Some(10));
    }

    #[tokio::test]
    async fn test_panic_becomes_500_and_releases_quota() {
        let app = app_with_registry(Arc::new(PanickingRegistry));

        let response = app
            .router
            .clone()
            .oneshot(
                request("/generalProxy")
                    .header("x-api-model", "m")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"]["type"], PANIC_ERROR_KIND);

        let stats = app.state.relay().ledger().stats();
        assert_eq!(stats.reserved, 1);
        assert_eq!(stats.released_on_drop, 1);
        assert_eq!(app.store.balance("alice"), Some(10));
        assert_eq!(app.state.relay().metrics().snapshot().internal_errors, 1);

        // The router keeps serving after a caught panic
        let second = app
            .router
            .oneshot(request("/generalProxy").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_trailing_slash_is_relayed() {
        let app = app();
        app.factory.script(1).always(MockReply::ok("ok"));

        let response = app
            .router
            .oneshot(
                request("/generalProxy/")
                    .header("x-api-model", "m")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let sent = app.factory.script(1).requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].url, "https://up.example/");
    }

    #[tokio::test]
    async fn test_unrouted_path_is_structured_404() {
        let app = app();
        let response = app
            .router
            .oneshot(request("/elsewhere").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["error"]["type"], "not_found");
        assert_eq!(app.factory.total_requests(), 0);
    }

    #[test]
    fn test_bearer_token_parsing() {
        let req = |value: &str| {
            Request::builder()
                .header("authorization", value)
                .body(Body::empty())
                .unwrap()
        };

        assert_eq!(bearer_token(&req("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(&req("bearer  abc ")), Some("abc"));
        assert_eq!(bearer_token(&req("Basic abc")), None);
        assert_eq!(bearer_token(&req("Bearer ")), None);
    }

    #[test]
    fn test_app_state_from_config_rejects_relative_route_prefix() {
        let mut config = GatewayConfig::default();
        config.relay.route_prefix = "generalProxy".to_string();
        let err = AppState::from_config(&config).unwrap_err();
        assert!(format!("{err:#}").contains("route prefix"));
    }

    #[test]
    fn test_app_state_from_config_rejects_duplicate_channels() {
        let mut config = GatewayConfig::default();
        config.channels = vec![
            Channel::new(1, "https://a.example"),
            Channel::new(1, "https://b.example"),
        ];
        assert!(AppState::from_config(&config).is_err());

        config.channels.pop();
        config.callers = vec![CallerConfig {
            token: "t".to_string(),
            name: "bob".to_string(),
            quota: 3,
        }];
        let state = AppState::from_config(&config).unwrap();
        assert_eq!(state.relay().ledger().balance("bob"), Some(3));
        assert_eq!(state.callers().caller_for("t"), Some("bob"));
    }
}
