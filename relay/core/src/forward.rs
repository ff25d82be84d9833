//! Proxy Forwarder
//!
//! Turns an inbound request into an upstream call through a [`Provider`]:
//!
//! ```text
//! inbound  POST /generalProxy/v1/tasks?x=1   X-API-Model, Authorization, Auth-proxy
//!              │ strip route prefix          │ drop control + hop-by-hop headers
//!              ▼                             ▼ Auth-proxy -> Authorization
//! outbound POST {base_url}/v1/tasks?x=1      + provider headers (overlay last)
//! ```
//!
//! The forwarder reports facts only. Whether a failure disables a channel or
//! ends the retry loop is decided by the orchestrator.

use std::collections::BTreeMap;

use bytes::Bytes;
use http::header::{
    HeaderName, HeaderValue, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING,
};
use http::{HeaderMap, Method};

use crate::error::ForwardError;
use crate::provider::{OutboundRequest, Provider, UpstreamResponse};
use crate::quota::Usage;

/// Inbound header whose value replaces the outbound `Authorization`
pub const AUTH_PROXY_HEADER: &str = "auth-proxy";

/// Default gateway routing prefix
pub const DEFAULT_ROUTE_PREFIX: &str = "/generalProxy";

/// Default model-selector header
pub const DEFAULT_MODEL_HEADER: &str = "x-api-model";

/// Default bytes per usage unit
pub const DEFAULT_BYTES_PER_UNIT: u64 = 1024;

// ============================================================================
// Inbound Request
// ============================================================================

/// Inbound request as seen by the relay
///
/// The body is buffered so it can be replayed on every attempt.
#[derive(Clone, Debug)]
pub struct InboundRequest {
    pub method: Method,
    /// Path including the routing prefix
    pub path: String,
    /// Raw query string without `?`
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InboundRequest {
    /// Create an empty-bodied request
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Set the query string
    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Add a header; invalid names or values are ignored
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// Set the body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

// ============================================================================
// Forwarder
// ============================================================================

/// Successful forward
#[derive(Debug)]
pub struct Forwarded {
    /// Upstream response, body still streaming
    pub response: UpstreamResponse,
    /// Size-based usage estimate
    pub usage: Usage,
}

/// Proxy forwarder
#[derive(Clone, Debug)]
pub struct ProxyForwarder {
    route_prefix: String,
    model_header: HeaderName,
    bytes_per_unit: u64,
}

impl ProxyForwarder {
    /// Create a forwarder
    pub fn new(route_prefix: impl Into<String>, model_header: HeaderName, bytes_per_unit: u64) -> Self {
        let route_prefix = route_prefix.into().trim_end_matches('/').to_string();
        Self {
            route_prefix,
            model_header,
            bytes_per_unit: bytes_per_unit.max(1),
        }
    }

    /// Model-selector header name
    pub fn model_header(&self) -> &HeaderName {
        &self.model_header
    }

    /// Routing prefix stripped from inbound paths
    pub fn route_prefix(&self) -> &str {
        &self.route_prefix
    }

    /// Strip the routing prefix on a segment boundary, re-rooted at `/`
    pub fn upstream_path(&self, path: &str) -> String {
        let rest = if self.route_prefix.is_empty() {
            path
        } else {
            match path.strip_prefix(self.route_prefix.as_str()) {
                Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
                _ => path,
            }
        };

        if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{rest}")
        }
    }

    /// Outbound header set: inbound minus control headers, then overlays
    pub fn outbound_headers(&self, inbound: &HeaderMap, overlay: &BTreeMap<String, String>) -> HeaderMap {
        let mut headers = inbound.clone();
        for name in [
            &self.model_header,
            &AUTHORIZATION,
            &HOST,
            &CONTENT_LENGTH,
            &CONNECTION,
            &TRANSFER_ENCODING,
        ] {
            headers.remove(name);
        }

        if let Some(auth) = headers.remove(AUTH_PROXY_HEADER) {
            headers.insert(AUTHORIZATION, auth);
        }

        for (name, value) in overlay {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!(header = %name, "Skipping invalid provider header"),
            }
        }
        headers
    }

    /// Forward `inbound` through `provider` for the resolved `model`
    pub async fn forward(
        &self,
        inbound: &InboundRequest,
        provider: &dyn Provider,
        model: &str,
    ) -> Result<Forwarded, ForwardError> {
        let path = self.upstream_path(&inbound.path);
        let url = provider.full_request_url(&path, inbound.query.as_deref())?;

        let mut overlay = provider.request_headers();
        let body = provider.transform_body(model, inbound.body.clone(), &mut overlay)?;
        let headers = self.outbound_headers(&inbound.headers, &overlay);

        let request_bytes = body.len() as u64;
        tracing::debug!(
            channel_id = provider.channel().id,
            method = %inbound.method,
            url = %url,
            request_bytes,
            "Forwarding request"
        );

        let response = provider
            .send(OutboundRequest {
                method: inbound.method.clone(),
                url,
                headers,
                body,
            })
            .await?;

        let usage = Usage::from_byte_counts(
            request_bytes,
            response.content_length.unwrap_or(0),
            self.bytes_per_unit,
        );
        Ok(Forwarded { response, usage })
    }
}

impl Default for ProxyForwarder {
    fn default() -> Self {
        Self::new(
            DEFAULT_ROUTE_PREFIX,
            HeaderName::from_static(DEFAULT_MODEL_HEADER),
            DEFAULT_BYTES_PER_UNIT,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::test_utils::MockProvider;
    use http::StatusCode;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_upstream_path_strips_prefix_on_segment() {
        let fwd = ProxyForwarder::default();

        assert_eq!(fwd.upstream_path("/generalProxy/v1/tasks"), "/v1/tasks");
        assert_eq!(fwd.upstream_path("/generalProxy"), "/");
        assert_eq!(fwd.upstream_path("/generalProxy/"), "/");
        assert_eq!(fwd.upstream_path("/generalProxyX/a"), "/generalProxyX/a");
        assert_eq!(fwd.upstream_path("other"), "/other");
    }

    #[test]
    fn test_outbound_headers() {
        let fwd = ProxyForwarder::default();
        let inbound = InboundRequest::new(Method::POST, "/generalProxy")
            .with_header("X-API-Model", "m")
            .with_header("Authorization", "Bearer caller-token")
            .with_header("Host", "gateway.local")
            .with_header("Content-Length", "12")
            .with_header("Auth-proxy", "Basic dXA=")
            .with_header("Accept", "application/json")
            .with_header("X-Override", "inbound");

        let overlay = BTreeMap::from([
            ("X-Override".to_string(), "provider".to_string()),
            ("bad header".to_string(), "x".to_string()),
        ]);
        let headers = fwd.outbound_headers(&inbound.headers, &overlay);

        assert!(headers.get("x-api-model").is_none());
        assert!(headers.get("host").is_none());
        assert!(headers.get("content-length").is_none());
        assert!(headers.get("auth-proxy").is_none());
        assert_eq!(headers.get("authorization").unwrap(), "Basic dXA=");
        assert_eq!(headers.get("accept").unwrap(), "application/json");
        assert_eq!(headers.get("x-override").unwrap(), "provider");
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn test_caller_authorization_never_forwarded() {
        let fwd = ProxyForwarder::default();
        let inbound = InboundRequest::new(Method::GET, "/generalProxy")
            .with_header("Authorization", "Bearer caller-token");

        let headers = fwd.outbound_headers(&inbound.headers, &BTreeMap::new());
        assert!(headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_forward_builds_request_and_usage() {
        let fwd = ProxyForwarder::default();
        let provider = MockProvider::new(Channel::new(9, "https://up.example/base/").with_key("sk-1"))
            .respond(StatusCode::OK, vec![b'x'; 3000]);

        let inbound = InboundRequest::new(Method::PUT, "/generalProxy/v1/jobs")
            .with_query("page=2")
            .with_header("X-API-Model", "m")
            .with_body(vec![b'a'; 2048]);

        let forwarded = fwd.forward(&inbound, &provider, "m").await.unwrap();
        assert_eq!(forwarded.usage, Usage::new(2, 2));

        let sent = provider.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, Method::PUT);
        assert_eq!(sent[0].url, "https://up.example/base/v1/jobs?page=2");
        assert_eq!(sent[0].headers.get("authorization").unwrap(), "Bearer sk-1");
        assert_eq!(sent[0].body.len(), 2048);
    }

    #[tokio::test]
    async fn test_forward_unknown_length_counts_zero() {
        let fwd = ProxyForwarder::default();
        let provider = MockProvider::new(Channel::new(1, "https://up.example"))
            .respond(StatusCode::OK, "body")
            .without_content_length();

        let inbound = InboundRequest::new(Method::POST, "/generalProxy").with_body(vec![0; 4096]);
        let forwarded = fwd.forward(&inbound, &provider, "m").await.unwrap();
        assert_eq!(forwarded.usage, Usage::new(4, 0));
    }

    #[tokio::test]
    async fn test_forward_rewrite_failure_sends_nothing() {
        let fwd = ProxyForwarder::default();
        let provider = MockProvider::new(Channel::new(1, "https://up.example"))
            .with_task_rewrite()
            .respond(StatusCode::OK, "never");

        let inbound = InboundRequest::new(Method::POST, "/generalProxy").with_body("not json");
        let err = fwd
            .forward(&inbound, &provider, "CapchaTurnstileTask")
            .await
            .unwrap_err();

        assert!(matches!(err, ForwardError::BadRequest(_)));
        assert!(provider.requests().is_empty());
    }
}
