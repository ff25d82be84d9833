//! Upstream Providers
//!
//! A provider adapts one channel kind to the forwarder: it knows how the
//! channel's credential becomes headers, how its URL is built, whether the
//! body needs reshaping, and how to send the request. The orchestrator and
//! forwarder only ever see `dyn Provider`.
//!
//! # Adapters
//!
//! | Kind            | Adapter                                   |
//! |-----------------|-------------------------------------------|
//! | `general_proxy` | [`general_proxy::GeneralProxyProvider`]   |

pub mod client_pool;
pub mod general_proxy;
pub mod task_rewrite;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use http::{HeaderMap, Method, StatusCode};

use crate::channel::{Channel, ChannelKind};
use crate::error::{ForwardError, SelectError};

pub use client_pool::{ClientConfig, ClientPool, ClientPoolStats};
pub use general_proxy::GeneralProxyProvider;

// ============================================================================
// Request / Response
// ============================================================================

/// Fully prepared upstream request
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    /// Method copied from the inbound request
    pub method: Method,
    /// Absolute upstream URL
    pub url: String,
    /// Final header set
    pub headers: HeaderMap,
    /// Body, possibly rewritten
    pub body: Bytes,
}

/// Streaming body of an upstream response
pub type BodyStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// Successful upstream response
///
/// The body is streamed; dropping the response closes the upstream
/// connection on every path (success, error, cancellation).
pub struct UpstreamResponse {
    /// Upstream status, copied verbatim to the caller
    pub status: StatusCode,
    /// Upstream headers, copied verbatim to the caller
    pub headers: HeaderMap,
    /// Declared body length, if known
    pub content_length: Option<u64>,
    /// Body chunks
    pub body: BodyStream,
}

impl UpstreamResponse {
    /// Response with an in-memory body
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            status,
            headers,
            content_length: Some(body.len() as u64),
            body: stream::once(async move { Ok(body) }).boxed(),
        }
    }

    /// Read the whole body into memory
    pub async fn collect_body(self) -> Result<Bytes, std::io::Error> {
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        Ok(Bytes::from(chunks.concat()))
    }
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Provider Trait
// ============================================================================

/// Adapter for one upstream kind
#[async_trait]
pub trait Provider: Send + Sync {
    /// Channel this provider was built for
    fn channel(&self) -> &Channel;

    /// Headers overlaid last on the outbound request
    fn request_headers(&self) -> BTreeMap<String, String>;

    /// Upstream URL for an already prefix-stripped path
    ///
    /// # Errors
    ///
    /// [`ForwardError::Internal`] when the channel has no base URL.
    fn full_request_url(&self, path: &str, query: Option<&str>) -> Result<String, ForwardError> {
        let base = self.channel().trimmed_base_url();
        if base.is_empty() {
            return Err(ForwardError::Internal(format!(
                "channel {} has no base url",
                self.channel().id
            )));
        }

        let mut url = String::with_capacity(base.len() + path.len() + 1);
        url.push_str(base);
        if !path.starts_with('/') {
            url.push('/');
        }
        url.push_str(path);
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        Ok(url)
    }

    /// Reshape the body for `model`; may consume entries of `headers`
    fn transform_body(
        &self,
        _model: &str,
        body: Bytes,
        _headers: &mut BTreeMap<String, String>,
    ) -> Result<Bytes, ForwardError> {
        Ok(body)
    }

    /// Send the request; any non-success status is an error
    async fn send(&self, request: OutboundRequest) -> Result<UpstreamResponse, ForwardError>;
}

// ============================================================================
// Provider Factory
// ============================================================================

/// Builds a provider for a selected channel
pub trait ProviderFactory: Send + Sync {
    /// Build the adapter for `channel`
    fn build(&self, channel: Arc<Channel>) -> Result<Arc<dyn Provider>, SelectError>;
}

/// Factory producing HTTP providers backed by a shared client pool
#[derive(Debug, Clone)]
pub struct HttpProviderFactory {
    pool: Arc<ClientPool>,
}

impl HttpProviderFactory {
    /// Create a factory over a client pool
    pub fn new(pool: Arc<ClientPool>) -> Self {
        Self { pool }
    }

    /// Shared client pool
    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn build(&self, channel: Arc<Channel>) -> Result<Arc<dyn Provider>, SelectError> {
        match channel.kind {
            ChannelKind::GeneralProxy => {
                let client = self
                    .pool
                    .client(channel.proxy.as_deref())
                    .map_err(|e| SelectError::Provider {
                        channel_id: channel.id,
                        message: e.to_string(),
                    })?;
                let timeout = self.pool.config().response_header_timeout;
                Ok(Arc::new(GeneralProxyProvider::new(channel, client, timeout)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Channel);

    #[async_trait]
    impl Provider for Fixed {
        fn channel(&self) -> &Channel {
            &self.0
        }

        fn request_headers(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }

        async fn send(&self, _request: OutboundRequest) -> Result<UpstreamResponse, ForwardError> {
            Ok(UpstreamResponse::from_bytes(StatusCode::OK, HeaderMap::new(), "ok"))
        }
    }

    #[test]
    fn test_full_request_url() {
        let provider = Fixed(Channel::new(1, "https://up.example/api/"));

        assert_eq!(
            provider.full_request_url("/v1/tasks", Some("a=1&b=2")).unwrap(),
            "https://up.example/api/v1/tasks?a=1&b=2"
        );
        assert_eq!(
            provider.full_request_url("/", None).unwrap(),
            "https://up.example/api/"
        );
        assert_eq!(
            provider.full_request_url("x", Some("")).unwrap(),
            "https://up.example/api/x"
        );
    }

    #[test]
    fn test_empty_base_url_is_internal() {
        let provider = Fixed(Channel::new(2, ""));
        assert!(matches!(
            provider.full_request_url("/x", None),
            Err(ForwardError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_collect_body() {
        let response = UpstreamResponse::from_bytes(StatusCode::OK, HeaderMap::new(), "abc");
        assert_eq!(response.content_length, Some(3));
        assert_eq!(response.collect_body().await.unwrap(), Bytes::from("abc"));
    }

    #[test]
    fn test_factory_builds_general_proxy() {
        let factory = HttpProviderFactory::new(Arc::new(ClientPool::default()));
        let channel = Arc::new(Channel::new(3, "https://up.example"));

        let provider = factory.build(channel).unwrap();
        assert_eq!(provider.channel().id, 3);

        let bad = Arc::new(Channel::new(4, "https://up.example").with_proxy("not a url"));
        assert!(matches!(
            factory.build(bad),
            Err(SelectError::Provider { channel_id: 4, .. })
        ));
    }
}
