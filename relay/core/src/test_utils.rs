//! Relay Test Utilities
//!
//! Scripted providers for exercising the forwarder and orchestrator without a
//! network. A [`MockProviderFactory`] hands out providers whose replies are
//! scripted per channel, and records every outbound request so tests can
//! assert on what was sent and how often.
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::test_utils::{MockProviderFactory, MockReply};
//!
//! let factory = MockProviderFactory::new();
//! factory.script(1).always(MockReply::status(500));
//! factory.script(2).always(MockReply::ok("{\"ok\":true}"));
//!
//! // ... run the orchestrator ...
//! assert_eq!(factory.script(1).request_count(), 1);
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, HeaderValue, StatusCode};
use parking_lot::Mutex;

use crate::channel::{Channel, ChannelId};
use crate::error::{ForwardError, SelectError};
use crate::provider::{task_rewrite, OutboundRequest, Provider, ProviderFactory, UpstreamResponse};
use crate::routing::selector::ChannelRegistry;

// ============================================================================
// Scripted Replies
// ============================================================================

/// One scripted upstream reply
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Successful response
    Response {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        /// Report the body length as the content length
        known_length: bool,
    },
    /// Failure returned by the provider
    Fail(ForwardError),
    /// Never answers; the request stays in flight until dropped
    Hang,
}

impl MockReply {
    /// 200 with `body`
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::Response {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: body.into(),
            known_length: true,
        }
    }

    /// Upstream error with `status`
    pub fn status(status: u16) -> Self {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::Fail(ForwardError::Upstream {
            status,
            message: format!("mock upstream {status}"),
        })
    }

    /// Transport failure
    pub fn transport(message: &str) -> Self {
        Self::Fail(ForwardError::Transport(message.to_string()))
    }

    /// Add a response header (successful replies only)
    #[must_use]
    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        if let Self::Response { headers, .. } = &mut self {
            headers.insert(name, HeaderValue::from_static(value));
        }
        self
    }

    fn into_result(self) -> Result<UpstreamResponse, ForwardError> {
        match self {
            Self::Response {
                status,
                headers,
                body,
                known_length,
            } => {
                let mut response = UpstreamResponse::from_bytes(status, headers, body);
                if !known_length {
                    response.content_length = None;
                }
                Ok(response)
            }
            Self::Fail(err) => Err(err),
            Self::Hang => Err(ForwardError::Transport("hung reply".to_string())),
        }
    }
}

/// Reply script and request log for one channel
#[derive(Debug, Default)]
pub struct MockScript {
    queue: Mutex<VecDeque<MockReply>>,
    fallback: Mutex<Option<MockReply>>,
    requests: Mutex<Vec<OutboundRequest>>,
}

impl MockScript {
    /// Queue a reply used once, in order
    pub fn then(&self, reply: MockReply) -> &Self {
        self.queue.lock().push_back(reply);
        self
    }

    /// Reply used whenever the queue is empty
    pub fn always(&self, reply: MockReply) -> &Self {
        *self.fallback.lock() = Some(reply);
        self
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests received
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn next(&self, request: OutboundRequest) -> MockReply {
        self.requests.lock().push(request);
        self.queue
            .lock()
            .pop_front()
            .or_else(|| self.fallback.lock().clone())
            .unwrap_or_else(|| MockReply::transport("no scripted reply"))
    }
}

// ============================================================================
// Mock Provider
// ============================================================================

/// Provider answering from a [`MockScript`]
pub struct MockProvider {
    channel: Arc<Channel>,
    script: Arc<MockScript>,
    task_rewrite: bool,
}

impl MockProvider {
    /// Provider with its own empty script
    pub fn new(channel: Channel) -> Self {
        Self {
            channel: Arc::new(channel),
            script: Arc::new(MockScript::default()),
            task_rewrite: false,
        }
    }

    /// Always answer `status` with `body`
    #[must_use]
    pub fn respond(self, status: StatusCode, body: impl Into<Bytes>) -> Self {
        let reply = if status.is_success() {
            MockReply::Response {
                status,
                headers: HeaderMap::new(),
                body: body.into(),
                known_length: true,
            }
        } else {
            MockReply::status(status.as_u16())
        };
        self.script.always(reply);
        self
    }

    /// Report unknown content length on scripted responses
    #[must_use]
    pub fn without_content_length(self) -> Self {
        let mut fallback = self.script.fallback.lock();
        if let Some(MockReply::Response { known_length, .. }) = fallback.as_mut() {
            *known_length = false;
        }
        drop(fallback);
        self
    }

    /// Apply the task-solver body rewrite like the general proxy does
    #[must_use]
    pub fn with_task_rewrite(mut self) -> Self {
        self.task_rewrite = true;
        self
    }

    /// Requests sent through this provider
    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.script.requests()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn channel(&self) -> &Channel {
        &self.channel
    }

    fn request_headers(&self) -> BTreeMap<String, String> {
        match self.channel.credential() {
            crate::channel::Credential::None => BTreeMap::new(),
            crate::channel::Credential::Bearer(secret) => {
                BTreeMap::from([("authorization".to_string(), format!("Bearer {secret}"))])
            }
            crate::channel::Credential::Headers(headers) => headers,
        }
    }

    fn transform_body(
        &self,
        model: &str,
        body: Bytes,
        headers: &mut BTreeMap<String, String>,
    ) -> Result<Bytes, ForwardError> {
        if self.task_rewrite && task_rewrite::applies_to(model) {
            task_rewrite::rewrite_task_body(model, &body, headers)
        } else {
            Ok(body)
        }
    }

    async fn send(&self, request: OutboundRequest) -> Result<UpstreamResponse, ForwardError> {
        match self.script.next(request) {
            MockReply::Hang => futures::future::pending::<Result<UpstreamResponse, ForwardError>>().await,
            reply => reply.into_result(),
        }
    }
}

// ============================================================================
// Mock Factory
// ============================================================================

/// Factory building [`MockProvider`]s that share one script per channel
#[derive(Debug, Default)]
pub struct MockProviderFactory {
    scripts: DashMap<ChannelId, Arc<MockScript>>,
    builds: Mutex<Vec<ChannelId>>,
}

impl MockProviderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script for a channel, created on first use
    pub fn script(&self, channel_id: ChannelId) -> Arc<MockScript> {
        Arc::clone(self.scripts.entry(channel_id).or_default().value())
    }

    /// Channel ids in the order providers were built
    pub fn builds(&self) -> Vec<ChannelId> {
        self.builds.lock().clone()
    }

    /// Total requests across all channels
    pub fn total_requests(&self) -> usize {
        self.scripts.iter().map(|s| s.request_count()).sum()
    }
}

impl ProviderFactory for MockProviderFactory {
    fn build(&self, channel: Arc<Channel>) -> Result<Arc<dyn Provider>, SelectError> {
        self.builds.lock().push(channel.id);
        let script = self.script(channel.id);
        Ok(Arc::new(MockProvider {
            channel,
            script,
            task_rewrite: true,
        }))
    }
}

// ============================================================================
// Faulty Registry
// ============================================================================

/// Registry that panics on lookup, for fault-boundary tests
#[derive(Debug, Default)]
pub struct PanickingRegistry;

impl ChannelRegistry for PanickingRegistry {
    fn channels_for(&self, model: &str) -> Vec<Arc<Channel>> {
        panic!("channel lookup failed for {model}");
    }

    fn all(&self) -> Vec<Arc<Channel>> {
        Vec::new()
    }
}
