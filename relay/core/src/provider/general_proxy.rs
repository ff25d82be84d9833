//! General proxy provider
//!
//! Opaque passthrough to a channel's base URL. Credentials become headers;
//! task-solver models get their body rewritten (see [`super::task_rewrite`]).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http::header::AUTHORIZATION;

use super::{task_rewrite, OutboundRequest, Provider, UpstreamResponse};
use crate::channel::{Channel, Credential};
use crate::error::ForwardError;

/// Longest upstream error body kept in the error message
const ERROR_EXCERPT_LEN: usize = 512;

/// Provider for `general_proxy` channels
pub struct GeneralProxyProvider {
    channel: Arc<Channel>,
    client: reqwest::Client,
    response_header_timeout: Duration,
}

impl GeneralProxyProvider {
    /// Create a provider for `channel` using a pooled client
    pub fn new(channel: Arc<Channel>, client: reqwest::Client, response_header_timeout: Duration) -> Self {
        Self {
            channel,
            client,
            response_header_timeout,
        }
    }
}

#[async_trait]
impl Provider for GeneralProxyProvider {
    fn channel(&self) -> &Channel {
        &self.channel
    }

    fn request_headers(&self) -> BTreeMap<String, String> {
        match self.channel.credential() {
            Credential::None => BTreeMap::new(),
            Credential::Bearer(secret) => {
                BTreeMap::from([(AUTHORIZATION.as_str().to_string(), format!("Bearer {secret}"))])
            }
            Credential::Headers(headers) => headers,
        }
    }

    fn transform_body(
        &self,
        model: &str,
        body: Bytes,
        headers: &mut BTreeMap<String, String>,
    ) -> Result<Bytes, ForwardError> {
        if task_rewrite::applies_to(model) {
            task_rewrite::rewrite_task_body(model, &body, headers)
        } else {
            Ok(body)
        }
    }

    async fn send(&self, request: OutboundRequest) -> Result<UpstreamResponse, ForwardError> {
        let pending = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers)
            .body(request.body)
            .send();

        let response = tokio::time::timeout(self.response_header_timeout, pending)
            .await
            .map_err(|_| {
                ForwardError::Transport(format!(
                    "no response headers within {}ms",
                    self.response_header_timeout.as_millis()
                ))
            })??;

        let status = response.status();
        if !status.is_success() {
            let excerpt = tokio::time::timeout(self.response_header_timeout, error_excerpt(response))
                .await
                .unwrap_or_default();

            tracing::debug!(
                channel_id = self.channel.id,
                status = status.as_u16(),
                "Upstream returned error status"
            );
            return Err(ForwardError::Upstream {
                status,
                message: excerpt,
            });
        }

        Ok(UpstreamResponse {
            status,
            headers: response.headers().clone(),
            content_length: response.content_length(),
            body: response
                .bytes_stream()
                .map_err(std::io::Error::other)
                .boxed(),
        })
    }
}

/// Leading characters of an error body, reading no more than needed
async fn error_excerpt(response: reqwest::Response) -> String {
    // Up to 4 bytes per UTF-8 character
    let limit = ERROR_EXCERPT_LEN * 4;
    let mut buf = Vec::with_capacity(ERROR_EXCERPT_LEN);
    let mut stream = std::pin::pin!(response.bytes_stream());

    while buf.len() < limit {
        match stream.next().await {
            Some(Ok(chunk)) => {
                let take = chunk.len().min(limit - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Some(Err(_)) | None => break,
        }
    }

    String::from_utf8_lossy(&buf)
        .chars()
        .take(ERROR_EXCERPT_LEN)
        .collect()
}

impl std::fmt::Debug for GeneralProxyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneralProxyProvider")
            .field("channel_id", &self.channel.id)
            .field("base_url", &self.channel.base_url)
            .finish_non_exhaustive()
    }
}
