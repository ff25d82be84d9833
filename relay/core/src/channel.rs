//! Upstream Channels
//!
//! A channel is one configured upstream backend: an endpoint, a credential
//! and the set of models it can serve. Channel identity is owned by
//! configuration storage; the relay core only reads it. Health side-state
//! (cooldowns, disabling) lives in [`crate::routing::health`].

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Numeric channel identifier
pub type ChannelId = i64;

// ============================================================================
// Channel Kind
// ============================================================================

/// Upstream kind, selects the provider adapter built for a channel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Opaque byte-stream proxy (path, headers and body passed through)
    #[default]
    GeneralProxy,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GeneralProxy => write!(f, "general_proxy"),
        }
    }
}

// ============================================================================
// Channel
// ============================================================================

/// A configured upstream backend
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Channel {
    /// Unique channel id
    pub id: ChannelId,

    /// Display name (logging only)
    #[serde(default)]
    pub name: String,

    /// Provider kind
    #[serde(default)]
    pub kind: ChannelKind,

    /// Base URL requests are forwarded to
    pub base_url: String,

    /// Credential material. Either a JSON object of headers or a bearer secret.
    #[serde(default)]
    pub key: String,

    /// Outbound proxy address (`http://`, `https://` or `socks5://`)
    #[serde(default)]
    pub proxy: Option<String>,

    /// Models this channel serves
    #[serde(default)]
    pub models: Vec<String>,

    /// Relative selection weight within a priority group (0 counts as 1)
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Higher priority groups are tried first
    #[serde(default)]
    pub priority: i64,

    /// Per-channel rename of the dispatch model name
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,

    /// Channels configured as disabled start out disabled in the health tracker
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl Channel {
    /// Create a general proxy channel with defaults
    pub fn new(id: ChannelId, base_url: impl Into<String>) -> Self {
        Self {
            id,
            name: format!("channel-{id}"),
            kind: ChannelKind::GeneralProxy,
            base_url: base_url.into(),
            key: String::new(),
            proxy: None,
            models: Vec::new(),
            weight: default_weight(),
            priority: 0,
            model_mapping: HashMap::new(),
            enabled: true,
        }
    }

    /// Set display name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set credential
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Add a served model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.models.push(model.into());
        self
    }

    /// Set priority
    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set weight
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set outbound proxy
    #[must_use]
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Map a dispatch model name to the name this channel expects
    #[must_use]
    pub fn with_model_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.model_mapping.insert(from.into(), to.into());
        self
    }

    /// Whether this channel lists `model`
    #[must_use]
    pub fn serves(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// Effective selection weight, widened so group sums cannot overflow
    #[must_use]
    pub fn effective_weight(&self) -> u64 {
        u64::from(self.weight.max(1))
    }

    /// Apply this channel's model mapping
    #[must_use]
    pub fn map_model(&self, model: &str) -> String {
        self.model_mapping
            .get(model)
            .filter(|m| !m.is_empty())
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    /// Base URL without trailing slashes
    #[must_use]
    pub fn trimmed_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// Interpret the credential
    #[must_use]
    pub fn credential(&self) -> Credential {
        Credential::parse(&self.key)
    }
}

// ============================================================================
// Credential
// ============================================================================

/// Parsed channel credential
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credential {
    /// No credential configured
    None,
    /// Opaque secret sent as `Authorization: Bearer <secret>`
    Bearer(String),
    /// Pre-parsed header map overlaid on the outbound request
    Headers(BTreeMap<String, String>),
}

impl Credential {
    /// Parse a stored key. A JSON object of strings is a header map,
    /// anything else non-empty is a bearer secret.
    #[must_use]
    pub fn parse(key: &str) -> Self {
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Self::None;
        }
        if trimmed.starts_with('{') {
            if let Ok(headers) = serde_json::from_str::<BTreeMap<String, String>>(trimmed) {
                return Self::Headers(headers);
            }
            tracing::warn!("Channel key looks like JSON but is not a string map, using as bearer");
        }
        Self::Bearer(trimmed.to_string())
    }
}
