//! Provider Selector
//!
//! Resolves a model name to a provider for one attempt:
//!
//! ```text
//! inbound model ──► aliases ──► registry.channels_for(model)
//!                                   │ filter: health.is_available
//!                                   │ prefer: not yet tried this request
//!                                   │ keep:   highest priority group
//!                                   ▼
//!                         weighted random pick ──► channel.model_mapping
//!                                   │
//!                                   ▼
//!                     (provider, resolved model name)
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::channel::{Channel, ChannelId};
use crate::error::SelectError;
use crate::provider::{Provider, ProviderFactory};
use crate::routing::health::ChannelHealthTracker;

// ============================================================================
// Channel Registry
// ============================================================================

/// Read-only channel lookup
///
/// Channel records are owned by external configuration storage.
pub trait ChannelRegistry: Send + Sync {
    /// Channels listing `model`
    fn channels_for(&self, model: &str) -> Vec<Arc<Channel>>;

    /// All channels
    fn all(&self) -> Vec<Arc<Channel>>;
}

/// Registry over a fixed channel list
#[derive(Debug, Default)]
pub struct StaticChannelRegistry {
    channels: Vec<Arc<Channel>>,
    by_model: HashMap<String, Vec<Arc<Channel>>>,
}

impl StaticChannelRegistry {
    /// Index `channels` by model
    pub fn new(channels: impl IntoIterator<Item = Channel>) -> Self {
        let channels: Vec<Arc<Channel>> = channels.into_iter().map(Arc::new).collect();
        let mut by_model: HashMap<String, Vec<Arc<Channel>>> = HashMap::new();
        for channel in &channels {
            for model in &channel.models {
                by_model
                    .entry(model.clone())
                    .or_default()
                    .push(Arc::clone(channel));
            }
        }
        Self { channels, by_model }
    }

    /// Number of channels
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl ChannelRegistry for StaticChannelRegistry {
    fn channels_for(&self, model: &str) -> Vec<Arc<Channel>> {
        self.by_model.get(model).cloned().unwrap_or_default()
    }

    fn all(&self) -> Vec<Arc<Channel>> {
        self.channels.clone()
    }
}

// ============================================================================
// Model Aliases
// ============================================================================

/// Global alias table mapping inbound names to dispatch names
#[derive(Clone, Debug, Default)]
pub struct ModelAliases {
    aliases: HashMap<String, String>,
}

impl ModelAliases {
    /// Create from an alias map
    pub fn new(aliases: HashMap<String, String>) -> Self {
        Self { aliases }
    }

    /// Canonical dispatch name for `model`
    ///
    /// Chains are followed. A chain that loops back on itself is treated as
    /// no alias at all.
    pub fn canonicalize(&self, model: &str) -> String {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut current = model;
        seen.insert(current);

        while let Some(next) = self.aliases.get(current) {
            if !seen.insert(next.as_str()) {
                tracing::warn!(model, alias = %next, "Alias cycle detected, ignoring aliases");
                return model.to_string();
            }
            current = next.as_str();
        }
        current.to_string()
    }

    /// Number of aliases
    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    /// Whether no aliases are configured
    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

// ============================================================================
// Selector
// ============================================================================

/// Per-request selection state
#[derive(Clone, Debug, Default)]
pub struct SelectionContext {
    tried: HashSet<ChannelId>,
}

impl SelectionContext {
    /// Fresh context for a new request
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a channel as attempted
    pub fn mark_tried(&mut self, channel_id: ChannelId) {
        self.tried.insert(channel_id);
    }

    /// Whether a channel was attempted
    pub fn has_tried(&self, channel_id: ChannelId) -> bool {
        self.tried.contains(&channel_id)
    }

    /// Channels attempted so far
    pub fn tried_count(&self) -> usize {
        self.tried.len()
    }
}

/// A resolved provider for one attempt
pub struct Resolved {
    /// Adapter for the picked channel
    pub provider: Arc<dyn Provider>,
    /// Name used for dispatch and quota accounting
    pub resolved_model: String,
}

impl Resolved {
    /// Picked channel
    pub fn channel(&self) -> &Channel {
        self.provider.channel()
    }
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolved")
            .field("channel_id", &self.provider.channel().id)
            .field("resolved_model", &self.resolved_model)
            .finish()
    }
}

/// Provider selector
pub struct ProviderSelector {
    registry: Arc<dyn ChannelRegistry>,
    health: Arc<ChannelHealthTracker>,
    aliases: ModelAliases,
    factory: Arc<dyn ProviderFactory>,
}

impl ProviderSelector {
    /// Create a selector
    pub fn new(
        registry: Arc<dyn ChannelRegistry>,
        health: Arc<ChannelHealthTracker>,
        aliases: ModelAliases,
        factory: Arc<dyn ProviderFactory>,
    ) -> Self {
        Self {
            registry,
            health,
            aliases,
            factory,
        }
    }

    /// Channel registry
    pub fn registry(&self) -> &Arc<dyn ChannelRegistry> {
        &self.registry
    }

    /// Resolve `model` to a provider, avoiding channels in `ctx` where feasible
    pub fn resolve(&self, model: &str, ctx: &SelectionContext) -> Result<Resolved, SelectError> {
        let canonical = self.aliases.canonicalize(model);
        let channel = self.pick(&canonical, ctx)?;
        let resolved_model = channel.map_model(&canonical);

        tracing::debug!(
            model,
            resolved_model = %resolved_model,
            channel_id = channel.id,
            channel = %channel.name,
            "Resolved provider"
        );

        let provider = self.factory.build(channel)?;
        Ok(Resolved {
            provider,
            resolved_model,
        })
    }

    fn pick(&self, model: &str, ctx: &SelectionContext) -> Result<Arc<Channel>, SelectError> {
        let available: Vec<Arc<Channel>> = self
            .registry
            .channels_for(model)
            .into_iter()
            .filter(|c| self.health.is_available(c.id))
            .collect();

        let untried: Vec<&Arc<Channel>> =
            available.iter().filter(|c| !ctx.has_tried(c.id)).collect();
        let pool: Vec<&Arc<Channel>> = if untried.is_empty() {
            available.iter().collect()
        } else {
            untried
        };

        let top = pool
            .iter()
            .map(|c| c.priority)
            .max()
            .ok_or_else(|| SelectError::NoAvailableChannel {
                model: model.to_string(),
            })?;
        let group: Vec<&Arc<Channel>> = pool.into_iter().filter(|c| c.priority == top).collect();

        group
            .choose_weighted(&mut rand::thread_rng(), |c| c.effective_weight())
            .map(|c| Arc::clone(*c))
            .map_err(|_| SelectError::NoAvailableChannel {
                model: model.to_string(),
            })
    }
}

impl std::fmt::Debug for ProviderSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSelector")
            .field("aliases", &self.aliases.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
