//! Upstream HTTP Client Pool
//!
//! One `reqwest::Client` per outbound proxy setting. Clients carry their own
//! keep-alive connection pools, so reusing them across requests and attempts
//! keeps upstream connections warm. Channels without a proxy share a single
//! direct client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use crate::error::ForwardError;

// ============================================================================
// Client Configuration
// ============================================================================

/// Timeouts and pool limits for upstream clients
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// TCP/TLS connect timeout
    pub connect_timeout: Duration,
    /// Time allowed until upstream response headers arrive
    pub response_header_timeout: Duration,
    /// Idle keep-alive connections kept per host
    pub max_idle_per_host: usize,
    /// How long an idle connection is kept
    pub pool_idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            response_header_timeout: Duration::from_secs(120),
            max_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

// ============================================================================
// Client Pool
// ============================================================================

/// Statistics for the client pool
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientPoolStats {
    /// Clients built
    pub clients_created: u64,
    /// Lookups served by an existing client
    pub reuses: u64,
    /// Client build failures (bad proxy URL)
    pub build_errors: u64,
}

/// Shared upstream clients keyed by outbound proxy
pub struct ClientPool {
    config: ClientConfig,
    clients: DashMap<Option<String>, reqwest::Client>,
    clients_created: AtomicU64,
    reuses: AtomicU64,
    build_errors: AtomicU64,
}

impl ClientPool {
    /// Create an empty pool
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            clients: DashMap::new(),
            clients_created: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            build_errors: AtomicU64::new(0),
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Client for a proxy setting, built on first use
    pub fn client(&self, proxy: Option<&str>) -> Result<reqwest::Client, ForwardError> {
        let key = proxy.map(str::trim).filter(|p| !p.is_empty()).map(str::to_string);

        if let Some(client) = self.clients.get(&key) {
            self.reuses.fetch_add(1, Ordering::Relaxed);
            return Ok(client.clone());
        }

        let client = self.build(key.as_deref()).inspect_err(|_| {
            self.build_errors.fetch_add(1, Ordering::Relaxed);
        })?;

        // A concurrent builder may have won; keep whichever landed first
        let client = self.clients.entry(key).or_insert(client).clone();
        Ok(client)
    }

    fn build(&self, proxy: Option<&str>) -> Result<reqwest::Client, ForwardError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .pool_max_idle_per_host(self.config.max_idle_per_host)
            .pool_idle_timeout(self.config.pool_idle_timeout);

        if let Some(url) = proxy {
            let proxy = reqwest::Proxy::all(url)
                .map_err(|e| ForwardError::Internal(format!("invalid proxy {url}: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| ForwardError::Internal(format!("failed to build http client: {e}")))?;

        self.clients_created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(proxy = proxy.unwrap_or("direct"), "Built upstream client");
        Ok(client)
    }

    /// Current pool statistics
    pub fn stats(&self) -> ClientPoolStats {
        ClientPoolStats {
            clients_created: self.clients_created.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            build_errors: self.build_errors.load(Ordering::Relaxed),
        }
    }

    /// Number of distinct clients held
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client has been built yet
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("config", &self.config)
            .field("clients", &self.clients.len())
            .finish()
    }
}
