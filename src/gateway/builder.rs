//! Builder for configuring gateway instances

use std::sync::Arc;

use super::Gateway;
use crate::cache::{CacheConfig, CacheLayer, MemoryBackend};
use crate::dispatch::breaker::{BreakerConfig, CircuitBreaker, GuardedClient};
use crate::dispatch::stream::DEFAULT_STREAM_BUFFER;
use crate::traits::{AllowAll, CacheBackend, CompletionClient, Moderator};
use crate::{HeimdallError, Result};

/// Main entry point for creating gateway instances.
pub struct Heimdall;

impl Heimdall {
    /// Create a new builder for configuring the gateway.
    pub fn builder() -> HeimdallBuilder {
        HeimdallBuilder::new()
    }
}

/// Builder for configuring gateway instances.
pub struct HeimdallBuilder {
    client: Option<Arc<dyn CompletionClient>>,
    moderator: Option<Arc<dyn Moderator>>,
    breaker_config: BreakerConfig,
    cache_backend: Option<Arc<dyn CacheBackend>>,
    memory_cache: Option<CacheConfig>,
    stream_buffer_size: usize,
}

impl HeimdallBuilder {
    pub fn new() -> Self {
        Self {
            client: None,
            moderator: None,
            breaker_config: BreakerConfig::default(),
            cache_backend: None,
            memory_cache: None,
            stream_buffer_size: DEFAULT_STREAM_BUFFER,
        }
    }

    /// Set the single-request completion client (required).
    pub fn client(mut self, client: Arc<dyn CompletionClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the content moderator.
    ///
    /// Without one, all prompts and fragments are allowed through.
    pub fn moderator(mut self, moderator: Arc<dyn Moderator>) -> Self {
        self.moderator = Some(moderator);
        self
    }

    /// Override the circuit-breaker configuration.
    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Enable caching with a custom backend (e.g. redis-backed).
    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    /// Enable caching with the bundled in-memory backend.
    ///
    /// Without this (or [`cache_backend`](Self::cache_backend)), no cache
    /// is allocated and `complete_cached` degrades to a plain dispatch.
    pub fn memory_cache(mut self, config: CacheConfig) -> Self {
        self.memory_cache = Some(config);
        self
    }

    /// Set the chunk buffer size between the stream pump and the consumer.
    pub fn stream_buffer_size(mut self, size: usize) -> Self {
        self.stream_buffer_size = size;
        self
    }

    /// Build the gateway.
    ///
    /// Fails with [`HeimdallError::NoClient`] if no completion client was
    /// configured.
    pub fn build(self) -> Result<Gateway> {
        let client = self.client.ok_or(HeimdallError::NoClient)?;
        let moderator = self
            .moderator
            .unwrap_or_else(|| Arc::new(AllowAll) as Arc<dyn Moderator>);

        let breaker = Arc::new(CircuitBreaker::new(self.breaker_config));
        let guarded: Arc<dyn CompletionClient> =
            Arc::new(GuardedClient::new(client, Arc::clone(&breaker)));

        let backend = self.cache_backend.or_else(|| {
            self.memory_cache
                .map(|config| Arc::new(MemoryBackend::new(&config)) as Arc<dyn CacheBackend>)
        });
        let cache = backend.map(|backend| Arc::new(CacheLayer::new(backend)));

        Ok(Gateway::new(
            guarded,
            moderator,
            breaker,
            cache,
            self.stream_buffer_size,
        ))
    }
}

impl Default for HeimdallBuilder {
    fn default() -> Self {
        Self::new()
    }
}
