//! Gateway facade composing the dispatch core.
//!
//! [`Gateway`] ties the pieces together: the configured
//! [`CompletionClient`](crate::traits::CompletionClient) is wrapped in a
//! [`GuardedClient`](crate::dispatch::GuardedClient) so every dispatch and
//! stream acquisition runs under the circuit breaker; batches fan out
//! through that same guarded path; streams are moderated and reshaped by
//! the streaming transform; and an optional cache-aside layer deduplicates
//! repeat completions.

mod builder;

pub use builder::{Heimdall, HeimdallBuilder};

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::Result;
use crate::cache::{CacheLayer, CacheStatistics, ExpirationPolicy};
use crate::dispatch::breaker::CircuitBreaker;
use crate::dispatch::stream::ClientChunkStream;
use crate::dispatch::{batch, stream};
use crate::telemetry;
use crate::traits::{CompletionClient, Moderator};
use crate::types::{BatchResult, CompletionRequest, CompletionResponse};

/// Resilient dispatch gateway.
///
/// Create via [`Heimdall::builder()`].
pub struct Gateway {
    client: Arc<dyn CompletionClient>,
    moderator: Arc<dyn Moderator>,
    breaker: Arc<CircuitBreaker>,
    cache: Option<Arc<CacheLayer>>,
    stream_buffer_size: usize,
}

impl Gateway {
    pub(crate) fn new(
        client: Arc<dyn CompletionClient>,
        moderator: Arc<dyn Moderator>,
        breaker: Arc<CircuitBreaker>,
        cache: Option<Arc<CacheLayer>>,
        stream_buffer_size: usize,
    ) -> Self {
        Self {
            client,
            moderator,
            breaker,
            cache,
            stream_buffer_size,
        }
    }

    /// Dispatch one completion request through the circuit breaker.
    #[instrument(skip(self, request), fields(model = %request.model))]
    pub async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let started = Instant::now();
        let result = self.client.send_completion(request).await;
        record_request("complete", started, result.is_ok());
        result
    }

    /// Like [`complete`](Self::complete), but consults the cache-aside
    /// layer first, keyed on a content hash of the request.
    ///
    /// Repeat requests with identical model, messages, and sampling
    /// parameters are served from cache without touching the provider.
    /// Falls through to a plain dispatch when no cache is configured.
    pub async fn complete_cached(
        &self,
        request: &CompletionRequest,
        policy: &ExpirationPolicy,
    ) -> Result<CompletionResponse> {
        let Some(cache) = &self.cache else {
            return self.complete(request).await;
        };
        let key = completion_cache_key(request);
        cache
            .get_or_set(&key, || self.complete(request), policy)
            .await
    }

    /// Dispatch `requests` concurrently, at most `max_concurrency` in
    /// flight, preserving submission order in the result.
    pub async fn run_batch(
        &self,
        requests: Vec<CompletionRequest>,
        max_concurrency: usize,
        fail_fast: bool,
    ) -> Result<BatchResult> {
        self.run_batch_with_cancel(requests, max_concurrency, fail_fast, CancellationToken::new())
            .await
    }

    /// [`run_batch`](Self::run_batch) with a caller-supplied cancellation
    /// token. No per-call timeout is owned here; deadlines arrive through
    /// the token.
    pub async fn run_batch_with_cancel(
        &self,
        requests: Vec<CompletionRequest>,
        max_concurrency: usize,
        fail_fast: bool,
        cancel: CancellationToken,
    ) -> Result<BatchResult> {
        batch::run_batch(
            Arc::clone(&self.client),
            requests,
            max_concurrency,
            fail_fast,
            cancel,
        )
        .await
    }

    /// Open a moderated client-facing chunk stream for one request.
    pub async fn open_stream(&self, request: CompletionRequest) -> Result<ClientChunkStream> {
        self.open_stream_with_cancel(request, CancellationToken::new())
            .await
    }

    /// [`open_stream`](Self::open_stream) with a caller-supplied
    /// cancellation token. Cancelling disposes the upstream resource
    /// promptly and stops emission.
    pub async fn open_stream_with_cancel(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ClientChunkStream> {
        stream::open_client_stream(
            Arc::clone(&self.client),
            Arc::clone(&self.moderator),
            request,
            self.stream_buffer_size,
            cancel,
        )
        .await
    }

    /// The circuit breaker guarding this gateway's client.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Cache statistics, if a cache is configured.
    pub fn cache_stats(&self) -> Option<CacheStatistics> {
        self.cache.as_ref().map(|cache| cache.stats())
    }
}

/// Record request outcome metrics (counter + histogram).
fn record_request(operation: &'static str, started: Instant, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    metrics::counter!(telemetry::REQUESTS_TOTAL,
        "operation" => operation,
        "status" => status,
    )
    .increment(1);
    metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS,
        "operation" => operation,
    )
    .record(started.elapsed().as_secs_f64());
}

/// Deterministic cache key for a completion request.
///
/// Hashes model, messages, and sampling parameters. The `completion:` and
/// model prefixes keep keys friendly to pattern removal
/// (`completion:gpt-4:*`). The hash is stable within a process lifetime,
/// which is sufficient for the in-memory backend; a distributed backend
/// would want a cross-process stable hash.
fn completion_cache_key(request: &CompletionRequest) -> String {
    let mut hasher = DefaultHasher::new();
    request.model.hash(&mut hasher);
    for message in &request.messages {
        message.role.as_str().hash(&mut hasher);
        message.content.hash(&mut hasher);
    }
    request.max_tokens.hash(&mut hasher);
    request.temperature.map(f32::to_bits).hash(&mut hasher);
    format!("completion:{}:{:016x}", request.model, hasher.finish())
}
