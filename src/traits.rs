//! Collaborator contracts consumed by the dispatch core.
//!
//! The core orchestrates but does not own provider dispatch, moderation
//! decisions, or cache storage. Each of those arrives as a trait object:
//!
//! - [`CompletionClient`] — sends one completion request or opens one
//!   provider-level token stream. Wire mapping, authentication, and
//!   per-call timeouts all live behind this seam.
//! - [`Moderator`] — pass/fail content decisions. The decision model is
//!   external; only the verdict contract is consumed here.
//! - [`CacheBackend`] — a byte-oriented store with per-entry TTL support,
//!   backing the cache-aside layer.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::Result;
use crate::cache::ExpirationPolicy;
use crate::types::{CompletionRequest, CompletionResponse, ProviderEvent};

/// A provider-level token stream for a single request.
pub type ProviderEventStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent>> + Send>>;

// ============================================================================
// Completion client
// ============================================================================

/// Single-request provider dispatch.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Provider name for logging, metrics, and circuit-breaker keys.
    fn name(&self) -> &str;

    /// Send one completion request and await its full response.
    async fn send_completion(&self, request: &CompletionRequest) -> Result<CompletionResponse>;

    /// Open a provider-level token stream for one request.
    ///
    /// Errors here are acquisition failures: no event has been consumed and
    /// no partial stream exists.
    async fn open_completion_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<ProviderEventStream>;
}

// ============================================================================
// Moderation
// ============================================================================

/// Outcome of a moderation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl ModerationVerdict {
    /// Content is allowed.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// Content is disallowed, with a reason.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Content moderation collaborator.
#[async_trait]
pub trait Moderator: Send + Sync {
    /// Check a full prompt before any upstream work starts.
    async fn moderate_prompt(&self, text: &str) -> Result<ModerationVerdict>;

    /// Check a completion fragment as it streams.
    async fn moderate_completion(&self, text: &str) -> Result<ModerationVerdict>;
}

/// Moderator that allows everything.
///
/// Default when no moderator is configured on the gateway builder.
pub struct AllowAll;

#[async_trait]
impl Moderator for AllowAll {
    async fn moderate_prompt(&self, _text: &str) -> Result<ModerationVerdict> {
        Ok(ModerationVerdict::allow())
    }

    async fn moderate_completion(&self, _text: &str) -> Result<ModerationVerdict> {
        Ok(ModerationVerdict::allow())
    }
}

// ============================================================================
// Cache backend
// ============================================================================

/// Byte-oriented store with per-entry TTL support.
///
/// Backends are swappable (in-memory, redis, ...); the bundled
/// implementation is [`MemoryBackend`](crate::cache::MemoryBackend).
/// All methods return `Err` only for backend I/O faults — the cache-aside
/// layer degrades those to misses/no-ops, never to request failures.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Read raw bytes. Sliding expiration, if set, resets on a hit.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store raw bytes under the given expiration policy.
    async fn set(&self, key: &str, value: Vec<u8>, policy: &ExpirationPolicy) -> Result<()>;

    /// Remove one entry. Returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Whether a live entry exists for this key.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Re-apply an expiration policy without touching the value.
    ///
    /// Returns `false` if the key is absent.
    async fn refresh(&self, key: &str, policy: &ExpirationPolicy) -> Result<bool>;

    /// All live keys, for pattern removal.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Cumulative `(evictions, expirations)` driven by the backend.
    fn removal_counts(&self) -> (u64, u64) {
        (0, 0)
    }
}
