//! Cache-aside layer with stampede protection.
//!
//! [`CacheLayer`] implements the cache-aside pattern over a pluggable
//! byte-oriented [`CacheBackend`](crate::traits::CacheBackend): callers ask
//! for a value, the layer checks the store, and on a miss computes it via a
//! caller-supplied factory and fills the store itself.
//!
//! # Stampede protection
//!
//! Concurrent misses for the same key are collapsed to a single factory
//! invocation: the miss path acquires a mutual-exclusion gate, re-checks
//! the store (a concurrent caller may have filled it while we waited), and
//! only then computes. The gate is process-wide, so it also serialises
//! misses for *different* keys — faithful to the source design; per-key
//! lock sharding is the known enhancement if miss storms become a
//! bottleneck.
//!
//! # Failure policy
//!
//! Caching is never a source of request failure. Backend read errors
//! degrade to misses, write errors to no-ops, corrupt entries are
//! recomputed; everything is logged and the caller proceeds on the
//! freshly-computed value. Factory errors do propagate — they are the real
//! work, not the cache.

mod memory;

pub use memory::{CacheConfig, MemoryBackend};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::warn;

use crate::Result;
use crate::telemetry;
use crate::traits::CacheBackend;

/// Per-entry expiration policy.
///
/// Sliding expiration resets its clock on every successful read; absolute
/// expiration is fixed at write time and never extended. When both are set
/// the tighter bound wins. With neither set, the backend's default TTL
/// applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirationPolicy {
    pub sliding: Option<Duration>,
    pub absolute: Option<Duration>,
}

impl ExpirationPolicy {
    /// Expire after `duration` of idleness; each read restarts the clock.
    pub fn sliding(duration: Duration) -> Self {
        Self {
            sliding: Some(duration),
            ..Self::default()
        }
    }

    /// Expire `duration` after the write, regardless of access.
    pub fn absolute(duration: Duration) -> Self {
        Self {
            absolute: Some(duration),
            ..Self::default()
        }
    }

    /// Add an absolute bound to this policy.
    pub fn with_absolute(mut self, duration: Duration) -> Self {
        self.absolute = Some(duration);
        self
    }
}

/// Point-in-time cache statistics.
///
/// Hits and misses are observed by the layer; evictions and expirations
/// are driven by the backend. Computed on demand from live atomic
/// counters — taking a snapshot never blocks cache operations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_ratio: f64,
}

/// Cache-aside layer over a byte-oriented backend.
///
/// Values are serialized through `serde_json`; any `Serialize +
/// DeserializeOwned` type can be stored.
pub struct CacheLayer {
    backend: Arc<dyn CacheBackend>,
    fill_gate: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheLayer {
    /// Create a layer over the given backend.
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            fill_gate: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get the cached value for `key`, or compute and store it.
    ///
    /// Guarantees at most one factory invocation per concurrent miss storm:
    /// the miss path holds the fill gate across the re-check, the factory,
    /// and the store write. This is the one place in the crate where a lock
    /// is held across I/O — unavoidable for stampede protection.
    pub async fn get_or_set<T, F, Fut>(
        &self,
        key: &str,
        factory: F,
        policy: &ExpirationPolicy,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(value) = self.read(key).await {
            self.record_hit();
            return Ok(value);
        }
        self.record_miss();

        let _gate = self.fill_gate.lock().await;

        // Double-check: a concurrent caller may have filled the entry while
        // we waited on the gate.
        if let Some(value) = self.read(key).await {
            self.record_hit();
            return Ok(value);
        }

        let value = factory().await?;
        self.write(key, &value, policy).await;
        Ok(value)
    }

    /// Store a value under the given expiration policy.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, policy: &ExpirationPolicy) {
        self.write(key, value, policy).await;
    }

    /// Store a value with sliding expiration only.
    pub async fn set_with_sliding_expiration<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        sliding: Duration,
    ) {
        self.write(key, value, &ExpirationPolicy::sliding(sliding))
            .await;
    }

    /// Re-apply an expiration policy without recomputing the value.
    ///
    /// Returns `false` if the key is absent or the backend failed.
    pub async fn refresh(&self, key: &str, policy: &ExpirationPolicy) -> bool {
        match self.backend.refresh(key, policy).await {
            Ok(found) => found,
            Err(e) => {
                warn!(key, error = %e, "cache refresh failed");
                false
            }
        }
    }

    /// Remove one entry. Returns whether it existed.
    pub async fn remove(&self, key: &str) -> bool {
        match self.backend.remove(key).await {
            Ok(existed) => existed,
            Err(e) => {
                warn!(key, error = %e, "cache remove failed");
                false
            }
        }
    }

    /// Whether a live entry exists for `key`.
    pub async fn contains(&self, key: &str) -> bool {
        match self.backend.exists(key).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(key, error = %e, "cache exists check failed");
                false
            }
        }
    }

    /// Remove all entries whose key matches `pattern`.
    ///
    /// Supports a single leading wildcard (`*suffix`), trailing wildcard
    /// (`prefix*`), or a literal key. Returns the number removed.
    pub async fn remove_by_pattern(&self, pattern: &str) -> usize {
        let keys = match self.backend.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(pattern, error = %e, "cache key listing failed");
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys.iter().filter(|key| key_matches(key, pattern)) {
            if self.remove(key).await {
                removed += 1;
            }
        }
        removed
    }

    /// Snapshot the live counters.
    pub fn stats(&self) -> CacheStatistics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let (evictions, expirations) = self.backend.removal_counts();
        let lookups = hits + misses;
        CacheStatistics {
            hits,
            misses,
            evictions,
            expirations,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    /// Read and deserialize, degrading every failure to a miss.
    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.backend.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key, error = %e, "corrupt cache entry, treating as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Serialize and store, degrading every failure to a no-op.
    async fn write<T: Serialize>(&self, key: &str, value: &T, policy: &ExpirationPolicy) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "cache serialization failed, skipping store");
                return;
            }
        };
        if let Err(e) = self.backend.set(key, bytes, policy).await {
            warn!(key, error = %e, "cache write failed, continuing without store");
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_HITS_TOTAL).increment(1);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
    }
}

/// Match a key against `prefix*`, `*suffix`, or a literal pattern.
fn key_matches(key: &str, pattern: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        key.starts_with(prefix)
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        key.ends_with(suffix)
    } else {
        key == pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_pattern_matches_exactly() {
        assert!(key_matches("user:1", "user:1"));
        assert!(!key_matches("user:12", "user:1"));
    }

    #[test]
    fn trailing_wildcard_matches_prefix() {
        assert!(key_matches("user:1:profile", "user:1:*"));
        assert!(key_matches("user:1:", "user:1:*"));
        assert!(!key_matches("user:2:profile", "user:1:*"));
    }

    #[test]
    fn leading_wildcard_matches_suffix() {
        assert!(key_matches("user:1:profile", "*:profile"));
        assert!(!key_matches("user:1:settings", "*:profile"));
    }

    #[test]
    fn bare_star_matches_everything() {
        assert!(key_matches("anything", "*"));
        assert!(key_matches("", "*"));
    }

    #[test]
    fn policy_constructors() {
        let sliding = ExpirationPolicy::sliding(Duration::from_secs(5));
        assert_eq!(sliding.sliding, Some(Duration::from_secs(5)));
        assert_eq!(sliding.absolute, None);

        let both = ExpirationPolicy::sliding(Duration::from_secs(5))
            .with_absolute(Duration::from_secs(60));
        assert_eq!(both.absolute, Some(Duration::from_secs(60)));
    }
}
