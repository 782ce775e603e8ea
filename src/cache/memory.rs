//! Bundled in-memory cache backend.
//!
//! [`MemoryBackend`] keeps entries in a bounded moka cache with a
//! per-entry expiry derived from each entry's [`ExpirationPolicy`]:
//! sliding expiration restarts its clock on every read, absolute
//! expiration is a deadline fixed at write time, and when both are set
//! the tighter bound wins. Size-based evictions and expiry-based removals
//! feed separate counters, surfaced through
//! [`CacheBackend::removal_counts`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use moka::notification::RemovalCause;

use crate::Result;
use crate::cache::ExpirationPolicy;
use crate::traits::CacheBackend;

/// Configuration for the bundled memory backend.
///
/// ```rust
/// # use heimdall::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .max_entries(10_000)
///     .ttl(Duration::from_secs(3600));
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of cached entries. Default: 10,000.
    pub max_entries: u64,
    /// Time-to-live applied to entries stored without an explicit
    /// expiration policy. Default: 1 hour.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

impl CacheConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of cached entries.
    pub fn max_entries(mut self, n: u64) -> Self {
        self.max_entries = n;
        self
    }

    /// Set the default time-to-live for policy-less entries.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Stored bytes plus the expiration policy they were written under.
#[derive(Clone)]
struct StoredEntry {
    bytes: Arc<Vec<u8>>,
    sliding: Option<Duration>,
    /// Absolute deadline, fixed at write time.
    expires_at: Option<Instant>,
}

impl StoredEntry {
    /// Time to live from `now`, honouring the tighter of the two bounds.
    fn ttl_from(&self, now: Instant, default_ttl: Duration) -> Duration {
        let absolute = self
            .expires_at
            .map(|deadline| deadline.saturating_duration_since(now));
        match (self.sliding, absolute) {
            (Some(sliding), Some(absolute)) => sliding.min(absolute),
            (Some(sliding), None) => sliding,
            (None, Some(absolute)) => absolute,
            (None, None) => default_ttl,
        }
    }
}

/// Per-entry expiry: create/update set the initial window, reads restart
/// sliding clocks but can never extend past an absolute deadline.
struct EntryExpiry {
    default_ttl: Duration,
}

impl Expiry<String, StoredEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &StoredEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl_from(Instant::now(), self.default_ttl))
    }

    fn expire_after_read(
        &self,
        _key: &String,
        entry: &StoredEntry,
        _read_at: Instant,
        duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        match entry.sliding {
            Some(_) => Some(entry.ttl_from(Instant::now(), self.default_ttl)),
            None => duration_until_expiry,
        }
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &StoredEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl_from(Instant::now(), self.default_ttl))
    }
}

/// In-memory byte store with per-entry TTL support.
pub struct MemoryBackend {
    entries: Cache<String, StoredEntry>,
    evictions: Arc<AtomicU64>,
    expirations: Arc<AtomicU64>,
}

impl MemoryBackend {
    /// Create a backend with the given configuration.
    pub fn new(config: &CacheConfig) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let expirations = Arc::new(AtomicU64::new(0));
        let evicted = Arc::clone(&evictions);
        let expired = Arc::clone(&expirations);

        let entries = Cache::builder()
            .max_capacity(config.max_entries)
            .expire_after(EntryExpiry {
                default_ttl: config.ttl,
            })
            .eviction_listener(move |_key, _value, cause| match cause {
                RemovalCause::Expired => {
                    expired.fetch_add(1, Ordering::Relaxed);
                }
                RemovalCause::Size => {
                    evicted.fetch_add(1, Ordering::Relaxed);
                }
                RemovalCause::Explicit | RemovalCause::Replaced => {}
            })
            .build();

        Self {
            entries,
            evictions,
            expirations,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        // The read resets sliding clocks via `expire_after_read`.
        Ok(self
            .entries
            .get(key)
            .await
            .map(|entry| entry.bytes.as_ref().clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, policy: &ExpirationPolicy) -> Result<()> {
        let entry = StoredEntry {
            bytes: Arc::new(value),
            sliding: policy.sliding,
            expires_at: policy.absolute.map(|ttl| Instant::now() + ttl),
        };
        self.entries.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).await.is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }

    async fn refresh(&self, key: &str, policy: &ExpirationPolicy) -> Result<bool> {
        let Some(current) = self.entries.get(key).await else {
            return Ok(false);
        };
        let entry = StoredEntry {
            bytes: current.bytes,
            sliding: policy.sliding,
            expires_at: policy.absolute.map(|ttl| Instant::now() + ttl),
        };
        // Re-insert to restart the expiry window under the new policy.
        self.entries.insert(key.to_string(), entry).await;
        Ok(true)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .map(|(key, _)| key.as_ref().clone())
            .collect())
    }

    fn removal_counts(&self) -> (u64, u64) {
        (
            self.evictions.load(Ordering::Relaxed),
            self.expirations.load(Ordering::Relaxed),
        )
    }
}
