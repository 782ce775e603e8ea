//! Telemetry metric name constants.
//!
//! Centralised metric names for heimdall operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `heimdall_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `operation` — gateway entry point (e.g. "complete", "batch", "stream")
//! - `status` — outcome: "ok", "error", "aborted", or "cancelled"
//! - `key` — circuit-breaker key (provider + operation)
//! - `state` — circuit state after a transition

/// Total requests dispatched through the gateway.
///
/// Labels: `operation`, `status` ("ok" | "error").
pub const REQUESTS_TOTAL: &str = "heimdall_requests_total";

/// Request duration in seconds.
///
/// Labels: `operation`.
pub const REQUEST_DURATION_SECONDS: &str = "heimdall_request_duration_seconds";

/// Fast-rejects raised while a circuit was open.
///
/// Labels: `key`.
pub const BREAKER_REJECTIONS_TOTAL: &str = "heimdall_breaker_rejections_total";

/// Circuit state transitions.
///
/// Labels: `key`, `state` ("open" | "half_open" | "closed").
pub const BREAKER_TRANSITIONS_TOTAL: &str = "heimdall_breaker_transitions_total";

/// Completed batch operations.
///
/// Labels: `status` ("ok" | "aborted").
pub const BATCHES_TOTAL: &str = "heimdall_batches_total";

/// Sub-request outcomes across all batches.
///
/// Labels: `status` ("ok" | "error").
pub const BATCH_ITEMS_TOTAL: &str = "heimdall_batch_items_total";

/// Number of sub-requests per batch.
pub const BATCH_SIZE: &str = "heimdall_batch_size";

/// Wall-clock duration of a whole batch in seconds.
pub const BATCH_DURATION_SECONDS: &str = "heimdall_batch_duration_seconds";

/// Terminated client streams.
///
/// Labels: `status` ("ok" | "error" | "cancelled").
pub const STREAMS_TOTAL: &str = "heimdall_streams_total";

/// Chunks emitted per client stream.
pub const STREAM_CHUNKS: &str = "heimdall_stream_chunks";

/// Stream duration in seconds, measured from pre-flight to termination.
pub const STREAM_DURATION_SECONDS: &str = "heimdall_stream_duration_seconds";

/// Total tokens reported by upstream usage frames.
pub const STREAM_TOKENS_TOTAL: &str = "heimdall_stream_tokens_total";

/// Total cache hits.
pub const CACHE_HITS_TOTAL: &str = "heimdall_cache_hits_total";

/// Total cache misses.
pub const CACHE_MISSES_TOTAL: &str = "heimdall_cache_misses_total";
