//! Resilience and orchestration primitives.
//!
//! Three independent mechanisms, composed by the
//! [`Gateway`](crate::gateway::Gateway) facade but usable on their own:
//!
//! - [`breaker`] — per-key circuit breaker protecting upstream providers
//!   from hammering while they are down, with a [`GuardedClient`] decorator
//!   for the single-request path.
//! - [`batch`] — bounded-concurrency fan-out over many sub-requests with
//!   order-preserving fan-in and fail-fast/fail-soft semantics.
//! - [`stream`] — moderated reshaping of one provider token stream into
//!   client-facing chunks, tolerant of per-event faults.

pub mod batch;
pub mod breaker;
pub mod stream;

pub use batch::run_batch;
pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState, GuardedClient};
pub use stream::{
    ClientChunkStream, DEFAULT_STREAM_BUFFER, REDACTION_MARKER, open_client_stream,
};
