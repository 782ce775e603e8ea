//! Heimdall - resilient dispatch core for LLM gateways
//!
//! This crate provides the resilience and orchestration layer of a
//! text-generation gateway: a per-key circuit breaker, a
//! bounded-concurrency batch orchestrator with order-preserving fan-in, a
//! streaming transform that moderates a live token stream, and a
//! stampede-safe cache-aside layer. Provider dispatch, moderation
//! decisions, and cache storage arrive as collaborator traits; the wire
//! surface (HTTP/JSON, CLI, config files) belongs to the layer above.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use heimdall::{Heimdall, CompletionRequest, Message};
//!
//! #[tokio::main]
//! async fn main() -> heimdall::Result<()> {
//!     let gateway = Heimdall::builder()
//!         .client(Arc::new(MyProviderClient::new()))
//!         .moderator(Arc::new(MyModerator::new()))
//!         .build()?;
//!
//!     // Single request, circuit-breaker protected.
//!     let response = gateway
//!         .complete(&CompletionRequest::new(
//!             "anthropic/claude-sonnet-4",
//!             vec![Message::user("What is the capital of France?")],
//!         ))
//!         .await?;
//!     println!("{}", response.content);
//!
//!     // Fan out a batch, at most 4 in flight, partial failures reported.
//!     let requests = (0..16)
//!         .map(|i| CompletionRequest::new("gpt-4o", vec![Message::user(format!("item {i}"))]))
//!         .collect();
//!     let batch = gateway.run_batch(requests, 4, false).await?;
//!     println!("{}/{} succeeded", batch.success_count, batch.len());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod telemetry;
pub mod traits;
pub mod types;

// Re-export main types at crate root
pub use error::{ErrorClass, HeimdallError, Result};
pub use gateway::{Gateway, Heimdall, HeimdallBuilder};
pub use traits::{
    AllowAll, CacheBackend, CompletionClient, ModerationVerdict, Moderator, ProviderEventStream,
};

// Re-export dispatch primitives
pub use dispatch::batch::run_batch;
pub use dispatch::breaker::{
    BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState, GuardedClient,
};
pub use dispatch::stream::{
    ClientChunkStream, DEFAULT_STREAM_BUFFER, REDACTION_MARKER, open_client_stream,
};

// Re-export cache layer
pub use cache::{CacheConfig, CacheLayer, CacheStatistics, ExpirationPolicy, MemoryBackend};

// Re-export all types
pub use types::{
    BatchItem, BatchResult, ChunkChoice, ChunkDelta, CompletionRequest, CompletionResponse,
    FinishReason, Message, ProviderChoice, ProviderEvent, Role, StreamChunk, Usage,
};
