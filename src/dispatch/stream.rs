//! Streaming completion transform with per-chunk moderation.
//!
//! Consumes one provider-level token stream, reshapes each event into the
//! client-facing [`StreamChunk`] format, and moderates every non-empty
//! content fragment on the way through. Disallowed fragments are replaced
//! with [`REDACTION_MARKER`] and the choice is forced to
//! `finish_reason = content_filter`.
//!
//! # Failure model
//!
//! Three distinct terminal conditions, which callers can tell apart:
//!
//! - **finished** — a chunk carrying a finish reason was emitted; no
//!   further upstream events are consumed.
//! - **aborted** — pre-flight moderation rejected the prompt, stream
//!   acquisition failed (both raised before any chunk exists), or the
//!   upstream transport failed mid-stream (surfaced as the final `Err`
//!   item).
//! - **cancelled** — the caller cancelled or dropped the stream; emission
//!   stops without a synthetic error.
//!
//! Per-event processing faults (malformed frame, moderator I/O error) are
//! not terminal: the event is skipped, logged, and the stream continues.
//!
//! # Backpressure
//!
//! Chunks flow through a bounded `tokio::sync::mpsc` channel so a fast
//! provider cannot fill unbounded memory when the consumer falls behind.
//! Dropping the returned stream stops the pump and disposes the upstream
//! resource.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::telemetry;
use crate::traits::{CompletionClient, Moderator, ProviderEventStream};
use crate::types::{
    ChunkChoice, ChunkDelta, CompletionRequest, FinishReason, ProviderEvent, StreamChunk,
};
use crate::{HeimdallError, Result};

/// Replacement text for a content fragment the moderator disallowed.
pub const REDACTION_MARKER: &str = "[content filtered]";

/// Default number of chunks buffered between the pump and the consumer.
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// A finite, single-pass stream of client-facing chunks.
pub type ClientChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Open a moderated client-facing chunk stream for one request.
///
/// The full prompt is moderated before the upstream stream is opened; a
/// rejection is terminal and no partial stream is ever started. An
/// acquisition failure is likewise terminal, raised with zero chunks
/// emitted and exactly one failure metric recorded.
pub async fn open_client_stream(
    client: Arc<dyn CompletionClient>,
    moderator: Arc<dyn Moderator>,
    request: CompletionRequest,
    buffer_size: usize,
    cancel: CancellationToken,
) -> Result<ClientChunkStream> {
    let started = Instant::now();

    let verdict = moderator.moderate_prompt(&request.prompt_text()).await?;
    if !verdict.allowed {
        let reason = verdict
            .reason
            .unwrap_or_else(|| "prompt rejected".to_string());
        debug!(model = %request.model, %reason, "prompt blocked before streaming");
        return Err(HeimdallError::ContentFiltered { reason });
    }

    let upstream = match client.open_completion_stream(&request).await {
        Ok(stream) => stream,
        Err(e) => {
            record_stream(started.elapsed(), 0, 0, "error");
            return Err(e);
        }
    };

    let provider = client.name().to_string();
    let (tx, rx) = tokio::sync::mpsc::channel(buffer_size.max(1));
    tokio::spawn(pump(
        upstream,
        moderator,
        provider,
        request.model,
        tx,
        cancel,
        started,
    ));
    Ok(Box::pin(ReceiverStream::new(rx)))
}

/// Pump upstream events into the client channel until the stream finishes,
/// fails, or is cancelled. Terminal accounting runs on every exit path.
async fn pump(
    mut upstream: ProviderEventStream,
    moderator: Arc<dyn Moderator>,
    provider: String,
    model: String,
    tx: tokio::sync::mpsc::Sender<Result<StreamChunk>>,
    cancel: CancellationToken,
    started: Instant,
) {
    let mut chunks: u64 = 0;
    let mut tokens: u64 = 0;
    let mut status = "ok";

    loop {
        let event = tokio::select! {
            // Checked first so cancellation wins over a ready event.
            biased;
            _ = cancel.cancelled() => {
                status = "cancelled";
                break;
            }
            event = upstream.next() => event,
        };
        // Upstream exhausted without a finish reason: still a normal end.
        let Some(event) = event else { break };

        let event = match event {
            Ok(event) => event,
            Err(HeimdallError::Stream(reason)) => {
                // Malformed frame from the provider decoder: skip it and
                // continue with the next upstream event.
                warn!(provider = %provider, %reason, "skipping malformed stream event");
                continue;
            }
            Err(e) => {
                // Transport-level failure is terminal; surface it as the
                // final item so the caller sees an aborted stream.
                status = "error";
                let _ = tx.send(Err(e)).await;
                break;
            }
        };

        if let Some(usage) = &event.usage {
            tokens = u64::from(usage.total_tokens);
        }

        let chunk = match transform_event(event, moderator.as_ref(), &provider, &model).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => continue, // nothing renderable (usage-only frame)
            Err(e) => {
                warn!(provider = %provider, error = %e, "skipping unprocessable stream event");
                continue;
            }
        };

        let finished = chunk.finish_reason().is_some();
        if tx.send(Ok(chunk)).await.is_err() {
            // Consumer dropped the stream.
            status = "cancelled";
            break;
        }
        chunks += 1;
        if finished {
            break;
        }
    }

    // Dispose the upstream resource before accounting.
    drop(upstream);
    record_stream(started.elapsed(), chunks, tokens, status);
    debug!(
        provider = %provider,
        model = %model,
        chunks,
        tokens,
        status,
        "client stream closed"
    );
}

/// Map one provider event to a client chunk, moderating each non-empty
/// content fragment. Returns `Ok(None)` for events with nothing to render.
async fn transform_event(
    event: ProviderEvent,
    moderator: &dyn Moderator,
    provider: &str,
    model: &str,
) -> Result<Option<StreamChunk>> {
    if event.choices.is_empty() {
        return Ok(None);
    }

    let mut choices = Vec::with_capacity(event.choices.len());
    for choice in event.choices {
        let mut finish_reason = choice
            .finish_reason
            .as_deref()
            .map(FinishReason::from_provider);
        let mut content = choice.content;

        if let Some(text) = content.as_deref()
            && !text.is_empty()
        {
            let verdict = moderator.moderate_completion(text).await?;
            if !verdict.allowed {
                content = Some(REDACTION_MARKER.to_string());
                finish_reason = Some(FinishReason::ContentFilter);
            }
        }

        choices.push(ChunkChoice {
            index: choice.index,
            delta: ChunkDelta {
                role: choice.role,
                content,
            },
            finish_reason,
        });
    }

    Ok(Some(StreamChunk {
        id: event.id.unwrap_or_default(),
        created: event.created.unwrap_or_else(unix_now),
        model: event.model.unwrap_or_else(|| model.to_string()),
        provider: provider.to_string(),
        choices,
    }))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Single end-of-stream metric emission: outcome, chunk count, token total,
/// elapsed time.
fn record_stream(elapsed: Duration, chunks: u64, tokens: u64, status: &'static str) {
    metrics::counter!(telemetry::STREAMS_TOTAL, "status" => status).increment(1);
    metrics::counter!(telemetry::STREAM_TOKENS_TOTAL).increment(tokens);
    metrics::histogram!(telemetry::STREAM_CHUNKS).record(chunks as f64);
    metrics::histogram!(telemetry::STREAM_DURATION_SECONDS).record(elapsed.as_secs_f64());
}
