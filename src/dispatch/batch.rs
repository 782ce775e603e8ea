//! Bounded-concurrency batch dispatch with order-preserving fan-in.
//!
//! One logical task is launched per sub-request; a counting semaphore of
//! `max_concurrency` permits gates how many are in flight at once. Results
//! are collected in completion order and sorted back to submission order
//! before the batch result is assembled — completion order never leaks to
//! the caller.
//!
//! Two failure modes:
//! - **fail-soft** (default): a failing sub-request contributes a
//!   placeholder payload carrying its error message; the batch completes.
//! - **fail-fast**: the first sub-request failure aborts the batch and
//!   propagates that error; sibling results are discarded.
//!
//! No per-call timeout is owned here; callers supply deadlines through the
//! cancellation token.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::telemetry;
use crate::traits::CompletionClient;
use crate::types::{BatchItem, BatchResult, CompletionRequest};
use crate::{HeimdallError, Result};

/// Dispatch `requests` concurrently through `client`, at most
/// `max_concurrency` in flight at once.
///
/// `responses` in the returned [`BatchResult`] are ordered by submission
/// index regardless of completion order. Cancelling the token resolves
/// in-flight sub-requests as failures (fail-soft) or aborts the batch with
/// [`HeimdallError::Cancelled`] (fail-fast).
#[instrument(skip(client, requests, cancel), fields(batch_size = requests.len()))]
pub async fn run_batch(
    client: Arc<dyn CompletionClient>,
    requests: Vec<CompletionRequest>,
    max_concurrency: usize,
    fail_fast: bool,
    cancel: CancellationToken,
) -> Result<BatchResult> {
    if max_concurrency == 0 {
        return Err(HeimdallError::InvalidInput(
            "max_concurrency must be at least 1".to_string(),
        ));
    }
    if requests.is_empty() {
        return Ok(BatchResult::empty());
    }

    let started = Instant::now();
    let size = requests.len();
    let permits = Arc::new(Semaphore::new(max_concurrency.min(size)));
    let mut tasks = JoinSet::new();

    for (index, request) in requests.into_iter().enumerate() {
        let client = Arc::clone(&client);
        let permits = Arc::clone(&permits);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            // The permit is held for the life of the task and released on
            // every path, including cancellation, by dropping the guard.
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return (index, Err(HeimdallError::Cancelled)),
                permit = permits.acquire_owned() => permit.expect("batch semaphore closed"),
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(HeimdallError::Cancelled),
                result = client.send_completion(&request) => result,
            };
            (index, result)
        });
    }

    let mut items: Vec<BatchItem> = Vec::with_capacity(size);
    while let Some(joined) = tasks.join_next().await {
        let (index, result) = joined
            .map_err(|e| HeimdallError::Upstream(format!("batch sub-task failed: {e}")))?;
        match result {
            Ok(response) => items.push(BatchItem::ok(index, response)),
            Err(e) if fail_fast => {
                // Sibling tasks are dropped with the set; their results are
                // discarded either way.
                warn!(index, error = %e, "batch aborted on first sub-request failure");
                record_batch(size, items.len(), size - items.len(), started, "aborted");
                return Err(e);
            }
            Err(e) => items.push(BatchItem::failed(index, e.to_string())),
        }
    }

    // Fan-in: restore submission order before assembling the result.
    items.sort_unstable_by_key(|item| item.index);

    let success_count = items.iter().filter(|item| item.is_success()).count();
    let failure_count = items.len() - success_count;
    let errors: Vec<String> = items
        .iter()
        .filter_map(|item| item.error.clone())
        .collect();

    record_batch(size, success_count, failure_count, started, "ok");

    Ok(BatchResult {
        responses: items,
        success_count,
        failure_count,
        errors,
        total_duration_ms: started.elapsed().as_secs_f64() * 1_000.0,
    })
}

/// One metric emission per batch completion; the `aborted` status marks the
/// fail-fast path as a total failure.
fn record_batch(size: usize, ok: usize, failed: usize, started: Instant, status: &'static str) {
    metrics::counter!(telemetry::BATCHES_TOTAL, "status" => status).increment(1);
    metrics::counter!(telemetry::BATCH_ITEMS_TOTAL, "status" => "ok").increment(ok as u64);
    metrics::counter!(telemetry::BATCH_ITEMS_TOTAL, "status" => "error").increment(failed as u64);
    metrics::histogram!(telemetry::BATCH_SIZE).record(size as f64);
    metrics::histogram!(telemetry::BATCH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}
