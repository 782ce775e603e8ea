//! Tests for the per-key circuit breaker.
//!
//! Drives the trip / fast-reject / half-open / recovery lifecycle through
//! the public API with a paused clock, including the spy-count guarantees:
//! a rejected call must never invoke the wrapped operation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use heimdall::{
    BreakerConfig, CircuitBreaker, CircuitState, CompletionClient, CompletionRequest,
    CompletionResponse, GuardedClient, HeimdallError, Message, ProviderEventStream, Result,
};

fn breaker(threshold: u32, open_secs: u64) -> CircuitBreaker {
    CircuitBreaker::new(
        BreakerConfig::new()
            .failure_threshold(threshold)
            .open_duration(Duration::from_secs(open_secs)),
    )
}

#[tokio::test(start_paused = true)]
async fn rejected_call_never_invokes_operation() {
    let b = breaker(3, 60);
    let calls = Arc::new(AtomicU32::new(0));

    // Exactly 3 consecutive failures trip the circuit.
    for _ in 0..3 {
        let calls = Arc::clone(&calls);
        let result: Result<()> = b
            .execute("provider:completion", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HeimdallError::Upstream("connection refused".into()))
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(b.is_open("provider:completion"));

    // A 4th call is rejected without invoking the operation.
    let calls_clone = Arc::clone(&calls);
    let result: Result<()> = b
        .execute("provider:completion", || async move {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(matches!(result, Err(HeimdallError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 3, "spy count must stay at 3");
}

#[tokio::test(start_paused = true)]
async fn recovery_after_open_duration() {
    let b = breaker(3, 60);
    for _ in 0..3 {
        let _: Result<()> = b
            .execute("k", || async {
                Err(HeimdallError::Upstream("down".into()))
            })
            .await;
    }
    assert!(b.is_open("k"));

    tokio::time::advance(Duration::from_secs(61)).await;

    // The next call is attempted; on success the circuit closes and the
    // failure count resets.
    let result = b.execute("k", || async { Ok("recovered") }).await;
    assert_eq!(result.unwrap(), "recovered");
    assert!(!b.is_open("k"));
    let snap = b.snapshot("k").unwrap();
    assert_eq!(snap.state, CircuitState::Closed);
    assert_eq!(snap.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn wrapped_error_propagates_unchanged() {
    let b = breaker(5, 60);
    let result: Result<()> = b
        .execute("k", || async {
            Err(HeimdallError::Api {
                status: 502,
                message: "bad gateway".into(),
            })
        })
        .await;
    match result {
        Err(HeimdallError::Api { status, message }) => {
            assert_eq!(status, 502);
            assert_eq!(message, "bad gateway");
        }
        other => panic!("expected the wrapped Api error, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn rejection_is_distinct_from_wrapped_errors() {
    let b = breaker(1, 60);
    let _: Result<()> = b
        .execute("k", || async {
            Err(HeimdallError::Upstream("down".into()))
        })
        .await;

    let rejected: Result<()> = b.execute("k", || async { Ok(()) }).await;
    match rejected {
        Err(HeimdallError::CircuitOpen { key, retry_in }) => {
            assert_eq!(key, "k");
            assert!(retry_in <= Duration::from_secs(60));
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn only_one_half_open_trial_is_admitted() {
    let b = Arc::new(breaker(1, 30));
    let _: Result<()> = b
        .execute("k", || async {
            Err(HeimdallError::Upstream("down".into()))
        })
        .await;
    tokio::time::advance(Duration::from_secs(31)).await;

    // First caller claims the trial slot and holds it.
    let trial_breaker = Arc::clone(&b);
    let trial = tokio::spawn(async move {
        trial_breaker
            .execute("k", || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            })
            .await
    });
    tokio::task::yield_now().await;

    // A concurrent caller during the trial is fast-rejected.
    let concurrent: Result<()> = b.execute("k", || async { Ok(()) }).await;
    assert!(matches!(concurrent, Err(HeimdallError::CircuitOpen { .. })));

    assert!(trial.await.unwrap().is_ok());
    assert!(!b.is_open("k"));
}

#[tokio::test(start_paused = true)]
async fn reset_is_safe_with_in_flight_calls() {
    let b = Arc::new(breaker(2, 60));
    let _: Result<()> = b
        .execute("k", || async {
            Err(HeimdallError::Upstream("down".into()))
        })
        .await;

    // An in-flight call straddles the reset.
    let in_flight_breaker = Arc::clone(&b);
    let in_flight = tokio::spawn(async move {
        in_flight_breaker
            .execute("k", || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(7u32)
            })
            .await
    });
    tokio::task::yield_now().await;

    b.reset("k");

    assert_eq!(in_flight.await.unwrap().unwrap(), 7);
    let snap = b.snapshot("k").unwrap();
    assert_eq!(snap.state, CircuitState::Closed);
    assert_eq!(snap.failure_count, 0);
}

// ============================================================================
// GuardedClient
// ============================================================================

struct FlakyClient {
    calls: AtomicU32,
    fail_first: u32,
}

#[async_trait]
impl CompletionClient for FlakyClient {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn send_completion(&self, _request: &CompletionRequest) -> Result<CompletionResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            Err(HeimdallError::Upstream("transient outage".into()))
        } else {
            Ok(CompletionResponse {
                content: "ok".into(),
                ..CompletionResponse::default()
            })
        }
    }

    async fn open_completion_stream(
        &self,
        _request: &CompletionRequest,
    ) -> Result<ProviderEventStream> {
        Err(HeimdallError::Upstream("no stream".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn guarded_client_trips_on_provider_failures() {
    let breaker = Arc::new(breaker(2, 60));
    let inner = Arc::new(FlakyClient {
        calls: AtomicU32::new(0),
        fail_first: u32::MAX,
    });
    let guarded = GuardedClient::new(inner.clone(), Arc::clone(&breaker));
    let request = CompletionRequest::new("m", vec![Message::user("hi")]);

    assert!(guarded.send_completion(&request).await.is_err());
    assert!(guarded.send_completion(&request).await.is_err());

    // Circuit is open under the provider-scoped key; the provider is no
    // longer invoked.
    assert!(breaker.is_open("flaky:completion"));
    let result = guarded.send_completion(&request).await;
    assert!(matches!(result, Err(HeimdallError::CircuitOpen { .. })));
    assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn guarded_client_recovers_after_cooldown() {
    let breaker = Arc::new(breaker(2, 30));
    let inner = Arc::new(FlakyClient {
        calls: AtomicU32::new(0),
        fail_first: 2,
    });
    let guarded = GuardedClient::new(inner, Arc::clone(&breaker));
    let request = CompletionRequest::new("m", vec![Message::user("hi")]);

    assert!(guarded.send_completion(&request).await.is_err());
    assert!(guarded.send_completion(&request).await.is_err());
    assert!(breaker.is_open("flaky:completion"));

    tokio::time::advance(Duration::from_secs(31)).await;

    let response = guarded.send_completion(&request).await.unwrap();
    assert_eq!(response.content, "ok");
    assert!(!breaker.is_open("flaky:completion"));
}

#[tokio::test(start_paused = true)]
async fn stream_and_completion_keys_are_independent() {
    let breaker = Arc::new(breaker(1, 60));
    let inner = Arc::new(FlakyClient {
        calls: AtomicU32::new(0),
        fail_first: 0,
    });
    let guarded = GuardedClient::new(inner, Arc::clone(&breaker));
    let request = CompletionRequest::new("m", vec![Message::user("hi")]);

    // Stream acquisition always fails and trips its own key.
    assert!(guarded.open_completion_stream(&request).await.is_err());
    assert!(breaker.is_open("flaky:stream"));

    // Unary traffic is unaffected.
    assert!(!breaker.is_open("flaky:completion"));
    assert!(guarded.send_completion(&request).await.is_ok());
}
