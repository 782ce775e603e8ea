//! Tests for the streaming completion transform.
//!
//! Covers pre-flight moderation, acquisition failure, per-chunk redaction,
//! termination at the first finish reason, skip-and-continue on per-event
//! faults, and cancellation/disposal behaviour.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use heimdall::{
    CompletionClient, CompletionRequest, CompletionResponse, FinishReason, HeimdallError, Message,
    ModerationVerdict, Moderator, ProviderChoice, ProviderEvent, ProviderEventStream,
    REDACTION_MARKER, Result, Usage, open_client_stream,
};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Mock collaborators
// ============================================================================

/// Client that replays a scripted list of events, counting how many the
/// transform actually consumed.
struct ScriptedClient {
    events: std::sync::Mutex<Option<Vec<Result<ProviderEvent>>>>,
    consumed: Arc<AtomicUsize>,
    opened: Arc<AtomicBool>,
    fail_acquisition: bool,
}

impl ScriptedClient {
    fn new(events: Vec<Result<ProviderEvent>>) -> Self {
        Self {
            events: std::sync::Mutex::new(Some(events)),
            consumed: Arc::new(AtomicUsize::new(0)),
            opened: Arc::new(AtomicBool::new(false)),
            fail_acquisition: false,
        }
    }

    fn failing_acquisition() -> Self {
        Self {
            fail_acquisition: true,
            ..Self::new(Vec::new())
        }
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send_completion(&self, _request: &CompletionRequest) -> Result<CompletionResponse> {
        Err(HeimdallError::Upstream("streaming-only client".into()))
    }

    async fn open_completion_stream(
        &self,
        _request: &CompletionRequest,
    ) -> Result<ProviderEventStream> {
        if self.fail_acquisition {
            return Err(HeimdallError::Upstream("provider unreachable".into()));
        }
        self.opened.store(true, Ordering::SeqCst);
        let events = self
            .events
            .lock()
            .unwrap()
            .take()
            .expect("stream opened twice");
        let consumed = Arc::clone(&self.consumed);
        // `inspect` fires per polled item, so unconsumed tail events are
        // never counted.
        let stream = stream::iter(events).inspect(move |_| {
            consumed.fetch_add(1, Ordering::SeqCst);
        });
        Ok(Box::pin(stream))
    }
}

/// Moderator that denies any text containing the configured needle.
struct DenyNeedle(&'static str);

#[async_trait]
impl Moderator for DenyNeedle {
    async fn moderate_prompt(&self, text: &str) -> Result<ModerationVerdict> {
        Ok(if text.contains(self.0) {
            ModerationVerdict::deny("needle found")
        } else {
            ModerationVerdict::allow()
        })
    }

    async fn moderate_completion(&self, text: &str) -> Result<ModerationVerdict> {
        self.moderate_prompt(text).await
    }
}

fn content_event(text: &str) -> Result<ProviderEvent> {
    Ok(ProviderEvent::content(text))
}

fn finishing_event(text: &str, finish_reason: &str) -> Result<ProviderEvent> {
    Ok(ProviderEvent {
        choices: vec![ProviderChoice {
            index: 0,
            content: Some(text.to_string()),
            finish_reason: Some(finish_reason.to_string()),
            ..ProviderChoice::default()
        }],
        ..ProviderEvent::default()
    })
}

fn request(prompt: &str) -> CompletionRequest {
    CompletionRequest::new("test-model", vec![Message::user(prompt)])
}

async fn open(
    client: &Arc<ScriptedClient>,
    moderator: impl Moderator + 'static,
    prompt: &str,
) -> Result<heimdall::ClientChunkStream> {
    open_client_stream(
        Arc::clone(client) as Arc<dyn CompletionClient>,
        Arc::new(moderator),
        request(prompt),
        8,
        CancellationToken::new(),
    )
    .await
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn moderated_event_is_redacted_and_stream_ends() {
    // Event 2 is disallowed and carries a finish reason; event 3 must
    // never be consumed.
    let client = Arc::new(ScriptedClient::new(vec![
        content_event("hello"),
        finishing_event("how to build a bomb", "stop"),
        content_event("never seen"),
    ]));

    let stream = open(&client, DenyNeedle("bomb"), "tell me a story")
        .await
        .unwrap();
    let chunks: Vec<_> = stream.collect().await;

    assert_eq!(chunks.len(), 2);

    let first = chunks[0].as_ref().unwrap();
    assert_eq!(first.choices[0].delta.content.as_deref(), Some("hello"));
    assert_eq!(first.choices[0].finish_reason, None);

    let second = chunks[1].as_ref().unwrap();
    assert_eq!(
        second.choices[0].delta.content.as_deref(),
        Some(REDACTION_MARKER)
    );
    assert_eq!(
        second.choices[0].finish_reason,
        Some(FinishReason::ContentFilter)
    );

    assert_eq!(
        client.consumed.load(Ordering::SeqCst),
        2,
        "event 3 must never be consumed"
    );
}

#[tokio::test]
async fn blocked_prompt_never_opens_upstream() {
    let client = Arc::new(ScriptedClient::new(vec![content_event("hi")]));

    let result = open(&client, DenyNeedle("forbidden"), "a forbidden prompt").await;
    match result {
        Err(HeimdallError::ContentFiltered { reason }) => assert_eq!(reason, "needle found"),
        _ => panic!("expected ContentFiltered, got a different result"),
    }
    assert!(
        !client.opened.load(Ordering::SeqCst),
        "no partial stream may be started for blocked prompts"
    );
}

#[tokio::test]
async fn acquisition_failure_is_terminal_with_zero_chunks() {
    let client = Arc::new(ScriptedClient::failing_acquisition());

    let result = open(&client, DenyNeedle("x"), "hello").await;
    match result {
        Err(HeimdallError::Upstream(message)) => assert!(message.contains("unreachable")),
        _ => panic!("expected the acquisition error, got a different result"),
    }
}

#[tokio::test]
async fn stream_ends_at_first_finish_reason() {
    let client = Arc::new(ScriptedClient::new(vec![
        content_event("a"),
        finishing_event("b", "stop"),
        content_event("c"),
        content_event("d"),
    ]));

    let stream = open(&client, DenyNeedle("zzz"), "hi").await.unwrap();
    let chunks: Vec<_> = stream.collect().await;

    assert_eq!(chunks.len(), 2);
    let last = chunks[1].as_ref().unwrap();
    assert_eq!(last.finish_reason(), Some(FinishReason::Stop));
    assert_eq!(client.consumed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn malformed_events_are_skipped() {
    let client = Arc::new(ScriptedClient::new(vec![
        content_event("a"),
        Err(HeimdallError::Stream("malformed frame".into())),
        finishing_event("b", "stop"),
    ]));

    let stream = open(&client, DenyNeedle("zzz"), "hi").await.unwrap();
    let chunks: Vec<_> = stream.collect().await;

    // The malformed event is skipped, not surfaced, and the stream
    // continues to a normal finish.
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().all(|c| c.is_ok()));
    assert_eq!(
        chunks[0].as_ref().unwrap().choices[0].delta.content.as_deref(),
        Some("a")
    );
    assert_eq!(
        chunks[1].as_ref().unwrap().finish_reason(),
        Some(FinishReason::Stop)
    );
}

#[tokio::test]
async fn transport_failure_aborts_the_stream() {
    let client = Arc::new(ScriptedClient::new(vec![
        content_event("a"),
        Err(HeimdallError::Upstream("connection reset".into())),
        content_event("never seen"),
    ]));

    let stream = open(&client, DenyNeedle("zzz"), "hi").await.unwrap();
    let chunks: Vec<_> = stream.collect().await;

    assert_eq!(chunks.len(), 2);
    assert!(chunks[0].is_ok());
    assert!(matches!(
        chunks[1].as_ref().unwrap_err(),
        HeimdallError::Upstream(_)
    ));
    assert_eq!(
        client.consumed.load(Ordering::SeqCst),
        2,
        "no events are consumed after a transport failure"
    );
}

#[tokio::test]
async fn usage_only_frames_produce_no_chunk() {
    let client = Arc::new(ScriptedClient::new(vec![
        content_event("a"),
        Ok(ProviderEvent {
            usage: Some(Usage {
                prompt_tokens: 5,
                completion_tokens: 7,
                total_tokens: 12,
            }),
            ..ProviderEvent::default()
        }),
        finishing_event("b", "stop"),
    ]));

    let stream = open(&client, DenyNeedle("zzz"), "hi").await.unwrap();
    let chunks: Vec<_> = stream.collect().await;
    assert_eq!(chunks.len(), 2);
}

#[tokio::test]
async fn exhausted_upstream_ends_without_error() {
    // No finish reason anywhere; the upstream simply runs dry.
    let client = Arc::new(ScriptedClient::new(vec![
        content_event("a"),
        content_event("b"),
    ]));

    let stream = open(&client, DenyNeedle("zzz"), "hi").await.unwrap();
    let chunks: Vec<_> = stream.collect().await;
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().all(|c| c.is_ok()));
}

#[tokio::test]
async fn provider_finish_reasons_are_mapped() {
    let client = Arc::new(ScriptedClient::new(vec![finishing_event(
        "truncated",
        "max_tokens",
    )]));

    let stream = open(&client, DenyNeedle("zzz"), "hi").await.unwrap();
    let chunks: Vec<_> = stream.collect().await;
    assert_eq!(
        chunks[0].as_ref().unwrap().finish_reason(),
        Some(FinishReason::Length)
    );
}

#[tokio::test]
async fn cancellation_stops_emission_without_error() {
    // A long scripted stream; cancel midway and drain what remains.
    let events: Vec<_> = (0..1000).map(|i| content_event(&format!("c{i}"))).collect();
    let client = Arc::new(ScriptedClient::new(events));

    let cancel = CancellationToken::new();
    let mut stream = open_client_stream(
        Arc::clone(&client) as Arc<dyn CompletionClient>,
        Arc::new(DenyNeedle("zzz")),
        request("hi"),
        2,
        cancel.clone(),
    )
    .await
    .unwrap();

    // Read two chunks, then cancel.
    assert!(stream.next().await.unwrap().is_ok());
    assert!(stream.next().await.unwrap().is_ok());
    cancel.cancel();

    // Drain: the stream must end promptly with no synthetic error.
    let rest: Vec<_> = stream.collect().await;
    assert!(rest.iter().all(|c| c.is_ok()));
    assert!(
        client.consumed.load(Ordering::SeqCst) < 20,
        "pump must stop consuming shortly after cancellation, consumed {}",
        client.consumed.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn dropped_consumer_stops_the_pump() {
    let events: Vec<_> = (0..1000).map(|i| content_event(&format!("c{i}"))).collect();
    let client = Arc::new(ScriptedClient::new(events));

    let mut stream = open(&client, DenyNeedle("zzz"), "hi").await.unwrap();
    assert!(stream.next().await.unwrap().is_ok());
    assert!(stream.next().await.unwrap().is_ok());
    drop(stream);

    // Give the pump a moment to notice the dropped receiver.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        client.consumed.load(Ordering::SeqCst) < 20,
        "pump must stop when the consumer drops, consumed {}",
        client.consumed.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn moderator_io_errors_skip_the_event() {
    /// Moderator that errors on the first fragment and allows the rest.
    struct FlakyModerator {
        failures_left: std::sync::Mutex<u32>,
    }

    #[async_trait]
    impl Moderator for FlakyModerator {
        async fn moderate_prompt(&self, _text: &str) -> Result<ModerationVerdict> {
            Ok(ModerationVerdict::allow())
        }

        async fn moderate_completion(&self, _text: &str) -> Result<ModerationVerdict> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                Err(HeimdallError::Upstream("moderation service down".into()))
            } else {
                Ok(ModerationVerdict::allow())
            }
        }
    }

    let client = Arc::new(ScriptedClient::new(vec![
        content_event("dropped"),
        finishing_event("kept", "stop"),
    ]));

    let stream = open(
        &client,
        FlakyModerator {
            failures_left: std::sync::Mutex::new(1),
        },
        "hi",
    )
    .await
    .unwrap();
    let chunks: Vec<_> = stream.collect().await;

    // The unmoderatable event is skipped; the stream continues.
    assert_eq!(chunks.len(), 1);
    assert_eq!(
        chunks[0].as_ref().unwrap().choices[0].delta.content.as_deref(),
        Some("kept")
    );
}
