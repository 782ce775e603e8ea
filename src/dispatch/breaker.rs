//! Per-key circuit breaker for upstream provider health.
//!
//! Implements the Closed -> Open -> Half-Open -> Closed lifecycle:
//! - **Closed**: operations are invoked, transient failures are counted
//! - **Open**: operations are fast-rejected until the open duration expires
//! - **Half-Open**: exactly one trial invocation is allowed through
//!
//! Keys are arbitrary strings, typically `provider:operation`. State is
//! kept in a concurrent keyed map with one small mutex per key; no lock is
//! ever held across an await point. The Open -> Half-Open transition is
//! lazy: it happens on the first admission check after the timer expires.
//!
//! Only errors classified [`Transient`](crate::ErrorClass::Transient) count
//! toward the failure threshold or re-open a half-open circuit; permanent
//! and filtered errors propagate unchanged without tripping anything, since
//! the upstream demonstrably answered.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::telemetry;
use crate::traits::{CompletionClient, ProviderEventStream};
use crate::types::{CompletionRequest, CompletionResponse};
use crate::{HeimdallError, Result};

/// Configuration for circuit-breaker behaviour.
///
/// ```rust
/// # use heimdall::BreakerConfig;
/// # use std::time::Duration;
/// let config = BreakerConfig::new()
///     .failure_threshold(3)
///     .open_duration(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive transient failures required to trip the circuit.
    /// Default: 5.
    pub failure_threshold: u32,
    /// Duration the circuit stays open before allowing a trial. Default: 60s.
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
        }
    }
}

impl BreakerConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the consecutive-failure threshold (minimum 1).
    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n.max(1);
        self
    }

    /// Set the open duration (minimum 1ms).
    pub fn open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration.max(Duration::from_millis(1));
        self
    }
}

/// The three states of a per-key circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. Operations are invoked, failures counted.
    Closed,
    /// Circuit tripped. Calls are fast-rejected until the timer expires.
    Open,
    /// Recovery trial. One operation is allowed through to test health.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase string representation for logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Read-only snapshot of one key's circuit state.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub last_error: Option<String>,
    /// How long the circuit has been open, if it is.
    pub open_for: Option<Duration>,
}

/// Admission decision for one execution attempt.
enum Admission {
    Allowed,
    Probe,
    Rejected { retry_in: Duration },
}

/// Per-key circuit state. Guarded by a mutex in the keyed map; mutated
/// only while the lock is held, so no caller can observe a torn transition.
struct KeyState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    open_until: Option<Instant>,
    last_error: Option<String>,
    total_requests: u64,
    successful_requests: u64,
    probe_in_flight: bool,
}

impl KeyState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            open_until: None,
            last_error: None,
            total_requests: 0,
            successful_requests: 0,
            probe_in_flight: false,
        }
    }

    /// Decide whether an execution attempt may proceed.
    ///
    /// Counts the attempt and performs the lazy Open -> Half-Open
    /// transition once the timer has expired.
    fn admit(&mut self, key: &str, now: Instant) -> Admission {
        self.total_requests += 1;
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => match self.open_until {
                Some(until) if now >= until => {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = false;
                    debug!(key, "circuit entering half-open: open duration elapsed");
                    record_transition(key, CircuitState::HalfOpen);
                    self.try_probe()
                }
                Some(until) => Admission::Rejected {
                    retry_in: until.saturating_duration_since(now),
                },
                // Open without a deadline cannot be reached via execute();
                // treat as immediately retriable.
                None => Admission::Rejected {
                    retry_in: Duration::ZERO,
                },
            },
            CircuitState::HalfOpen => self.try_probe(),
        }
    }

    /// Claim the single half-open trial slot.
    fn try_probe(&mut self) -> Admission {
        if self.probe_in_flight {
            Admission::Rejected {
                retry_in: Duration::ZERO,
            }
        } else {
            self.probe_in_flight = true;
            Admission::Probe
        }
    }

    /// Successful invocation: reset failures and close the circuit.
    fn record_success(&mut self, key: &str) {
        self.successful_requests += 1;
        self.failure_count = 0;
        self.probe_in_flight = false;
        if self.state != CircuitState::Closed {
            info!(key, "circuit closed: trial succeeded");
            record_transition(key, CircuitState::Closed);
        }
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.open_until = None;
    }

    /// Transient failure: count it and trip or re-open as required.
    fn record_failure(&mut self, key: &str, error: &HeimdallError, config: &BreakerConfig) {
        self.last_error = Some(error.to_string());
        let now = Instant::now();
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= config.failure_threshold {
                    self.open(now, config.open_duration);
                    warn!(
                        key,
                        failure_count = self.failure_count,
                        last_error = %error,
                        "circuit opened: failure threshold reached"
                    );
                    record_transition(key, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.probe_in_flight = false;
                self.open(now, config.open_duration);
                warn!(key, last_error = %error, "circuit reopened: trial failed");
                record_transition(key, CircuitState::Open);
            }
            // Fast-rejects never reach here; a late failure racing a trip
            // does not count while the circuit is already open.
            CircuitState::Open => {}
        }
    }

    /// Non-transient outcome: the upstream answered, so a half-open trial
    /// resolves the circuit closed, but nothing is counted either way.
    fn record_untracked(&mut self, key: &str) {
        if self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
            self.state = CircuitState::Closed;
            self.opened_at = None;
            self.open_until = None;
            debug!(key, "circuit closed: trial resolved with non-transient error");
            record_transition(key, CircuitState::Closed);
        }
    }

    fn open(&mut self, now: Instant, duration: Duration) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.open_until = Some(now + duration);
    }
}

fn record_transition(key: &str, state: CircuitState) {
    metrics::counter!(telemetry::BREAKER_TRANSITIONS_TOTAL,
        "key" => key.to_owned(),
        "state" => state.as_str(),
    )
    .increment(1);
}

/// Per-key circuit breaker over arbitrary async operations.
///
/// State is created lazily on first use of a key and never removed;
/// [`reset`](Self::reset) returns a key to its initial values.
pub struct CircuitBreaker {
    states: DashMap<String, Mutex<KeyState>>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            states: DashMap::new(),
            config,
        }
    }

    /// Execute `op` under the circuit for `key`.
    ///
    /// While the circuit is open, `op` is never invoked and the call fails
    /// immediately with [`HeimdallError::CircuitOpen`]. Genuine errors from
    /// `op` propagate unchanged; transient ones count toward the failure
    /// threshold.
    pub async fn execute<T, F, Fut>(&self, key: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if key.is_empty() {
            return Err(HeimdallError::InvalidInput(
                "circuit key must not be empty".to_string(),
            ));
        }

        let admission = self.with_state(key, |state| state.admit(key, Instant::now()));

        match admission {
            Admission::Rejected { retry_in } => {
                metrics::counter!(telemetry::BREAKER_REJECTIONS_TOTAL, "key" => key.to_owned())
                    .increment(1);
                Err(HeimdallError::CircuitOpen {
                    key: key.to_string(),
                    retry_in,
                })
            }
            Admission::Allowed => {
                let result = op().await;
                self.resolve(key, &result);
                result
            }
            Admission::Probe => {
                // The guard re-opens the circuit if the trial future is
                // dropped mid-flight, so the probe slot can never stick.
                let guard = ProbeGuard::new(self, key);
                let result = op().await;
                guard.disarm();
                self.resolve(key, &result);
                result
            }
        }
    }

    /// Whether the circuit for `key` is open right now.
    ///
    /// Half-open (timer expired, trial pending) reads as not open.
    pub fn is_open(&self, key: &str) -> bool {
        self.states
            .get(key)
            .map(|entry| {
                let state = entry.lock().unwrap();
                state.state == CircuitState::Open
                    && state
                        .open_until
                        .is_some_and(|until| Instant::now() < until)
            })
            .unwrap_or(false)
    }

    /// Force the circuit for `key` back to its initial closed state.
    ///
    /// Safe to call concurrently with in-flight executions: they resolve
    /// against the fresh state without observing a torn transition.
    pub fn reset(&self, key: &str) {
        self.with_state(key, |state| *state = KeyState::new());
        debug!(key, "circuit reset");
    }

    /// Snapshot one key's state, if it has ever been used.
    pub fn snapshot(&self, key: &str) -> Option<BreakerSnapshot> {
        self.states.get(key).map(|entry| {
            let state = entry.lock().unwrap();
            Self::snapshot_of(key, &state)
        })
    }

    /// Snapshot all keys.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.states
            .iter()
            .map(|entry| {
                let state = entry.value().lock().unwrap();
                Self::snapshot_of(entry.key(), &state)
            })
            .collect()
    }

    fn snapshot_of(key: &str, state: &KeyState) -> BreakerSnapshot {
        BreakerSnapshot {
            key: key.to_string(),
            state: state.state,
            failure_count: state.failure_count,
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            last_error: state.last_error.clone(),
            open_for: state
                .opened_at
                .map(|at| Instant::now().saturating_duration_since(at)),
        }
    }

    /// Resolve an execution outcome against the key's state.
    fn resolve<T>(&self, key: &str, result: &Result<T>) {
        match result {
            Ok(_) => self.with_state(key, |state| state.record_success(key)),
            Err(e) if e.is_transient() => {
                self.with_state(key, |state| state.record_failure(key, e, &self.config))
            }
            Err(_) => self.with_state(key, |state| state.record_untracked(key)),
        }
    }

    /// Run a closure against the locked state for `key`, creating it on
    /// first use. The lock is released before this returns; callers never
    /// hold it across an await point.
    fn with_state<R>(&self, key: &str, f: impl FnOnce(&mut KeyState) -> R) -> R {
        let entry = self
            .states
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(KeyState::new()));
        let mut state = entry.lock().unwrap();
        f(&mut state)
    }

    /// Re-open the circuit after an abandoned trial.
    fn abandon_probe(&self, key: &str) {
        self.with_state(key, |state| {
            if state.state == CircuitState::HalfOpen && state.probe_in_flight {
                state.probe_in_flight = false;
                state.open(Instant::now(), self.config.open_duration);
                warn!(key, "circuit reopened: trial dropped without resolution");
                record_transition(key, CircuitState::Open);
            }
        });
    }
}

/// RAII guard ensuring a half-open trial is always resolved.
///
/// If the trial future is dropped (caller cancellation) before the outcome
/// is recorded, the drop re-opens the circuit instead of leaving the probe
/// slot claimed forever.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    key: &'a str,
    armed: bool,
}

impl<'a> ProbeGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, key: &'a str) -> Self {
        Self {
            breaker,
            key,
            armed: true,
        }
    }

    /// The trial ran to an outcome; normal resolution takes over.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_probe(self.key);
        }
    }
}

// ============================================================================
// GuardedClient
// ============================================================================

/// Decorator that routes a [`CompletionClient`] through a [`CircuitBreaker`].
///
/// Unary dispatch and stream acquisition are tracked under separate keys
/// (`{provider}:completion` and `{provider}:stream`) so a broken streaming
/// endpoint does not take down unary traffic, and vice versa.
pub struct GuardedClient {
    inner: Arc<dyn CompletionClient>,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedClient {
    /// Wrap a completion client with circuit-breaker protection.
    pub fn new(inner: Arc<dyn CompletionClient>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    fn key(&self, operation: &str) -> String {
        format!("{}:{}", self.inner.name(), operation)
    }
}

#[async_trait]
impl CompletionClient for GuardedClient {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send_completion(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        self.breaker
            .execute(&self.key("completion"), || self.inner.send_completion(request))
            .await
    }

    async fn open_completion_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<ProviderEventStream> {
        // Guards only the acquisition; mid-stream failures are the
        // streaming transform's concern.
        self.breaker
            .execute(&self.key("stream"), || {
                self.inner.open_completion_stream(request)
            })
            .await
    }
}

// ============================================================================
// Tests
// ============================================================================
