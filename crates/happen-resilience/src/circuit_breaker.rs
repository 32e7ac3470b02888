use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// The circuit breaker's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through to the underlying action.
    Closed,
    /// Calls fail fast until `next_attempt` elapses.
    Open,
    /// A single probe call is allowed through to decide whether to close.
    HalfOpen,
}

/// Thresholds governing state transitions.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (while closed) before tripping to `open`.
    pub failure_threshold: u32,
    /// Consecutive successes (while half-open) before closing.
    pub success_threshold: u32,
    /// How long `open` lasts before a probe call is allowed.
    pub timeout: Duration,
}

/// What [`CircuitBreaker::call`] can fail with.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E: std::fmt::Display + std::fmt::Debug> {
    /// The circuit is open and not yet due for a probe attempt.
    #[error("circuit open")]
    Open,
    /// The wrapped action itself failed.
    #[error("{0}")]
    Inner(E),
}

struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    next_attempt: Option<Instant>,
}

/// Wraps an async action, tripping to `open` after too many consecutive
/// failures and probing for recovery after a cooldown.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Build a breaker, starting `closed`.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                next_attempt: None,
            }),
        }
    }

    /// Current state, for diagnostics/metrics.
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Run `action` under the breaker's protection. Callers that want a
    /// fallback on [`CircuitError::Open`] compose it themselves, e.g. via
    /// [`crate::with_fallback`] around this call.
    pub async fn call<F, Fut, T, E>(&self, action: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display + std::fmt::Debug,
    {
        {
            let mut guard = self.inner.lock().await;
            match guard.state {
                CircuitState::Open => {
                    let now = Instant::now();
                    if guard.next_attempt.map(|t| now < t).unwrap_or(true) {
                        return Err(CircuitError::Open);
                    }
                    guard.state = CircuitState::HalfOpen;
                    guard.successes = 0;
                    tracing::debug!("circuit breaker transitioning open -> half-open");
                }
                CircuitState::Closed | CircuitState::HalfOpen => {}
            }
        }

        match action().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(err) => {
                self.on_failure().await;
                Err(CircuitError::Inner(err))
            }
        }
    }

    async fn on_success(&self) {
        let mut guard = self.inner.lock().await;
        guard.failures = 0;
        if guard.state == CircuitState::HalfOpen {
            guard.successes += 1;
            if guard.successes >= self.config.success_threshold.max(1) {
                guard.state = CircuitState::Closed;
                guard.successes = 0;
                tracing::debug!("circuit breaker closing after successful probes");
            }
        }
    }

    async fn on_failure(&self) {
        let mut guard = self.inner.lock().await;
        if guard.state == CircuitState::HalfOpen {
            guard.state = CircuitState::Open;
            guard.next_attempt = Some(Instant::now() + self.config.timeout);
            tracing::debug!("circuit breaker probe failed, reopening");
            return;
        }
        guard.failures += 1;
        if guard.failures >= self.config.failure_threshold.max(1) {
            guard.state = CircuitState::Open;
            guard.next_attempt = Some(Instant::now() + self.config.timeout);
            tracing::debug!(failures = guard.failures, "circuit breaker tripped open");
        }
    }
}
