//! Circuit breaker for volatile calls inside job processors.
//!
//! Wraps any async operation (enrichment provider, scoring model, mail
//! gateway) so that a failing dependency sheds load instead of burning
//! job attempts against it.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through normally
    Closed,
    /// Calls are rejected without invoking the operation
    Open,
    /// A single probe call is allowed to test recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// State transition notifications, broadcast to interested observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitEvent {
    Open,
    HalfOpen,
    Close,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Timeout applied to each wrapped call; elapsing counts as a failure
    pub call_timeout: Duration,
    /// Failure ratio over the rolling window that opens the circuit (0..=1)
    pub error_threshold: f64,
    /// Time to wait in Open before allowing a probe
    pub reset_timeout: Duration,
    /// Rolling window over which the failure ratio is computed
    pub window: Duration,
    /// Minimum calls in the window before the ratio is evaluated
    pub min_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            error_threshold: 0.5,
            reset_timeout: Duration::from_secs(30),
            window: Duration::from_secs(60),
            min_requests: 5,
        }
    }
}

/// Error surfaced by [`CircuitBreaker::fire`].
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// Circuit is open; the operation was not invoked
    #[error("circuit open, call rejected")]
    Rejected,

    /// The operation exceeded the configured call timeout
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The operation itself failed
    #[error("{0}")]
    Inner(E),
}

struct BreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
    // (timestamp, success) for the rolling window
    window: Vec<(Instant, bool)>,
    probe_in_flight: bool,
}

/// Releases the half-open probe slot if the guarded call is dropped
/// before it resolves, so a cancelled probe cannot wedge the breaker.
struct ProbeGuard {
    state: Arc<Mutex<BreakerState>>,
    armed: bool,
}

impl ProbeGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().probe_in_flight = false;
        }
    }
}

/// Thread-safe circuit breaker; clone to share across tasks.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<BreakerState>>,
    events: broadcast::Sender<CircuitEvent>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            name: name.into().into(),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                opened_at: None,
                window: Vec::new(),
                probe_in_flight: false,
            })),
            events,
        }
    }

    pub fn builder(name: impl Into<String>) -> CircuitBreakerBuilder {
        CircuitBreakerBuilder {
            name: name.into(),
            config: CircuitBreakerConfig::default(),
        }
    }

    /// Current state, advancing Open to HalfOpen if the reset timeout has
    /// elapsed.
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock();
        self.advance(&mut state);
        state.state
    }

    /// Subscribe to state transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }

    /// Run `operation` through the breaker.
    ///
    /// While Open, returns `CircuitError::Rejected` without invoking the
    /// operation. In HalfOpen exactly one in-flight probe is allowed;
    /// concurrent callers are rejected until it resolves.
    pub async fn fire<F, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let mut guard = self.try_acquire().ok_or(CircuitError::<E>::Rejected)?;

        let result = tokio::time::timeout(self.config.call_timeout, operation).await;
        // record() owns the probe slot from here on
        if let Some(guard) = guard.as_mut() {
            guard.disarm();
        }
        match result {
            Ok(Ok(value)) => {
                self.record(true);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record(false);
                Err(CircuitError::Inner(e))
            }
            Err(_) => {
                self.record(false);
                Err(CircuitError::Timeout(self.config.call_timeout))
            }
        }
    }

    /// Like [`fire`](Self::fire), but circuit-open rejections are satisfied
    /// from `fallback` instead of surfacing an error. Operation failures
    /// and timeouts still propagate.
    pub async fn fire_with_fallback<F, T, E, FB>(
        &self,
        operation: F,
        fallback: FB,
    ) -> Result<T, CircuitError<E>>
    where
        F: Future<Output = Result<T, E>>,
        FB: FnOnce() -> T,
    {
        match self.fire(operation).await {
            Err(CircuitError::Rejected) => Ok(fallback()),
            other => other,
        }
    }

    /// Admission check. `None` means rejected; a `ProbeGuard` is handed
    /// out when this call holds the single half-open probe slot.
    fn try_acquire(&self) -> Option<Option<ProbeGuard>> {
        let mut state = self.state.lock();
        self.advance(&mut state);

        match state.state {
            CircuitState::Closed => Some(None),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    None
                } else {
                    state.probe_in_flight = true;
                    Some(Some(ProbeGuard {
                        state: Arc::clone(&self.state),
                        armed: true,
                    }))
                }
            }
        }
    }

    fn record(&self, success: bool) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.window.push((now, success));
        let cutoff = now - self.config.window;
        state.window.retain(|(at, _)| *at > cutoff);

        match state.state {
            CircuitState::HalfOpen => {
                state.probe_in_flight = false;
                if success {
                    self.transition(&mut state, CircuitState::Closed, CircuitEvent::Close);
                } else {
                    self.transition(&mut state, CircuitState::Open, CircuitEvent::Open);
                }
            }
            CircuitState::Closed => {
                if !success && self.should_open(&state) {
                    self.transition(&mut state, CircuitState::Open, CircuitEvent::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn should_open(&self, state: &BreakerState) -> bool {
        let total = state.window.len() as u32;
        if total < self.config.min_requests {
            return false;
        }
        let failures = state.window.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / total as f64 >= self.config.error_threshold
    }

    fn advance(&self, state: &mut BreakerState) {
        if state.state == CircuitState::Open {
            let elapsed = state
                .opened_at
                .map(|at| at.elapsed() >= self.config.reset_timeout)
                .unwrap_or(true);
            if elapsed {
                self.transition(state, CircuitState::HalfOpen, CircuitEvent::HalfOpen);
            }
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState, event: CircuitEvent) {
        state.state = to;
        match to {
            CircuitState::Open => {
                state.opened_at = Some(Instant::now());
                warn!(breaker = %self.name, "circuit opened");
            }
            CircuitState::HalfOpen => {
                state.probe_in_flight = false;
                info!(breaker = %self.name, "circuit half-open, probing");
            }
            CircuitState::Closed => {
                state.opened_at = None;
                state.window.clear();
                info!(breaker = %self.name, "circuit closed");
            }
        }
        let _ = self.events.send(event);
    }
}

/// Builder for a configured breaker.
pub struct CircuitBreakerBuilder {
    name: String,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerBuilder {
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    pub fn error_threshold(mut self, threshold: f64) -> Self {
        self.config.error_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    pub fn min_requests(mut self, min: u32) -> Self {
        self.config.min_requests = min;
        self
    }

    pub fn build(self) -> CircuitBreaker {
        CircuitBreaker::new(self.name, self.config)
    }
}
