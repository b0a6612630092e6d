/// Circuit Breaker guarding per-request engine calls
///
/// State transitions:
/// - Closed → Open: when consecutive failures reach `failure_threshold`
/// - Open → HalfOpen: on the first call after `cooldown` has elapsed; that call
///   is the single trial call
/// - HalfOpen → Closed: when the trial call succeeds
/// - HalfOpen → Open: when the trial call fails
///
/// While a trial is in flight every other caller is rejected as if the circuit
/// were still open.
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Circuit is open, requests fail fast
    Open,
    /// Cooldown elapsed, exactly one trial request is admitted
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failure count to trigger circuit open
    pub failure_threshold: u32,
    /// Duration to wait before admitting a trial call
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open - failing fast")]
    Open,
    #[error("Call failed: {0}")]
    CallFailed(E),
}

#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
}

struct BreakerState {
    current: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerState {
    fn trip(&mut self) {
        self.current = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.trial_in_flight = false;
    }
}

/// Admission ticket for one call through the breaker.
///
/// The holder reports the outcome with [`BreakerPermit::record_success`] or
/// [`BreakerPermit::record_failure`]. Dropping an unsettled trial permit (for
/// example when the request future is cancelled) frees the trial slot without
/// counting a result.
pub struct BreakerPermit {
    state: Arc<Mutex<BreakerState>>,
    failure_threshold: u32,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    /// Whether this permit is the half-open trial call
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        let mut state = self.state.lock();

        if self.trial {
            info!("Circuit breaker: HalfOpen → Closed (trial call succeeded)");
            state.current = CircuitState::Closed;
            state.consecutive_failures = 0;
            state.opened_at = None;
            state.trial_in_flight = false;
        } else if state.current == CircuitState::Closed {
            state.consecutive_failures = 0;
        }
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        let mut state = self.state.lock();

        if self.trial {
            warn!("Circuit breaker: HalfOpen → Open (trial call failed)");
            state.trip();
            return;
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.current == CircuitState::Closed
            && state.consecutive_failures >= self.failure_threshold
        {
            warn!(
                consecutive_failures = state.consecutive_failures,
                "Circuit breaker: Closed → Open"
            );
            state.trip();
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.settled || !self.trial {
            return;
        }
        let mut state = self.state.lock();
        if state.current == CircuitState::HalfOpen {
            debug!("Circuit breaker: trial permit dropped without outcome, slot released");
            state.trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BreakerState {
                current: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            })),
            config,
        }
    }

    /// Ask for admission. `None` means the call must be rejected without
    /// being attempted.
    pub fn try_acquire(&self) -> Option<BreakerPermit> {
        let mut state = self.state.lock();

        let trial = match state.current {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled_down = state
                    .opened_at
                    .map(|opened_at| opened_at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if !cooled_down {
                    return None;
                }
                info!("Circuit breaker: Open → HalfOpen");
                state.current = CircuitState::HalfOpen;
                state.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    return None;
                }
                state.trial_in_flight = true;
                true
            }
        };

        Some(BreakerPermit {
            state: Arc::clone(&self.state),
            failure_threshold: self.config.failure_threshold,
            trial,
            settled: false,
        })
    }

    /// Execute a future with circuit breaker protection
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().ok_or(CircuitBreakerError::Open)?;

        match f().await {
            Ok(result) => {
                permit.record_success();
                Ok(result)
            }
            Err(e) => {
                permit.record_failure();
                Err(CircuitBreakerError::CallFailed(e))
            }
        }
    }

    /// Get current circuit state (for monitoring)
    pub fn state(&self) -> CircuitState {
        self.state.lock().current
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}
