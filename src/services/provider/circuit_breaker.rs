//! Per-provider circuit breaker.
//!
//! Three states: Closed (calls flow, outcomes recorded in a rolling window),
//! Open (calls fail fast until the cooldown elapses) and HalfOpen (exactly one
//! trial call; success closes the circuit, failure reopens it with a fresh
//! cooldown).
//!
//! State lives in the worker process. Separate worker processes each keep
//! their own breaker.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - a single trial call is allowed
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of most recent calls considered when computing the failure rate.
    pub window_size: usize,
    /// Failure rate (0.0-1.0) over a full window at which the circuit opens.
    pub failure_rate_threshold: f64,
    /// How long the circuit stays open before allowing a trial call.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            failure_rate_threshold: 0.5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Returned by [`CircuitBreaker::try_acquire`] while calls are being shed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker is open")]
pub struct CircuitOpen;

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// `true` for failure, newest at the back.
    outcomes: VecDeque<bool>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            window_size = config.window_size,
            failure_rate_threshold = config.failure_rate_threshold,
            cooldown_ms = config.cooldown.as_millis() as u64,
            "Circuit breaker initialized"
        );

        Self {
            name,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                outcomes: VecDeque::with_capacity(config.window_size),
                opened_at: None,
                trial_in_flight: false,
            }),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask permission for one call. Every `Ok` must be followed by exactly one
    /// `record_success` or `record_failure`.
    pub fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.config.cooldown);
                if !cooled_down {
                    return Err(CircuitOpen);
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                info!(component = %self.name, "Circuit breaker half-open (trial call)");
                Ok(())
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(CircuitOpen)
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.outcomes.clear();
                inner.opened_at = None;
                inner.trial_in_flight = false;
                info!(component = %self.name, "Circuit breaker closed (recovered)");
            }
            CircuitState::Closed => self.push_outcome(&mut inner, false),
            CircuitState::Open => {
                warn!(component = %self.name, "Success recorded while circuit is open");
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                self.open(&mut inner);
            }
            CircuitState::Closed => self.push_outcome(&mut inner, true),
            CircuitState::Open => {}
        }
    }

    /// Record a Closed-state outcome and open once a full window crosses the threshold.
    fn push_outcome(&self, inner: &mut BreakerInner, failed: bool) {
        let window = self.config.window_size.max(1);
        if inner.outcomes.len() >= window {
            inner.outcomes.pop_front();
        }
        inner.outcomes.push_back(failed);

        if inner.outcomes.len() >= window
            && failure_rate(&inner.outcomes) >= self.config.failure_rate_threshold
        {
            self.open(inner);
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        let rate = failure_rate(&inner.outcomes);
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        metrics::counter!("pipeline_circuit_open_total", "provider" => self.name.clone())
            .increment(1);
        error!(
            component = %self.name,
            failure_rate = rate,
            cooldown_ms = self.config.cooldown.as_millis() as u64,
            "Circuit breaker opened (failing fast)"
        );
    }
}

fn failure_rate(outcomes: &VecDeque<bool>) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    outcomes.iter().filter(|failed| **failed).count() as f64 / outcomes.len() as f64
}
