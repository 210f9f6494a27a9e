//! Circuit breaker guarding calls to an external dependency.
//!
//! ```text
//! CLOSED ──(failure_threshold consecutive failures)──► OPEN
//!   ▲                                                   │
//!   │                                     (reset_timeout elapsed)
//!   │                                                   ▼
//!   └──(half_open_requests consecutive successes)── HALF_OPEN
//!                                                       │
//!                         OPEN ◄──(any failure)─────────┘
//! ```
//!
//! While HALF_OPEN at most `half_open_requests` trial calls are in flight at once.

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the circuit stays open before admitting trial calls
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Trial calls allowed while half-open, and successes needed to close
    #[serde(default = "default_half_open_requests")]
    pub half_open_requests: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

fn default_half_open_requests() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_requests: default_half_open_requests(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned without calling the dependency while the circuit rejects calls.
#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit '{name}' is open")]
pub struct CircuitOpenError {
    pub name: String,
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_in_flight: u32,
    pub millis_since_last_failure: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    half_open_in_flight: u32,
    /// Bumped on every transition into HALF_OPEN so late completions from an
    /// earlier trial round cannot touch the current round's counters.
    generation: u64,
}

/// How a call was admitted.
#[derive(Debug, Clone, Copy)]
enum Admission {
    Closed,
    HalfOpen { generation: u64 },
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                half_open_in_flight: 0,
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call made now would be admitted. Does not change state.
    pub fn would_admit(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner
                .last_failure
                .is_none_or(|at| at.elapsed() >= self.config.reset_timeout()),
            CircuitState::HalfOpen => inner.half_open_in_flight < self.config.half_open_requests,
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_in_flight: inner.half_open_in_flight,
            millis_since_last_failure: inner
                .last_failure
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }

    /// Force the breaker back to CLOSED.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_in_flight = 0;
        inner.last_failure = None;
    }

    /// Run `f` through the breaker.
    ///
    /// Every `Err` from `f` counts as a failure. A rejected call returns
    /// `E::from(CircuitOpenError)` without invoking `f`.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        let mut permit = self.admit()?;
        let result = f().await;
        match &result {
            Ok(_) => self.on_success(permit.admission),
            Err(_) => self.on_failure(permit.admission),
        }
        permit.settled = true;
        result
    }

    fn admit(&self) -> Result<Permit<'_>, CircuitOpenError> {
        let mut inner = self.inner.lock();
        let admission = match inner.state {
            CircuitState::Closed => Admission::Closed,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .is_none_or(|at| at.elapsed() >= self.config.reset_timeout());
                if !elapsed {
                    drop(inner);
                    return Err(self.rejected());
                }
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                inner.half_open_in_flight = 1;
                inner.generation += 1;
                tracing::info!(breaker = %self.name, "Circuit half-open, admitting trial calls");
                crate::metrics::record_circuit_transition(
                    &self.name,
                    CircuitState::HalfOpen.as_str(),
                );
                Admission::HalfOpen {
                    generation: inner.generation,
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_requests {
                    drop(inner);
                    return Err(self.rejected());
                }
                inner.half_open_in_flight += 1;
                Admission::HalfOpen {
                    generation: inner.generation,
                }
            }
        };

        Ok(Permit {
            breaker: self,
            admission,
            settled: false,
        })
    }

    fn rejected(&self) -> CircuitOpenError {
        crate::metrics::record_circuit_rejection(&self.name);
        CircuitOpenError {
            name: self.name.clone(),
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;

        if let Admission::HalfOpen { generation } = admission
            && inner.state == CircuitState::HalfOpen
            && inner.generation == generation
        {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            if inner.success_count + 1 >= self.config.half_open_requests {
                inner.state = CircuitState::Closed;
                inner.success_count = 0;
                inner.half_open_in_flight = 0;
                tracing::info!(breaker = %self.name, "Circuit closed");
                crate::metrics::record_circuit_transition(
                    &self.name,
                    CircuitState::Closed.as_str(),
                );
            } else {
                inner.success_count += 1;
            }
        }
    }

    fn on_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            inner.last_failure = Some(Instant::now());
        }

        match (inner.state, admission) {
            (CircuitState::HalfOpen, Admission::HalfOpen { generation })
                if inner.generation == generation =>
            {
                self.open(&mut inner);
            }
            (CircuitState::Closed, _) => {
                if inner.failure_count + 1 >= self.config.failure_threshold {
                    self.open(&mut inner);
                } else {
                    inner.failure_count += 1;
                }
            }
            // Stale completion from a call admitted under an earlier state.
            _ => {}
        }
    }

    fn open(&self, inner: &mut Inner) {
        let from = inner.state;
        inner.state = CircuitState::Open;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_in_flight = 0;
        tracing::warn!(
            breaker = %self.name,
            from = %from,
            reset_timeout_ms = self.config.reset_timeout_ms,
            "Circuit opened"
        );
        crate::metrics::record_circuit_transition(&self.name, CircuitState::Open.as_str());
    }

    /// Free a half-open slot held by a call that never completed.
    fn abandon(&self, admission: Admission) {
        if let Admission::HalfOpen { generation } = admission {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::HalfOpen && inner.generation == generation {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .field("success_count", &inner.success_count)
            .finish()
    }
}

/// Admission ticket; releases its half-open slot if the call is dropped.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon(self.admission);
        }
    }
}
