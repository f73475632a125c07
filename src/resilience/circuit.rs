//! Circuit breaker implementation for fault tolerance
//!
//! This module implements a circuit breaker pattern with three states:
//! - Closed: Normal operation, calls are allowed
//! - Open: The dependency is failing, calls are rejected without running
//! - HalfOpen: Testing recovery, calls run as trials
//!
//! Failures are counted over a sliding window. Reaching the threshold opens
//! the circuit; once `reset_timeout` has passed the next call runs as a trial,
//! and enough consecutive trial successes close it again.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls are allowed
    Closed,

    /// Dependency has failed - calls are rejected
    Open,

    /// Testing recovery - calls run as trials
    HalfOpen,
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that open the circuit
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,

    /// How long the circuit stays open before a trial call is let through
    pub reset_timeout: Duration,

    /// Sliding window for counting failures
    pub failure_count_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            failure_count_window: Duration::from_secs(60),
        }
    }
}

/// State transitions, emitted once per transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CircuitEvent {
    Opened { operation: String, failures: u32 },
    HalfOpened { operation: String },
    Closed { operation: String },
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,

    /// Calls admitted or rejected
    pub total_calls: u64,

    pub total_successes: u64,

    pub total_failures: u64,

    /// Calls rejected while open
    pub rejected_calls: u64,

    /// Number of times the circuit has opened
    pub open_count: u64,

    /// Failures currently inside the sliding window
    pub failures_in_window: usize,

    /// Time since last state transition
    pub time_in_state: Duration,
}

struct CircuitInner {
    state: CircuitState,

    /// Set while open; the reset timer runs from here
    opened_at: Option<Instant>,

    half_open_successes: u32,

    /// Failure timestamps, oldest first
    recent_failures: VecDeque<Instant>,

    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
    open_count: u64,

    last_transition: Instant,
}

impl CircuitInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            half_open_successes: 0,
            recent_failures: VecDeque::new(),
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
            open_count: 0,
            last_transition: Instant::now(),
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.recent_failures.front() {
            if now.duration_since(oldest) < window {
                break;
            }
            self.recent_failures.pop_front();
        }
    }

    /// Time left before a trial call is allowed, zero once it is due
    fn retry_in(&self, reset_timeout: Duration) -> Duration {
        self.opened_at
            .map(|at| reset_timeout.saturating_sub(at.elapsed()))
            .unwrap_or_default()
    }
}

/// Circuit breaker guarding one named operation
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
    events: broadcast::Sender<CircuitEvent>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(CircuitInner::new()),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: CircuitEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }

    /// Run `operation` through the breaker
    ///
    /// While open, fails with [`Error::CircuitOpen`] without calling
    /// `operation`. Every error returned by `operation` counts as one failure.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.check_call()?;

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }

    /// Admit or reject one call
    fn check_call(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.total_calls += 1;

        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let retry_in = inner.retry_in(self.config.reset_timeout);
        if retry_in.is_zero() {
            info!(operation = %self.name, "Circuit transitioning from Open to HalfOpen");
            self.transition_to_half_open(&mut inner);
            return Ok(());
        }

        inner.rejected_calls += 1;
        debug!(
            operation = %self.name,
            retry_in_ms = retry_in.as_millis() as u64,
            "Rejecting call while circuit is open"
        );
        Err(Error::CircuitOpen {
            operation: self.name.clone(),
            retry_in,
        })
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.total_successes += 1;

        match inner.state {
            CircuitState::Closed => {}

            CircuitState::Open => {
                // A call admitted before the circuit opened
                debug!(operation = %self.name, "Ignoring success recorded while open");
            }

            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                debug!(
                    operation = %self.name,
                    successes = inner.half_open_successes,
                    threshold = self.config.success_threshold,
                    "Trial call succeeded"
                );

                if inner.half_open_successes >= self.config.success_threshold {
                    info!(operation = %self.name, "Circuit transitioning from HalfOpen to Closed");
                    self.transition_to_closed(&mut inner);
                }
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.total_failures += 1;

        let now = Instant::now();
        inner.recent_failures.push_back(now);
        inner.prune(now, self.config.failure_count_window);

        match inner.state {
            CircuitState::Closed => {
                let failures = inner.recent_failures.len() as u32;
                debug!(
                    operation = %self.name,
                    failures,
                    threshold = self.config.failure_threshold,
                    "Call failed while closed"
                );

                if failures >= self.config.failure_threshold {
                    warn!(operation = %self.name, failures, "Circuit transitioning from Closed to Open");
                    self.transition_to_open(&mut inner);
                }
            }

            CircuitState::Open => {
                debug!(operation = %self.name, "Ignoring failure recorded while open");
            }

            CircuitState::HalfOpen => {
                warn!(operation = %self.name, "Trial call failed - reopening circuit");
                self.transition_to_open(&mut inner);
            }
        }
    }

    /// Force the circuit closed and clear its counters
    pub fn reset(&self) {
        let mut inner = self.lock();
        info!(operation = %self.name, "Manually resetting circuit to Closed");
        self.transition_to_closed(&mut inner);
    }

    /// Force the circuit open, e.g. for maintenance
    pub fn open(&self) {
        let mut inner = self.lock();
        info!(operation = %self.name, "Manually opening circuit");
        self.transition_to_open(&mut inner);
    }

    /// Current state
    ///
    /// An open circuit whose reset timeout has passed reports `HalfOpen`,
    /// since that is what the next call will see.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        self.visible_state(&inner)
    }

    fn visible_state(&self, inner: &CircuitInner) -> CircuitState {
        if inner.state == CircuitState::Open && inner.retry_in(self.config.reset_timeout).is_zero() {
            CircuitState::HalfOpen
        } else {
            inner.state
        }
    }

    /// Get statistics for this circuit
    pub fn stats(&self) -> CircuitStats {
        let mut inner = self.lock();
        inner.prune(Instant::now(), self.config.failure_count_window);

        CircuitStats {
            state: self.visible_state(&inner),
            total_calls: inner.total_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
            open_count: inner.open_count,
            failures_in_window: inner.recent_failures.len(),
            time_in_state: inner.last_transition.elapsed(),
        }
    }

    fn transition_to_closed(&self, inner: &mut CircuitInner) {
        let was = inner.state;
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.half_open_successes = 0;
        inner.recent_failures.clear();
        inner.last_transition = Instant::now();

        if was != CircuitState::Closed {
            self.emit(CircuitEvent::Closed {
                operation: self.name.clone(),
            });
        }
    }

    fn transition_to_open(&self, inner: &mut CircuitInner) {
        let was = inner.state;
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_successes = 0;
        inner.last_transition = Instant::now();

        if was != CircuitState::Open {
            inner.open_count += 1;
            self.emit(CircuitEvent::Opened {
                operation: self.name.clone(),
                failures: inner.recent_failures.len() as u32,
            });
        }
    }

    fn transition_to_half_open(&self, inner: &mut CircuitInner) {
        inner.state = CircuitState::HalfOpen;
        inner.half_open_successes = 0;
        inner.last_transition = Instant::now();

        self.emit(CircuitEvent::HalfOpened {
            operation: self.name.clone(),
        });
    }
}
