//! Circuit breaker
//!
//! ```text
//! Closed --(failures >= threshold)--> Open --(reset timeout)--> HalfOpen
//!   ^                                  ^                           |
//!   |                                  +------(trial fails)--------+
//!   +-----------------------(trial succeeds)-----------------------+
//! ```
//!
//! The Open → HalfOpen transition is driven twice: by a timer task spawned
//! on trip, and lazily by any state query once the timeout has elapsed, so a
//! breaker without a running timer still recovers.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use avatar_config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
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

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_max_attempts: u32,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self::from(&BreakerConfig::default())
    }
}

impl From<&BreakerConfig> for BreakerPolicy {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            half_open_max_attempts: config.half_open_max_attempts.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u64,
    pub last_failure: Option<DateTime<Utc>>,
    pub half_open_attempts: u32,
}

#[derive(Error, Debug)]
pub enum BreakerError<E> {
    /// The call was rejected without running
    #[error("circuit breaker '{}' is open", .0.name)]
    Open(BreakerStats),

    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open(_))
    }
}

/// Called with `(new, old, stats)` on every transition
pub type StateObserver = Arc<dyn Fn(CircuitState, CircuitState, &BreakerStats) + Send + Sync>;

type Transition = (CircuitState, CircuitState, BreakerStats);

struct Core {
    state: CircuitState,
    failures: u32,
    successes: u64,
    half_open_attempts: u32,
    last_failure: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    reset_timer: Option<JoinHandle<()>>,
    /// Bumped on every trip so a stale timer cannot half-open a newer trip
    trip_generation: u64,
}

struct Inner {
    name: String,
    policy: BreakerPolicy,
    core: Mutex<Core>,
    observer: Mutex<Option<StateObserver>>,
}

/// Shared circuit breaker; clones refer to the same breaker
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, policy: BreakerPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                policy,
                core: Mutex::new(Core {
                    state: CircuitState::Closed,
                    failures: 0,
                    successes: 0,
                    half_open_attempts: 0,
                    last_failure: None,
                    opened_at: None,
                    reset_timer: None,
                    trip_generation: 0,
                }),
                observer: Mutex::new(None),
            }),
        }
    }

    /// Install the transition observer, replacing any previous one
    pub fn set_observer<F>(&self, observer: F)
    where
        F: Fn(CircuitState, CircuitState, &BreakerStats) + Send + Sync + 'static,
    {
        *self.inner.observer.lock() = Some(Arc::new(observer));
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.inner.policy
    }

    /// Run `op` through the breaker
    ///
    /// Fails fast with [`BreakerError::Open`] while open, or once the
    /// half-open trial budget is spent.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let slot = self.before_call().map_err(BreakerError::Open)?;
        let mut guard = HalfOpenSlot {
            breaker: self,
            trip_generation: slot,
        };

        let result = op().await;
        guard.trip_generation = None;
        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// True unless the breaker is open
    pub fn is_allowed(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut core = self.inner.core.lock();
            let transition = self.check_reset(&mut core);
            (core.state, transition)
        };
        self.notify(transition);
        state
    }

    pub fn stats(&self) -> BreakerStats {
        let (stats, transition) = {
            let mut core = self.inner.core.lock();
            let transition = self.check_reset(&mut core);
            (self.snapshot(&core), transition)
        };
        self.notify(transition);
        stats
    }

    /// Close the breaker and clear its counters
    pub fn force_reset(&self) {
        let transition = {
            let mut core = self.inner.core.lock();
            self.close(&mut core)
        };
        tracing::info!(breaker = %self.inner.name, "Circuit breaker force reset");
        self.notify(transition);
    }

    /// Trip the breaker immediately
    pub fn force_open(&self) {
        let transition = {
            let mut core = self.inner.core.lock();
            self.trip(&mut core)
        };
        self.notify(transition);
    }

    /// Cancel the reset timer and drop the observer
    ///
    /// The breaker keeps answering queries; recovery then happens lazily.
    pub fn destroy(&self) {
        if let Some(timer) = self.inner.core.lock().reset_timer.take() {
            timer.abort();
        }
        self.inner.observer.lock().take();
    }

    /// Admit a call; `Ok(Some(generation))` when it took a half-open slot
    fn before_call(&self) -> Result<Option<u64>, BreakerStats> {
        let (result, transitions) = {
            let mut core = self.inner.core.lock();
            let mut transitions = vec![self.check_reset(&mut core)];

            let result = match core.state {
                CircuitState::Closed => Ok(None),
                CircuitState::Open => Err(self.snapshot(&core)),
                CircuitState::HalfOpen => {
                    core.half_open_attempts += 1;
                    if core.half_open_attempts > self.inner.policy.half_open_max_attempts {
                        transitions.push(self.trip(&mut core));
                        Err(self.snapshot(&core))
                    } else {
                        Ok(Some(core.trip_generation))
                    }
                }
            };
            (result, transitions)
        };

        for transition in transitions {
            self.notify(transition);
        }
        if result.is_err() {
            tracing::debug!(breaker = %self.inner.name, "Call rejected, circuit open");
        }
        result
    }

    /// Give back a half-open slot whose call was dropped before finishing
    fn release_half_open(&self, trip_generation: u64) {
        let mut core = self.inner.core.lock();
        if core.state == CircuitState::HalfOpen && core.trip_generation == trip_generation {
            core.half_open_attempts = core.half_open_attempts.saturating_sub(1);
            tracing::debug!(breaker = %self.inner.name, "Half-open call cancelled, slot released");
        }
    }

    fn record_success(&self) {
        let transition = {
            let mut core = self.inner.core.lock();
            core.successes += 1;
            match core.state {
                CircuitState::HalfOpen => self.close(&mut core),
                _ => {
                    core.failures = core.failures.saturating_sub(1);
                    None
                }
            }
        };
        self.notify(transition);
    }

    fn record_failure(&self) {
        let transition = {
            let mut core = self.inner.core.lock();
            core.failures += 1;
            core.last_failure = Some(Utc::now());

            let should_trip = core.state == CircuitState::HalfOpen
                || core.failures >= self.inner.policy.failure_threshold;
            if should_trip && core.state != CircuitState::Open {
                self.trip(&mut core)
            } else {
                None
            }
        };
        self.notify(transition);
    }

    fn trip(&self, core: &mut Core) -> Option<Transition> {
        let old = core.state;
        core.state = CircuitState::Open;
        core.half_open_attempts = 0;
        core.opened_at = Some(Instant::now());
        core.trip_generation += 1;
        self.schedule_half_open(core);

        tracing::warn!(
            breaker = %self.inner.name,
            failures = core.failures,
            reset_after_ms = self.inner.policy.reset_timeout.as_millis() as u64,
            "Circuit breaker opened"
        );
        (old != CircuitState::Open).then(|| (CircuitState::Open, old, self.snapshot(core)))
    }

    fn close(&self, core: &mut Core) -> Option<Transition> {
        let old = core.state;
        core.state = CircuitState::Closed;
        core.failures = 0;
        core.half_open_attempts = 0;
        core.opened_at = None;
        if let Some(timer) = core.reset_timer.take() {
            timer.abort();
        }
        if old != CircuitState::Closed {
            tracing::info!(breaker = %self.inner.name, from = %old, "Circuit breaker closed");
        }
        (old != CircuitState::Closed).then(|| (CircuitState::Closed, old, self.snapshot(core)))
    }

    fn check_reset(&self, core: &mut Core) -> Option<Transition> {
        if core.state != CircuitState::Open {
            return None;
        }
        let elapsed = core.opened_at.map(|at| at.elapsed())?;
        if elapsed < self.inner.policy.reset_timeout {
            return None;
        }
        Some(self.half_open(core))
    }

    fn half_open(&self, core: &mut Core) -> Transition {
        let old = core.state;
        core.state = CircuitState::HalfOpen;
        core.half_open_attempts = 0;
        if let Some(timer) = core.reset_timer.take() {
            timer.abort();
        }
        tracing::info!(breaker = %self.inner.name, "Circuit breaker half-open");
        (CircuitState::HalfOpen, old, self.snapshot(core))
    }

    fn schedule_half_open(&self, core: &mut Core) {
        if let Some(timer) = core.reset_timer.take() {
            timer.abort();
        }
        // outside a runtime the lazy check in `state()` covers recovery
        let Ok(handle) = Handle::try_current() else {
            return;
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let generation = core.trip_generation;
        let timeout = self.inner.policy.reset_timeout;

        core.reset_timer = Some(handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let breaker = CircuitBreaker { inner };
            let transition = {
                let mut core = breaker.inner.core.lock();
                if core.state != CircuitState::Open || core.trip_generation != generation {
                    return;
                }
                // this task is finishing, don't abort it from inside
                core.reset_timer = None;
                Some(breaker.half_open(&mut core))
            };
            breaker.notify(transition);
        }));
    }

    fn snapshot(&self, core: &Core) -> BreakerStats {
        BreakerStats {
            name: self.inner.name.clone(),
            state: core.state,
            failures: core.failures,
            successes: core.successes,
            last_failure: core.last_failure,
            half_open_attempts: core.half_open_attempts,
        }
    }

    fn notify(&self, transition: Option<Transition>) {
        let Some((new, old, stats)) = transition else {
            return;
        };
        let observer = self.inner.observer.lock().clone();
        if let Some(observer) = observer {
            let result = catch_unwind(AssertUnwindSafe(|| observer(new, old, &stats)));
            if result.is_err() {
                tracing::error!(breaker = %self.inner.name, "Circuit breaker observer panicked");
            }
        }
    }
}

/// Held across a half-open call; releases the slot if the call is dropped
/// before it records an outcome
struct HalfOpenSlot<'a> {
    breaker: &'a CircuitBreaker,
    trip_generation: Option<u64>,
}

impl Drop for HalfOpenSlot<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.trip_generation.take() {
            self.breaker.release_half_open(generation);
        }
    }
}
