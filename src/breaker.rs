//! Circuit breaker guarding every call to the external downloader.
//!
//! Three states:
//!
//! - `CLOSED` - calls pass; consecutive transport failures count up, and
//!   hitting the threshold opens the breaker.
//! - `OPEN` - calls are rejected without touching the downloader until the
//!   recovery window has elapsed.
//! - `HALF_OPEN` - exactly one probe call is admitted; its outcome decides
//!   between `CLOSED` and a fresh `OPEN` window.
//!
//! Only transport-class failures feed the breaker; a downloader that
//! answers with `NotFound` or `Rejected` is alive. Callers report outcomes
//! via [`CircuitBreaker::on_success`] / [`CircuitBreaker::on_failure`].
//!
//! The breaker is shared across workers; all state sits behind one mutex,
//! and the tunables are refreshed from settings at the top of each worker
//! tick via [`CircuitBreaker::set_config`].

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// Default consecutive-failure threshold before opening.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default recovery window in milliseconds.
pub const DEFAULT_RECOVERY_MS: i64 = 30_000;

/// Breaker state, exposed through the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls pass through.
    Closed,
    /// Calls are short-circuited.
    Open,
    /// A single probe is deciding the next state.
    HalfOpen,
}

/// Tunables, refreshed live from the settings store.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive transport failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting a probe.
    pub recovery: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery: Duration::milliseconds(DEFAULT_RECOVERY_MS),
        }
    }
}

/// Read model for observers.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Current gate state.
    pub state: BreakerState,
    /// Consecutive transport failures observed in `CLOSED`.
    pub failure_count: u32,
    /// Last time a guarded call succeeded.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Last time a guarded call failed.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When the breaker last opened.
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    config: BreakerConfig,
    consecutive_failures: u32,
    probe_in_flight: bool,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
}

/// Three-state gate shared by every worker that talks to the downloader.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker with the given tunables.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                config,
                consecutive_failures: 0,
                probe_in_flight: false,
                last_success_at: None,
                last_failure_at: None,
                opened_at: None,
            }),
        }
    }

    /// Refreshes the tunables. Called at the top of each worker tick so
    /// settings changes apply without restart.
    pub fn set_config(&self, config: BreakerConfig) {
        self.lock().config = config;
    }

    /// Decides whether a call may proceed right now.
    ///
    /// Returns `false` when the breaker is open (recovery window not yet
    /// elapsed) or when a half-open probe is already in flight. A `true`
    /// from an open breaker whose window elapsed admits the caller as the
    /// probe.
    #[must_use]
    pub fn try_acquire(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .is_some_and(|opened| now - opened >= inner.config.recovery);
                if elapsed {
                    debug!("breaker half-open, admitting probe");
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Records a successful guarded call. Closes the breaker and resets the
    /// failure counter.
    pub fn on_success(&self, now: DateTime<Utc>) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            debug!("breaker closed after successful call");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        inner.opened_at = None;
        inner.last_success_at = Some(now);
    }

    /// Records a transport-class failure.
    ///
    /// In `CLOSED`, counts toward the threshold; in `HALF_OPEN`, reopens
    /// immediately with a fresh recovery window.
    pub fn on_failure(&self, now: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.last_failure_at = Some(now);
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= inner.config.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        "breaker opened after consecutive transport failures"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                warn!("breaker probe failed, reopening");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
            }
            BreakerState::Open => {
                // A call admitted before the breaker opened finished late.
            }
        }
    }

    /// Records a non-transport failure (`NotFound`, `Rejected`, ...): the
    /// downloader answered, so a half-open probe counts as having
    /// succeeded, but a closed breaker's counter is left alone.
    pub fn on_non_transport(&self, now: DateTime<Utc>) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            debug!("breaker closed after non-transport answer");
            inner.state = BreakerState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
        }
        inner.probe_in_flight = false;
        inner.last_success_at = Some(now);
    }

    /// Returns the current read model.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.consecutive_failures,
            last_success_at: inner.last_success_at,
            last_failure_at: inner.last_failure_at,
            opened_at: inner.opened_at,
        }
    }

    /// True when calls are currently short-circuited.
    #[must_use]
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let inner = self.lock();
        match inner.state {
            BreakerState::Open => inner
                .opened_at
                .is_none_or(|opened| now - opened < inner.config.recovery),
            _ => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A poisoned mutex means another worker panicked mid-update; the
        // counters are still structurally valid, so keep going.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
