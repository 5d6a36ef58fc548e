// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fetch retry state machine for the driver portal.
//!
//! An explicit, synchronous state object — no timers live here. The
//! session drives it: ask [`RetryController::begin`] for permission to
//! fetch, report the outcome with [`succeed`](RetryController::succeed)
//! or [`fail`](RetryController::fail), and sleep whatever delay `fail`
//! hands back before the next automatic attempt.
//!
//! The policy is deliberately linear, not exponential: the portal retries
//! a failed refresh after `base_delay × failures`, giving the familiar
//! 1 s / 2 s / 3 s schedule, and gives up after the third automatic
//! retry until a manual refresh resets the streak.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

// ── Policy ──────────────────────────────────────────────────────────

/// Retry schedule parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay; the n-th consecutive failure backs off `base_delay × n`.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Maximum number of automatic retry attempts per failure streak.
    /// The triggering (manual or initial) fetch is not counted.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay after the `failures`-th consecutive failure.
    #[must_use]
    pub fn delay_after(&self, failures: u32) -> Duration {
        self.base_delay.saturating_mul(failures)
    }
}

/// Serde helper — `Duration` as integer milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        val.as_millis().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms: u64 = u64::deserialize(de)?;
        Ok(Duration::from_millis(ms))
    }
}

// ── State ───────────────────────────────────────────────────────────

/// Where the fetch cycle currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum FetchState {
    /// No fetch in flight, no pending retry.
    Idle,

    /// A fetch is in flight. [`RetryController::begin`] refuses to start
    /// another until the outcome is reported.
    Fetching,

    /// Waiting out a backoff delay before the next automatic attempt.
    Backoff {
        /// 1-based number of the retry the delay leads into.
        next_attempt: u32,
        /// How long to wait before that retry.
        #[serde(with = "duration_millis")]
        delay: Duration,
    },

    /// The streak burned through every automatic attempt. Only a manual
    /// [`reset`](RetryController::reset) re-arms the controller.
    Exhausted,
}

/// Outcome of reporting a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Sleep this long, then ask [`RetryController::begin`] again.
    Backoff(Duration),
    /// No automatic attempts left; surface a persistent error.
    Exhausted {
        /// Automatic attempts consumed by the streak.
        attempts: u32,
    },
}

// ── Controller ──────────────────────────────────────────────────────

/// Single-flight fetch bookkeeping with bounded linear backoff.
///
/// Invariants, all covered by tests:
/// - at most `max_attempts` automatic retries per failure streak;
/// - backoff delays strictly increase within a streak;
/// - `begin()` never grants a second concurrent fetch;
/// - `reset()` (a manual refresh) re-arms an exhausted controller.
#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    state: FetchState,
    failures: u32,
}

impl RetryController {
    /// A controller in `Idle` with no recorded failures.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: FetchState::Idle,
            failures: 0,
        }
    }

    /// Current state, for surfacing in the UI ("retrying…", "try again").
    #[must_use]
    pub fn state(&self) -> FetchState {
        self.state
    }

    /// Consecutive failures in the current streak.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// The configured policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Request permission to start a fetch.
    ///
    /// Grants from `Idle` (attempt 0: the triggering fetch) or `Backoff`
    /// (attempts 1..=max). Returns `None` while a fetch is in flight or
    /// after exhaustion — the caller must not fetch.
    pub fn begin(&mut self) -> Option<u32> {
        match self.state {
            FetchState::Idle => {
                self.state = FetchState::Fetching;
                Some(0)
            }
            FetchState::Backoff { next_attempt, .. } => {
                self.state = FetchState::Fetching;
                Some(next_attempt)
            }
            FetchState::Fetching => {
                debug!(target: "rp.retry", "fetch already in flight, begin refused");
                None
            }
            FetchState::Exhausted => None,
        }
    }

    /// Report a successful fetch: back to `Idle`, streak cleared.
    pub fn succeed(&mut self) {
        self.state = FetchState::Idle;
        self.failures = 0;
    }

    /// Report a failed fetch.
    ///
    /// Schedules the next automatic attempt with a linearly growing delay,
    /// or declares the streak exhausted once `max_attempts` retries have
    /// been consumed.
    pub fn fail(&mut self) -> FailOutcome {
        self.failures = self.failures.saturating_add(1);

        if self.failures > self.policy.max_attempts {
            warn!(
                target: "rp.retry",
                failures = self.failures,
                "automatic retries exhausted"
            );
            self.state = FetchState::Exhausted;
            return FailOutcome::Exhausted {
                attempts: self.policy.max_attempts,
            };
        }

        let delay = self.policy.delay_after(self.failures);
        debug!(
            target: "rp.retry",
            failures = self.failures,
            delay_ms = delay.as_millis() as u64,
            "scheduling automatic retry"
        );
        self.state = FetchState::Backoff {
            next_attempt: self.failures,
            delay,
        };
        FailOutcome::Backoff(delay)
    }

    /// Manual refresh: clear the streak and return to `Idle`.
    ///
    /// Legal from any state except `Fetching` — a refresh while a fetch
    /// is in flight must queue behind it, not reset it. Returns `false`
    /// when refused for that reason.
    pub fn reset(&mut self) -> bool {
        if self.state == FetchState::Fetching {
            return false;
        }
        self.state = FetchState::Idle;
        self.failures = 0;
        true
    }
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
