//! Backoff scheduling.
//!
//! [`delay`] is a pure function of the attempt index and the policy. Three
//! modes are selectable:
//!
//! - linear with cap: `min(1 + interval * attempt, max)`
//! - linear with hard cutover: linear until `tries_before_max`, then `max`
//! - exponential with cap: `min(interval ^ attempt, max)`
//!
//! `max` defaults to [`DEFAULT_MAX_DELAY_SECS`] when unspecified.

use std::time::Duration;

/// Default attempt budget for a wait.
pub const DEFAULT_TRIES: u32 = 54;

/// Cap applied when a policy does not specify `max`.
pub const DEFAULT_MAX_DELAY_SECS: f64 = 15.0;

/// Something that can tell a retry loop how long to sleep and when to stop.
pub trait Backoff: Send + Sync {
    /// Delay to sleep after the attempt with the given 0-based index failed.
    fn delay(&self, attempt: u32) -> Duration;

    /// Total number of attempts permitted (always at least 1).
    fn max_attempts(&self) -> u32;
}

/// Parameters controlling how long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Seconds added per attempt (linear) or the base (exponential).
    pub interval: f64,

    /// Attempt budget.
    pub total: u32,

    /// Upper bound on a single delay, in seconds.
    pub max: Option<f64>,

    /// Use `interval ^ attempt` instead of the linear formula.
    pub exponential: bool,

    /// From this attempt index onward, always sleep `max`.
    pub tries_before_max: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::linear(1.0)
    }
}

impl BackoffPolicy {
    /// Linear backoff with the default cap and budget.
    pub fn linear(interval: f64) -> Self {
        Self {
            interval,
            total: DEFAULT_TRIES,
            max: None,
            exponential: false,
            tries_before_max: None,
        }
    }

    /// Exponential backoff with the default cap and budget.
    pub fn exponential(interval: f64) -> Self {
        Self {
            exponential: true,
            ..Self::linear(interval)
        }
    }

    /// The same delay before every retry.
    pub fn fixed(delay: Duration, total: u32) -> Self {
        Self {
            interval: 0.0,
            total,
            max: Some(delay.as_secs_f64()),
            exponential: false,
            tries_before_max: Some(0),
        }
    }

    /// Policy used for resource waits: 54 attempts, linear step 2, capped at
    /// 32 seconds. Sleeps add up to 24 minutes.
    pub fn resource_wait() -> Self {
        Self::linear(2.0).with_max(32.0)
    }

    pub fn with_total(mut self, total: u32) -> Self {
        self.total = total;
        self
    }

    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn with_tries_before_max(mut self, tries: u32) -> Self {
        self.tries_before_max = Some(tries);
        self
    }

    fn cap(&self) -> f64 {
        self.max.unwrap_or(DEFAULT_MAX_DELAY_SECS).max(0.0)
    }
}

/// Delay before the attempt following `attempt` (0-based).
pub fn delay(attempt: u32, policy: &BackoffPolicy) -> Duration {
    let cap = policy.cap();
    let interval = policy.interval.max(0.0);

    let secs = match policy.tries_before_max {
        Some(cutover) if attempt >= cutover => cap,
        _ if policy.exponential => interval.powi(attempt.min(i32::MAX as u32) as i32),
        _ => 1.0 + interval * f64::from(attempt),
    };

    Duration::try_from_secs_f64(secs.min(cap).max(0.0)).unwrap_or(Duration::MAX)
}

impl Backoff for BackoffPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        delay(attempt, self)
    }

    fn max_attempts(&self) -> u32 {
        self.total.max(1)
    }
}
