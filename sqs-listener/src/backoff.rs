use std::time::Duration;

use serde::Deserialize;

use crate::options::duration_millis;

/// Exponential backoff between retries of a failing transport call.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffPolicy {
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    pub multiplier: f64,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub const fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    /// The delay to wait before retry number `attempt`, counting from zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2.0, Duration::from_secs(10))
    }
}

/// A bounded number of attempts with a [`BackoffPolicy`] between them.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts in total, including the first one.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            BackoffPolicy::new(Duration::from_millis(100), 2.0, Duration::from_secs(1)),
        )
    }
}

/// Tracks consecutive failures against a [`BackoffPolicy`].
#[derive(Debug)]
pub(crate) struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
}

impl Backoff {
    pub(crate) fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Records a failure and returns how long to wait before trying again.
    pub(crate) fn on_failure(&mut self) -> Duration {
        let delay = self.policy.delay(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub(crate) fn reset(&mut self) -> u32 {
        std::mem::take(&mut self.failures)
    }
}

/// Randomisation applied to a computed visibility timeout.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    #[default]
    None,
    /// Anywhere between 1 and the computed value.
    Full,
    /// Anywhere between half the computed value and the computed value.
    Half,
}

impl Jitter {
    pub fn apply(self, seconds: u32, rng: &mut fastrand::Rng) -> u32 {
        match self {
            Jitter::None => seconds,
            Jitter::Full => rng.u32(1..=seconds.max(1)),
            Jitter::Half => {
                let half = (seconds / 2).max(1);
                rng.u32(half..=seconds.max(half))
            }
        }
    }
}
