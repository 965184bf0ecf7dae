//! Retry schedule for slot initialization
//!
//! [`Backoff`] is a small explicit state machine: each failed attempt is
//! reported with [`Backoff::fail`], which answers either "wait this long and
//! try again" or "give up". Waiting itself goes through a [`Sleeper`] so
//! tests can observe the schedule without real delays.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt; doubled after every further one
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Total attempts, including the first
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            attempts: 0,
            next_delay: self.initial_delay,
            max_attempts: self.max_attempts.max(1),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    Retry(Duration),
    Exhausted,
}

/// Attempt counter plus the delay to use before the next attempt.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempts: u32,
    next_delay: Duration,
    max_attempts: u32,
}

impl Backoff {
    /// Attempts reported as failed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record one failed attempt.
    pub fn fail(&mut self) -> RetryStep {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return RetryStep::Exhausted;
        }
        let delay = self.next_delay;
        self.next_delay = self.next_delay.saturating_mul(2);
        RetryStep::Retry(delay)
    }
}

/// Suspends the caller for a while.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real timer-backed sleeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
