//! Bounded retry with a configurable delay schedule.
//!
//! [`RetryPolicy`] knows nothing about dead letters or sinks. The live flush
//! path runs writes through a short scheduled policy; dead letter replay uses
//! an exponential policy only to compute when the next durable attempt is due.

use log::{debug, error, warn};
use std::fmt::Display;
use std::future::Future;
use tokio::time::{Duration, sleep};

/// How long to wait after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// `delays[i]` is waited after the failure of attempt `i` (0-indexed).
    /// Attempts past the end of the schedule wait `fallback`.
    Schedule {
        /// Per-attempt delays.
        delays: Vec<Duration>,
        /// Delay once `delays` is exhausted.
        fallback: Duration,
    },
    /// `base * 2^i` is waited after the failure of attempt `i` (0-indexed).
    Exponential {
        /// Delay after the first failure.
        base: Duration,
    },
}

/// A bounded retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    /// A policy that waits according to a fixed schedule.
    pub fn scheduled(max_attempts: u32, delays: Vec<Duration>, fallback: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Schedule { delays, fallback },
        }
    }

    /// A policy whose delay doubles after every failure.
    pub fn exponential(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential { base },
        }
    }

    /// Number of attempts made before giving up. Never less than one.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// The backoff strategy.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// The delay to wait after attempt `attempt` (0-indexed) has failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Schedule { delays, fallback } => delays
                .get(attempt as usize)
                .copied()
                .unwrap_or(*fallback),
            Backoff::Exponential { base } => {
                // Cap the exponent so 2^attempt cannot overflow u64
                let multiplier = 2u64.saturating_pow(attempt.min(63));
                let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
                Duration::from_millis(base_ms.saturating_mul(multiplier))
            }
        }
    }

    /// Runs `operation` until it succeeds or the budget is spent.
    ///
    /// `operation` receives the 1-based attempt number. Returns the first
    /// success, or the error of the final attempt.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;
        loop {
            match operation(attempt + 1).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("{} succeeded after {} retries", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if attempt + 1 < max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        label,
                        attempt + 1,
                        max_attempts,
                        e,
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("{} failed after {} attempts: {}", label, max_attempts, e);
                    return Err(e);
                }
            }
        }
    }
}
