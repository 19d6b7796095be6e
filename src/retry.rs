//! Retry policy for readiness polling.
//!
//! The backoff curve and the overall deadline are separate values: [`Backoff`] says how
//! long to sleep between attempts, [`RetryPolicy::within_deadline`] says how long the
//! whole polling phase may take. A retry loop on its own never gives up.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff curve with jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay after the first failed attempt
    pub initial_interval: Duration,
    /// Growth factor applied after every failed attempt
    pub multiplier: f64,
    /// Upper bound for the un-jittered delay
    pub max_interval: Duration,
    /// Jitter as a fraction of the delay, `0.0` disables it
    pub randomization_factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            randomization_factor: 0.5,
        }
    }
}

impl Backoff {
    /// Un-jittered delay after the given failed attempt (1-based).
    pub fn interval(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_interval.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.max_interval
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Delay to actually sleep after the given failed attempt, jitter applied.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let interval = self.interval(attempt);
        if self.randomization_factor <= 0.0 || interval.is_zero() {
            return interval;
        }
        let secs = interval.as_secs_f64();
        let delta = secs * self.randomization_factor.min(1.0);
        let jittered = rand::rng().random_range((secs - delta)..=(secs + delta));
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// The overall deadline elapsed before the bounded work finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline of {0:?} exceeded")]
pub struct DeadlineExceeded(pub Duration);

/// Backoff curve plus an optional deadline for the whole retried phase.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            deadline: None,
        }
    }

    /// Sets the deadline. A zero duration removes it.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = (!deadline.is_zero()).then_some(deadline);
        self
    }

    /// Runs `op` until it succeeds, sleeping per the backoff curve between failures.
    ///
    /// Returns the successful value together with the number of attempts made.
    pub async fn retry<T, E, F, Fut>(&self, name: &str, mut op: F) -> (T, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match op().await {
                Ok(value) => return (value, attempt),
                Err(e) => {
                    let delay = self.backoff.next_delay(attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "{} not ready: {}",
                        name,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Bounds `fut` by the deadline, if one is set.
    pub async fn within_deadline<F>(&self, fut: F) -> Result<F::Output, DeadlineExceeded>
    where
        F: Future,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, fut)
                .await
                .map_err(|_| DeadlineExceeded(deadline)),
            None => Ok(fut.await),
        }
    }
}
