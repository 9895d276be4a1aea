// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policy
//!
//! Bounded exponential backoff with jitter, used to absorb transient broker
//! failures when connecting and when publishing.

use crate::errors::AmqpError;
use rand::Rng;
use std::{future::Future, time::Duration};
use tracing::{debug, warn};

/// Jitter range as a fraction of the computed delay (±25%)
const JITTER_PERCENT: f64 = 0.25;

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub delay: Duration,

    /// Multiplier applied to the delay after every failed attempt
    pub factor: f64,

    /// Upper bound for a single delay
    pub max_delay: Duration,

    /// Whether to randomize delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::connection()
    }
}

impl RetryPolicy {
    /// Policy used when opening a broker connection.
    pub const fn connection() -> Self {
        RetryPolicy {
            max_attempts: 10,
            delay: Duration::from_millis(200),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }

    /// Policy used when publishing a message.
    pub const fn publish() -> Self {
        RetryPolicy {
            max_attempts: 10,
            delay: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay to wait after the failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.delay.as_secs_f64() * self.factor.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter && capped > 0.0 {
            let range = capped * JITTER_PERCENT;
            capped + rand::thread_rng().gen_range(-range..=range)
        } else {
            capped
        };

        Duration::from_secs_f64(delay.max(0.0))
    }

    /// Runs `op` until it succeeds or the attempts are exhausted, returning
    /// the last error in the latter case.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, AmqpError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 >= attempts => {
                    debug!(operation, attempts, "retries exhausted");
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        error = err.to_string(),
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
