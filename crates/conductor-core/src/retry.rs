// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! Retry logic with exponential backoff.
//!
//! Used for `TransientBrokerError`/`TransientStoreError` (§7): in-process
//! retry with capped exponential backoff before falling back to nack-requeue.

use crate::error::Result;
use rand::Rng;
use std::time::Duration;

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries).
    pub max_attempts: u32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Multiplier for exponential backoff (typically 2.0).
    pub multiplier: f64,

    /// Maximum delay between retries.
    pub max_delay: Duration,

    /// Whether to add jitter to prevent thundering herd.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            multiplier,
            max_delay,
            jitter: true,
        }
    }

    /// Creates a retry policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(0),
            multiplier: 1.0,
            max_delay: Duration::from_millis(0),
            jitter: false,
        }
    }

    /// Creates a retry policy with fixed delays (no exponential backoff).
    pub fn fixed_delay(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter: false,
        }
    }

    /// Calculates the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt >= self.max_attempts {
            return Duration::from_millis(0);
        }

        // Calculate exponential backoff: initial_delay * multiplier^attempt
        let base_delay_ms = self.initial_delay.as_millis() as f64
            * self.multiplier.powi(attempt as i32);

        let base_delay = Duration::from_millis(base_delay_ms as u64);
        let capped_delay = std::cmp::min(base_delay, self.max_delay);

        if self.jitter {
            self.add_jitter(capped_delay)
        } else {
            capped_delay
        }
    }

    /// Adds random jitter to a delay (±25% of the delay value).
    fn add_jitter(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();
        let delay_ms = delay.as_millis() as f64;

        // Add jitter: random value between 75% and 125% of original delay
        let jitter_factor = rng.gen_range(0.75..=1.25);
        let jittered_ms = (delay_ms * jitter_factor) as u64;

        Duration::from_millis(jittered_ms)
    }

    /// Returns true if retries are enabled.
    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }
}

/// Retry executor that handles retry logic with async functions.
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Creates a new retry executor with the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Executes an async operation with retries according to the policy.
    ///
    /// The operation will be retried if:
    /// - It returns a retryable error (determined by `ConductorError::is_retryable()`)
    /// - The maximum number of attempts has not been reached
    ///
    /// # Examples
    ///
    /// ```
    /// use conductor_core::retry::{RetryExecutor, RetryPolicy};
    /// use std::time::Duration;
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let policy = RetryPolicy::new(3, Duration::from_millis(100), 2.0, Duration::from_secs(5));
    /// let executor = RetryExecutor::new(policy);
    ///
    /// let result = executor.execute(|| async {
    ///     // Your async operation here
    ///     Ok::<_, conductor_core::error::ConductorError>(42)
    /// }).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let max_attempts = if self.policy.is_enabled() {
            self.policy.max_attempts + 1 // +1 for initial attempt
        } else {
            1
        };

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    attempt += 1;

                    // Check if we should retry
                    if attempt >= max_attempts || !err.is_retryable() {
                        return Err(err);
                    }

                    // Calculate delay and wait before retrying
                    let delay = self.policy.delay_for_attempt(attempt - 1);
                    if delay > Duration::from_millis(0) {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Executes an async operation with retries, providing attempt information to the operation.
    ///
    /// This variant passes the current attempt number to the operation function,
    /// useful for logging or adjusting behavior based on retry count.
    pub async fn execute_with_info<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let max_attempts = if self.policy.is_enabled() {
            self.policy.max_attempts + 1
        } else {
            1
        };

        loop {
            match operation(attempt).await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    attempt += 1;

                    if attempt >= max_attempts || !err.is_retryable() {
                        return Err(err);
                    }

                    let delay = self.policy.delay_for_attempt(attempt - 1);
                    if delay > Duration::from_millis(0) {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}
