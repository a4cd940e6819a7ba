// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Adaptive retrier.
//!
//! Executes an operation under a retry policy, consulting the breaker
//! before each attempt and the classifier after each failure. A breaker
//! refusal surfaces immediately without spending an attempt; a
//! non-retryable fault aborts the loop.

use crate::breaker::{BreakerRegistry, CircuitOpen, Outcome};
use crate::classify::{Classifier, Source};
use amux_core::{BackoffKind, Clock, Fault, RetryConfig, SystemClock};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),

    #[error("operation failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Fault },

    #[error("operation not retryable: {fault}")]
    Aborted { fault: Fault },

    #[error("operation cancelled")]
    Cancelled,
}

impl RetryError {
    /// The classified fault behind this error, when one exists.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Aborted { fault } => Some(fault),
            _ => None,
        }
    }
}

pub struct Retrier<C: Clock = SystemClock> {
    config: RetryConfig,
    classifier: Arc<Classifier>,
    registry: Arc<BreakerRegistry<C>>,
    /// Operations currently inside `run`; feeds adaptive backoff.
    running: AtomicUsize,
}

impl<C: Clock> Retrier<C> {
    pub fn new(
        config: RetryConfig,
        classifier: Arc<Classifier>,
        registry: Arc<BreakerRegistry<C>>,
    ) -> Self {
        Self { config, classifier, registry, running: AtomicUsize::new(0) }
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    /// Run `op` until success, exhaustion, a non-retryable fault, breaker
    /// refusal, or cancellation.
    pub async fn run<T, E, F, Fut>(
        &self,
        source: Source,
        target: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let breaker = self.registry.breaker(target);
        self.running.fetch_add(1, Ordering::Relaxed);
        let result = self.run_inner(source, &breaker, cancel, &mut op).await;
        self.running.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn run_inner<T, E, F, Fut>(
        &self,
        source: Source,
        breaker: &crate::breaker::CircuitBreaker<C>,
        cancel: &CancellationToken,
        op: &mut F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            // A refusal does not consume an attempt.
            let permit = breaker.admit()?;

            let started = Instant::now();
            match op().await {
                Ok(value) => {
                    breaker.complete(permit, Outcome::Success { elapsed: started.elapsed() });
                    return Ok(value);
                }
                Err(error) => {
                    breaker.complete(permit, Outcome::Failure { elapsed: started.elapsed() });
                    let fault = self
                        .classifier
                        .classify(source, &error)
                        .context("attempt", attempt.to_string());

                    if !fault.retryable {
                        return Err(RetryError::Aborted { fault });
                    }
                    if attempt >= max_attempts {
                        return Err(RetryError::Exhausted { attempts: attempt, last: fault });
                    }

                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        target = breaker.target(),
                        attempt,
                        ?delay,
                        "retrying after failure: {}",
                        fault
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Delay before the attempt following `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay;
        let raw = match self.config.backoff {
            BackoffKind::Fixed => base,
            BackoffKind::Linear => base.saturating_mul(attempt),
            BackoffKind::Exponential => exponential(base, attempt),
            BackoffKind::Adaptive => {
                // Stretch the base while the system is busy: running
                // retries plus non-closed breakers.
                let load = self.running() + self.registry.open_count();
                let stretched = base.saturating_mul(1 + load as u32);
                exponential(stretched, attempt)
            }
        };
        let capped = raw.min(self.config.max_delay);
        if self.config.jitter {
            jittered(capped, attempt)
        } else {
            capped
        }
    }
}

fn exponential(base: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift)
}

/// ±25 % jitter without a PRNG dependency: hash the attempt number with
/// the sub-second wall clock.
fn jittered(delay: Duration, attempt: u32) -> Duration {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    attempt.hash(&mut hasher);
    std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos()
        .hash(&mut hasher);
    let factor = 0.75 + (hasher.finish() % 1000) as f64 / 1998.0;
    delay.mul_f64(factor)
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
