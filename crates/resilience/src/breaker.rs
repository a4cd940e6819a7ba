// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-target circuit breaker.
//!
//! Outcomes are recorded into a sliding time window; past the configured
//! failure or slow-call rate the breaker opens and fails fast. After
//! `open_duration` it admits a bounded set of half-open probes: all must
//! succeed to close, any failure reopens with a doubled (capped) hold.

use amux_core::{AuditEvent, BreakerConfig, Clock, EventSink, SystemClock};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

amux_core::simple_display! {
    BreakerState {
        Closed => "closed",
        Open => "open",
        HalfOpen => "half_open",
    }
}

/// Fail-fast error returned while the breaker is open.
#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit open for target {target}, next probe in {retry_in:?}")]
pub struct CircuitOpen {
    pub target: String,
    pub retry_in: Duration,
}

/// Outcome of one admitted call.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Success { elapsed: Duration },
    Failure { elapsed: Duration },
}

/// Token proving a call was admitted. Must be handed back via
/// [`CircuitBreaker::complete`]; dropping it leaks a half-open slot
/// until the episode ends.
#[must_use]
#[derive(Debug)]
pub struct Permit {
    half_open: bool,
}

struct Sample {
    at: Instant,
    failed: bool,
    slow: bool,
}

struct Inner {
    state: BreakerState,
    window: VecDeque<Sample>,
    next_probe: Option<Instant>,
    /// Current open hold; doubles on each failed probe episode.
    current_open: Duration,
    halfopen_inflight: usize,
    halfopen_successes: usize,
}

pub struct CircuitBreaker<C: Clock = SystemClock> {
    target: String,
    config: BreakerConfig,
    clock: C,
    sink: Arc<dyn EventSink>,
    inner: Mutex<Inner>,
}

impl<C: Clock> CircuitBreaker<C> {
    pub fn new(
        target: impl Into<String>,
        config: BreakerConfig,
        clock: C,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let current_open = config.open_duration;
        Self {
            target: target.into(),
            config,
            clock,
            sink,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window: VecDeque::new(),
                next_probe: None,
                current_open,
                halfopen_inflight: 0,
                halfopen_successes: 0,
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> BreakerState {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.roll(&mut inner, now);
        inner.state
    }

    /// Ask to issue a call. While open this fails fast with
    /// [`CircuitOpen`] and no underlying call may be made.
    pub fn admit(&self) -> Result<Permit, CircuitOpen> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.roll(&mut inner, now);

        match inner.state {
            BreakerState::Closed => Ok(Permit { half_open: false }),
            BreakerState::Open => {
                let retry_in = inner
                    .next_probe
                    .map(|at| at.saturating_duration_since(now))
                    .unwrap_or(inner.current_open);
                Err(CircuitOpen { target: self.target.clone(), retry_in })
            }
            BreakerState::HalfOpen => {
                if inner.halfopen_inflight < self.config.halfopen_quota {
                    inner.halfopen_inflight += 1;
                    Ok(Permit { half_open: true })
                } else {
                    Err(CircuitOpen {
                        target: self.target.clone(),
                        retry_in: Duration::from_millis(50),
                    })
                }
            }
        }
    }

    /// Record the outcome of an admitted call.
    pub fn complete(&self, permit: Permit, outcome: Outcome) {
        let now = self.clock.now();
        let (failed, elapsed) = match outcome {
            Outcome::Success { elapsed } => (false, elapsed),
            Outcome::Failure { elapsed } => (true, elapsed),
        };
        let slow = elapsed >= self.config.slow_call_after;

        let mut inner = self.inner.lock();
        inner.window.push_back(Sample { at: now, failed, slow });
        self.prune(&mut inner, now);

        if permit.half_open {
            inner.halfopen_inflight = inner.halfopen_inflight.saturating_sub(1);
            // Only react while still half-open; a concurrent probe may
            // have already decided the episode.
            if inner.state == BreakerState::HalfOpen {
                if failed {
                    self.reopen(&mut inner, now, true);
                } else {
                    inner.halfopen_successes += 1;
                    if inner.halfopen_successes >= self.config.halfopen_quota {
                        self.close(&mut inner);
                    }
                }
            }
            return;
        }

        if inner.state == BreakerState::Closed && self.window_trips(&inner) {
            self.reopen(&mut inner, now, false);
        }
    }

    /// Drop samples older than the window and promote open → half-open
    /// once the probe deadline passes.
    fn roll(&self, inner: &mut Inner, now: Instant) {
        self.prune(inner, now);
        if inner.state == BreakerState::Open {
            let due = inner.next_probe.map(|at| now >= at).unwrap_or(true);
            if due {
                inner.state = BreakerState::HalfOpen;
                inner.halfopen_inflight = 0;
                inner.halfopen_successes = 0;
                self.sink.emit(AuditEvent::BreakerHalfOpen { target: self.target.clone() });
            }
        }
    }

    fn prune(&self, inner: &mut Inner, now: Instant) {
        let horizon = now.checked_sub(self.config.window);
        if let Some(horizon) = horizon {
            while inner.window.front().map(|s| s.at < horizon).unwrap_or(false) {
                inner.window.pop_front();
            }
        }
    }

    fn window_trips(&self, inner: &Inner) -> bool {
        let total = inner.window.len();
        if total < self.config.min_calls {
            return false;
        }
        let failures = inner.window.iter().filter(|s| s.failed).count();
        let slow = inner.window.iter().filter(|s| s.slow).count();
        let failure_rate = failures as f32 / total as f32;
        let slow_rate = slow as f32 / total as f32;
        failure_rate >= self.config.failure_rate || slow_rate >= self.config.slow_rate
    }

    fn reopen(&self, inner: &mut Inner, now: Instant, escalate: bool) {
        if escalate {
            inner.current_open =
                (inner.current_open * 2).min(self.config.open_duration_max);
        }
        inner.state = BreakerState::Open;
        inner.next_probe = Some(now + inner.current_open);
        inner.halfopen_inflight = 0;
        inner.halfopen_successes = 0;
        let total = inner.window.len().max(1);
        let failures = inner.window.iter().filter(|s| s.failed).count();
        self.sink.emit(AuditEvent::BreakerOpen {
            target: self.target.clone(),
            failure_rate: failures as f32 / total as f32,
        });
        tracing::warn!(target = %self.target, hold = ?inner.current_open, "circuit opened");
    }

    fn close(&self, inner: &mut Inner) {
        inner.state = BreakerState::Closed;
        inner.window.clear();
        inner.next_probe = None;
        inner.current_open = self.config.open_duration;
        inner.halfopen_inflight = 0;
        inner.halfopen_successes = 0;
        self.sink.emit(AuditEvent::BreakerClosed { target: self.target.clone() });
    }
}

/// One breaker per named target, created on first use.
pub struct BreakerRegistry<C: Clock = SystemClock> {
    config: BreakerConfig,
    clock: C,
    sink: Arc<dyn EventSink>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker<C>>>>,
}

impl<C: Clock> BreakerRegistry<C> {
    pub fn new(config: BreakerConfig, clock: C, sink: Arc<dyn EventSink>) -> Self {
        Self { config, clock, sink, breakers: Mutex::new(HashMap::new()) }
    }

    pub fn breaker(&self, target: &str) -> Arc<CircuitBreaker<C>> {
        let mut map = self.breakers.lock();
        if let Some(existing) = map.get(target) {
            return Arc::clone(existing);
        }
        let created = Arc::new(CircuitBreaker::new(
            target,
            self.config.clone(),
            self.clock.clone(),
            Arc::clone(&self.sink),
        ));
        map.insert(target.to_string(), Arc::clone(&created));
        created
    }

    /// Breakers currently not closed; feeds the adaptive backoff.
    pub fn open_count(&self) -> usize {
        self.breakers
            .lock()
            .values()
            .filter(|b| b.state() != BreakerState::Closed)
            .count()
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
