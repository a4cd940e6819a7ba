// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! amux-resilience: failure classification, circuit breaking, and retry.
//!
//! The classifier turns raw errors into [`amux_core::Fault`] records, the
//! breaker guards call targets with a sliding failure window, and the
//! retrier executes operations under a backoff policy gated by both.

pub mod breaker;
pub mod classify;
pub mod retry;

pub use breaker::{BreakerRegistry, BreakerState, CircuitBreaker, CircuitOpen, Outcome, Permit};
pub use classify::{Classifier, Rule, Source};
pub use retry::{Retrier, RetryError};
