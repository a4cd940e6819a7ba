// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! amux-core: shared types for the agent multiplexer daemon.
//!
//! Everything here is runtime-agnostic: identifiers, clocks, the typed
//! agent message record, the session state machine, classified faults,
//! audit events, and the configuration surface. Async plumbing lives in
//! the crates that own it.

pub mod macros;

pub mod clock;
pub mod config;
pub mod event;
pub mod fault;
pub mod id;
pub mod message;
pub mod session;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::{
    parse_duration, AccessConfig, BackoffKind, BreakerConfig, Config, PoolConfig, RetryConfig,
    SessionConfig, SlowConsumerPolicy, StreamConfig,
};
pub use event::{AuditEvent, EventSink, NullSink};
pub use fault::{Fault, FaultKind, Severity, Strategy};
pub use id::{short, ContainerId, ExecutionId, IncidentId, PrincipalId, SubscriberId, WorkspaceId};
pub use message::{ExecStatus, ExecutionSummary, Message, MessageKind};
pub use session::{
    AffinityKey, AgentProfile, ResourceUsage, SessionId, SessionRecord, SessionState,
};
#[cfg(any(test, feature = "test-support"))]
pub use test_support::CaptureSink;
