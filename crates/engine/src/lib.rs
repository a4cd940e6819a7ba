// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! amux-engine: session pool and lifecycle management.
//!
//! A [`session::Session`] wraps one supervised agent subprocess behind
//! an owner task; the [`pool::SessionPool`] keeps warm sessions keyed by
//! affinity and scales between bounds; the
//! [`recovery::RecoveryOrchestrator`] drives classified faults through
//! ranked recovery strategies.

pub mod container;
pub mod pool;
pub mod recovery;
pub mod session;
pub mod supervisor;

pub use container::{ContainerController, ContainerError, ContainerState, WorkspaceSpec};
pub use pool::{PoolError, SessionPool};
pub use recovery::{strategies_for, Incident, PoolRecovery, RecoveryOps, RecoveryOrchestrator};
pub use session::{ExecutionHandle, Session, SessionError};
pub use supervisor::{AgentStream, ProcessHealth, Supervisor, SupervisorError};
