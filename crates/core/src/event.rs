// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Audit events and the sink they flow through.
//!
//! Every component reports lifecycle edges, scaling decisions, recovery
//! attempts, and access denials as typed events. Sinks are out-of-band
//! and must never block the emitting task; implementations that cannot
//! keep up drop and count.

use crate::fault::{Fault, Strategy};
use crate::id::{ExecutionId, IncidentId, PrincipalId, WorkspaceId};
use crate::message::ExecStatus;
use crate::session::{SessionId, SessionState};
use serde::{Deserialize, Serialize};

/// Audit record emitted through the [`EventSink`].
///
/// Serializes with `{"type": "scope:name", ...fields}` format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuditEvent {
    // -- session --
    #[serde(rename = "session:created")]
    SessionCreated { id: SessionId, workspace: WorkspaceId, principal: PrincipalId },

    #[serde(rename = "session:state")]
    SessionState { id: SessionId, from: SessionState, to: SessionState },

    #[serde(rename = "session:destroyed")]
    SessionDestroyed { id: SessionId, reason: String },

    // -- execution --
    #[serde(rename = "execution:complete")]
    ExecutionComplete {
        session: SessionId,
        execution: ExecutionId,
        status: ExecStatus,
        wall_ms: u64,
    },

    // -- pool --
    #[serde(rename = "pool:scale_up")]
    PoolScaleUp { size: usize, target: usize },

    #[serde(rename = "pool:scale_down")]
    PoolScaleDown { size: usize, evicted: SessionId },

    #[serde(rename = "pool:exhausted")]
    PoolExhausted { waiters: usize },

    #[serde(rename = "pool:leak")]
    PoolLeak { id: SessionId },

    // -- recovery --
    #[serde(rename = "recovery:incident")]
    RecoveryIncident { incident: IncidentId, session: Option<SessionId>, fault: Fault },

    #[serde(rename = "recovery:attempt")]
    RecoveryAttempt {
        incident: IncidentId,
        strategy: Strategy,
        success: bool,
        elapsed_ms: u64,
    },

    #[serde(rename = "recovery:surfaced")]
    RecoverySurfaced { incident: IncidentId },

    // -- breaker --
    #[serde(rename = "breaker:open")]
    BreakerOpen { target: String, failure_rate: f32 },

    #[serde(rename = "breaker:half_open")]
    BreakerHalfOpen { target: String },

    #[serde(rename = "breaker:closed")]
    BreakerClosed { target: String },

    // -- access --
    #[serde(rename = "access:denied")]
    AccessDenied { principal: PrincipalId, resource: String, action: String, reason: String },

    #[serde(rename = "access:policy_reloaded")]
    PolicyReloaded { version: u64, roles: usize },

    // -- daemon --
    #[serde(rename = "daemon:started")]
    DaemonStarted { pid: u32 },

    #[serde(rename = "daemon:shutdown")]
    DaemonShutdown { drained_sessions: usize },

    /// Emitted by lossy sinks when they had to shed events.
    #[serde(rename = "sink:dropped")]
    SinkDropped { count: u64 },
}

impl AuditEvent {
    /// Short tag for log lines and storage keys.
    pub fn tag(&self) -> &'static str {
        match self {
            AuditEvent::SessionCreated { .. } => "session:created",
            AuditEvent::SessionState { .. } => "session:state",
            AuditEvent::SessionDestroyed { .. } => "session:destroyed",
            AuditEvent::ExecutionComplete { .. } => "execution:complete",
            AuditEvent::PoolScaleUp { .. } => "pool:scale_up",
            AuditEvent::PoolScaleDown { .. } => "pool:scale_down",
            AuditEvent::PoolExhausted { .. } => "pool:exhausted",
            AuditEvent::PoolLeak { .. } => "pool:leak",
            AuditEvent::RecoveryIncident { .. } => "recovery:incident",
            AuditEvent::RecoveryAttempt { .. } => "recovery:attempt",
            AuditEvent::RecoverySurfaced { .. } => "recovery:surfaced",
            AuditEvent::BreakerOpen { .. } => "breaker:open",
            AuditEvent::BreakerHalfOpen { .. } => "breaker:half_open",
            AuditEvent::BreakerClosed { .. } => "breaker:closed",
            AuditEvent::AccessDenied { .. } => "access:denied",
            AuditEvent::PolicyReloaded { .. } => "access:policy_reloaded",
            AuditEvent::DaemonStarted { .. } => "daemon:started",
            AuditEvent::DaemonShutdown { .. } => "daemon:shutdown",
            AuditEvent::SinkDropped { .. } => "sink:dropped",
        }
    }

    /// One-line summary for debug logging.
    pub fn log_summary(&self) -> String {
        let t = self.tag();
        match self {
            AuditEvent::SessionCreated { id, workspace, .. } => {
                format!("{t} id={id} wks={workspace}")
            }
            AuditEvent::SessionState { id, from, to } => format!("{t} id={id} {from}->{to}"),
            AuditEvent::SessionDestroyed { id, reason } => format!("{t} id={id} reason={reason}"),
            AuditEvent::ExecutionComplete { execution, status, wall_ms, .. } => {
                format!("{t} id={execution} status={status} wall={wall_ms}ms")
            }
            AuditEvent::PoolScaleUp { size, target } => format!("{t} size={size} target={target}"),
            AuditEvent::PoolScaleDown { size, evicted } => {
                format!("{t} size={size} evicted={evicted}")
            }
            AuditEvent::PoolExhausted { waiters } => format!("{t} waiters={waiters}"),
            AuditEvent::PoolLeak { id } => format!("{t} id={id}"),
            AuditEvent::RecoveryIncident { incident, fault, .. } => {
                format!("{t} id={incident} fault={fault}")
            }
            AuditEvent::RecoveryAttempt { incident, strategy, success, elapsed_ms } => {
                format!("{t} id={incident} strategy={strategy} ok={success} {elapsed_ms}ms")
            }
            AuditEvent::RecoverySurfaced { incident } => format!("{t} id={incident}"),
            AuditEvent::BreakerOpen { target, failure_rate } => {
                format!("{t} target={target} rate={failure_rate:.2}")
            }
            AuditEvent::BreakerHalfOpen { target } | AuditEvent::BreakerClosed { target } => {
                format!("{t} target={target}")
            }
            AuditEvent::AccessDenied { principal, resource, action, .. } => {
                format!("{t} who={principal} {action} {resource}")
            }
            AuditEvent::PolicyReloaded { version, roles } => {
                format!("{t} v={version} roles={roles}")
            }
            AuditEvent::DaemonStarted { pid } => format!("{t} pid={pid}"),
            AuditEvent::DaemonShutdown { drained_sessions } => {
                format!("{t} drained={drained_sessions}")
            }
            AuditEvent::SinkDropped { count } => format!("{t} count={count}"),
        }
    }
}

/// Out-of-band consumer of audit events.
///
/// `emit` must not block and must not panic; a sink that cannot keep up
/// sheds load internally and accounts for it with [`AuditEvent::SinkDropped`].
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: AuditEvent);
}

/// Sink that discards everything. Default for tests and embedded use.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: AuditEvent) {}
}

impl<S: EventSink + ?Sized> EventSink for std::sync::Arc<S> {
    fn emit(&self, event: AuditEvent) {
        self.as_ref().emit(event);
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
