// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Classified failure records.
//!
//! Raw errors from the supervisor, parser, pool, and container layers are
//! mapped by the classifier into a [`Fault`]: kind, severity, whether a
//! retry can help, and the recovery strategy to try first. Components
//! annotate and propagate; only the recovery layer acts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Transport-level: peer closed, connect refused, handshake failure.
    Network,
    /// Subprocess exited unexpectedly, stdin broken, spawn failure.
    Process,
    /// Framing or schema violation on the subprocess stream.
    Protocol,
    /// Pool exhausted, memory cap hit, container OOM.
    Resource,
    /// A deadline elapsed.
    Timeout,
    /// Denied by the access gate or an upstream identity provider.
    Auth,
    /// Malformed client input.
    Validation,
    /// Uncaught or unknown.
    Internal,
    /// The agent reported a tool-level failure.
    AgentTool,
}

crate::simple_display! {
    FaultKind {
        Network => "network",
        Process => "process",
        Protocol => "protocol",
        Resource => "resource",
        Timeout => "timeout",
        Auth => "auth",
        Validation => "validation",
        Internal => "internal",
        AgentTool => "agent_tool",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

crate::simple_display! {
    Severity {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
}

/// Recovery actions, ranked by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Reissue the failed operation.
    Retry,
    /// Terminate and respawn the subprocess in place; session id and seq
    /// cursor are preserved.
    RestartProcess,
    /// Destroy the session and materialize a replacement for the same
    /// affinity key.
    RestartSession,
    /// Discard the backing container, recreate it, then restart the
    /// session.
    CleanupAndRecreate,
    /// Give up: mark the session failed and notify subscribers.
    Surface,
}

crate::simple_display! {
    Strategy {
        Retry => "retry",
        RestartProcess => "restart_process",
        RestartSession => "restart_session",
        CleanupAndRecreate => "cleanup_and_recreate",
        Surface => "surface",
    }
}

/// A fully classified failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub severity: Severity,
    pub retryable: bool,
    pub strategy: Strategy,
    /// Human-readable summary of the original error.
    pub message: String,
    /// Structured context: pid, exit status, target name, deadline, ...
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
    /// Display strings of the cause chain, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cause_chain: Vec<String>,
}

impl Fault {
    pub fn new(kind: FaultKind, severity: Severity, message: impl Into<String>) -> Self {
        let (retryable, strategy) = kind.default_disposition();
        Self {
            kind,
            severity,
            retryable,
            strategy,
            message: message.into(),
            context: BTreeMap::new(),
            cause_chain: Vec::new(),
        }
    }

    crate::setters! {
        set {
            retryable: bool,
            strategy: Strategy,
        }
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Append the `source()` chain of a std error, outermost first.
    pub fn caused_by(mut self, err: &(dyn std::error::Error + 'static)) -> Self {
        self.cause_chain.push(err.to_string());
        let mut source = err.source();
        while let Some(cause) = source {
            self.cause_chain.push(cause.to_string());
            source = cause.source();
        }
        self
    }
}

impl FaultKind {
    /// Default (retryable, strategy) per the error-handling design.
    /// Classifier rules may override both.
    pub fn default_disposition(self) -> (bool, Strategy) {
        match self {
            FaultKind::Network => (true, Strategy::Retry),
            FaultKind::Process => (false, Strategy::RestartProcess),
            FaultKind::Protocol => (false, Strategy::RestartProcess),
            FaultKind::Resource => (true, Strategy::Retry),
            FaultKind::Timeout => (true, Strategy::Retry),
            FaultKind::Auth => (false, Strategy::Surface),
            FaultKind::Validation => (false, Strategy::Surface),
            FaultKind::Internal => (false, Strategy::Surface),
            FaultKind::AgentTool => (false, Strategy::Surface),
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}: {}", self.kind, self.severity, self.message)
    }
}

impl std::error::Error for Fault {}

#[cfg(test)]
#[path = "fault_tests.rs"]
mod tests;
