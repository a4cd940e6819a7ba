// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session identity, state machine, and accounting types.
//!
//! A session wraps one agent subprocess for one (principal, workspace,
//! profile) triple. State mutation happens only on the session's owner
//! task; these types encode what the legal transitions are, not who may
//! perform them.

use crate::id::{PrincipalId, WorkspaceId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;

crate::define_id! {
    /// Pooled agent subprocess wrapper.
    pub struct SessionId("ses-");
}

/// Lifecycle states of a session.
///
/// `Pending → Ready → (Busy ↔ Idle) → Terminating → Ended`, with `Failed`
/// as a sink for unrecoverable startup or runtime faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Ready,
    Busy,
    Idle,
    Terminating,
    Ended,
    Failed,
}

crate::simple_display! {
    SessionState {
        Pending => "pending",
        Ready => "ready",
        Busy => "busy",
        Idle => "idle",
        Terminating => "terminating",
        Ended => "ended",
        Failed => "failed",
    }
}

impl SessionState {
    /// Whether the state machine permits `self → next`.
    pub fn may_become(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Pending, Ready) | (Pending, Failed) => true,
            (Ready, Busy) | (Idle, Busy) => true,
            (Busy, Idle) => true,
            // Hard errors, TTL expiry, eviction, and external terminate()
            // all funnel through Terminating.
            (Pending, Terminating)
            | (Ready, Terminating)
            | (Busy, Terminating)
            | (Idle, Terminating) => true,
            (Terminating, Ended) => true,
            // Process restart in place: the supervisor is swapped while
            // the session object (id, seq cursor, hub) survives.
            (Terminating, Ready) => true,
            (Busy, Failed) | (Terminating, Failed) => true,
            _ => false,
        }
    }

    /// States in which the pool may hand the session to a caller.
    pub fn is_acquirable(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Idle)
    }

    /// Sink states: the session will never serve another prompt.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Failed)
    }
}

/// Snapshot of the agent configuration a session was started with.
///
/// Two sessions are interchangeable for affinity purposes iff their
/// profiles fingerprint identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Executable to spawn (e.g. "claude").
    pub command: String,
    pub args: Vec<String>,
    /// Working directory inside the workspace.
    pub working_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Tools the agent may invoke; empty means the agent's default set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    /// Hard cap on turns per execution.
    pub turn_cap: u32,
    /// Environment passed to the subprocess. BTreeMap keeps the
    /// fingerprint independent of insertion order.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl AgentProfile {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            system_prompt: None,
            allowed_tools: Vec::new(),
            turn_cap: 50,
            env: BTreeMap::new(),
        }
    }

    crate::setters! {
        set {
            args: Vec<String>,
            allowed_tools: Vec<String>,
            turn_cap: u32,
            env: BTreeMap<String, String>,
        }
        option {
            system_prompt: String,
        }
    }

    /// Stable hex digest over every field that affects subprocess
    /// behavior. Used as the third component of the affinity key.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.command.as_bytes());
        for arg in &self.args {
            hasher.update([0u8]);
            hasher.update(arg.as_bytes());
        }
        hasher.update([1u8]);
        hasher.update(self.working_dir.to_string_lossy().as_bytes());
        if let Some(prompt) = &self.system_prompt {
            hasher.update([2u8]);
            hasher.update(prompt.as_bytes());
        }
        for tool in &self.allowed_tools {
            hasher.update([3u8]);
            hasher.update(tool.as_bytes());
        }
        hasher.update([4u8]);
        hasher.update(self.turn_cap.to_be_bytes());
        for (key, value) in &self.env {
            hasher.update([5u8]);
            hasher.update(key.as_bytes());
            hasher.update([6u8]);
            hasher.update(value.as_bytes());
        }
        let digest = hasher.finalize();
        // 16 bytes of the digest is plenty for routing equality.
        digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Routing key the pool prefers when reusing warm sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AffinityKey {
    pub principal: PrincipalId,
    pub workspace: WorkspaceId,
    pub fingerprint: String,
}

impl AffinityKey {
    pub fn new(principal: PrincipalId, workspace: WorkspaceId, profile: &AgentProfile) -> Self {
        Self { principal, workspace, fingerprint: profile.fingerprint() }
    }
}

impl std::fmt::Display for AffinityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.principal,
            self.workspace,
            crate::id::short(&self.fingerprint, 8)
        )
    }
}

/// Cumulative per-session resource counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub turns_used: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub wall_ms: u64,
    pub peak_rss_bytes: u64,
}

impl ResourceUsage {
    pub fn note_rss(&mut self, rss_bytes: u64) {
        if rss_bytes > self.peak_rss_bytes {
            self.peak_rss_bytes = rss_bytes;
        }
    }
}

/// Persistable session metadata for the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub workspace: WorkspaceId,
    pub principal: PrincipalId,
    pub profile: AgentProfile,
    pub state: SessionState,
    pub created_ms: u64,
    pub last_used_ms: u64,
    pub usage: ResourceUsage,
    /// Sequence cursor: the last seq emitted by this session's parser.
    pub seq_cursor: u64,
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
