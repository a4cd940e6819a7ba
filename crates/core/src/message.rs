// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed messages emitted by an agent subprocess.
//!
//! The stream parser turns framed JSON records into [`Message`] values;
//! everything downstream (hub, subscribers, wire protocol) treats them as
//! immutable. `seq` is scoped to the session and strictly increasing,
//! surviving process restarts.

use crate::id::ExecutionId;
use serde::{Deserialize, Serialize};

/// Discriminator for agent output records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    ToolUse,
    ToolResult,
    Error,
    Thinking,
    System,
    Progress,
    Complete,
}

crate::simple_display! {
    MessageKind {
        Text => "text",
        ToolUse => "tool_use",
        ToolResult => "tool_result",
        Error => "error",
        Thinking => "thinking",
        System => "system",
        Progress => "progress",
        Complete => "complete",
    }
}

impl MessageKind {
    /// All kinds the parser accepts from a subprocess.
    pub const ALL: [MessageKind; 8] = [
        MessageKind::Text,
        MessageKind::ToolUse,
        MessageKind::ToolResult,
        MessageKind::Error,
        MessageKind::Thinking,
        MessageKind::System,
        MessageKind::Progress,
        MessageKind::Complete,
    ];
}

/// One parsed agent message. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Per-session sequence number, strictly increasing.
    pub seq: u64,
    pub kind: MessageKind,
    pub content: String,
    /// Optional key-value metadata copied verbatim from the record.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub meta: serde_json::Map<String, serde_json::Value>,
    /// Wall-clock emission time, epoch milliseconds.
    pub ts_ms: u64,
}

impl Message {
    pub fn new(seq: u64, kind: MessageKind, content: impl Into<String>, ts_ms: u64) -> Self {
        Self { seq, kind, content: content.into(), meta: serde_json::Map::new(), ts_ms }
    }

    pub fn with_meta(mut self, meta: serde_json::Map<String, serde_json::Value>) -> Self {
        self.meta = meta;
        self
    }

    /// True for the record that ends the current execution.
    pub fn ends_execution(&self) -> bool {
        self.kind == MessageKind::Complete
    }

    /// Rough retained size, used by the hub's byte-bounded replay ring.
    pub fn approx_bytes(&self) -> usize {
        const RECORD_OVERHEAD: usize = 64;
        let meta_bytes: usize =
            self.meta.iter().map(|(k, v)| k.len() + v.to_string().len()).sum();
        RECORD_OVERHEAD + self.content.len() + meta_bytes
    }
}

/// Terminal status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Success,
    Failed,
    Cancelled,
    Timeout,
}

crate::simple_display! {
    ExecStatus {
        Success => "success",
        Failed => "failed",
        Cancelled => "cancelled",
        Timeout => "timeout",
    }
}

/// Aggregate outcome of one prompt → completion cycle.
///
/// Carried on the `execution.complete` wire frame and persisted through
/// the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: ExecutionId,
    pub status: ExecStatus,
    /// Sequence range of messages this execution emitted (inclusive).
    /// `seq_start > seq_end` means no messages were emitted.
    pub seq_start: u64,
    pub seq_end: u64,
    pub turns: u32,
    pub bytes_out: u64,
    pub started_ms: u64,
    pub finished_ms: u64,
}

impl ExecutionSummary {
    pub fn wall_ms(&self) -> u64 {
        self.finished_ms.saturating_sub(self.started_ms)
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
