// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket wire protocol.
//!
//! JSON text frames, one frame per message, tagged by `type`. Client
//! frames open with `session.connect`; everything the server pushes is
//! a `message`, `execution.complete`, `gap`, `status`, `session.pong`,
//! or `error` frame.

use amux_core::{
    ExecStatus, ExecutionId, ExecutionSummary, Message, MessageKind, SessionId, SessionState,
    WorkspaceId,
};
use serde::{Deserialize, Serialize};

/// Major protocol version; bumped on breaking frame changes.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("unsupported frame: expected session.connect first")]
    ConnectExpected,

    #[error("unsupported protocol version {0}, server speaks {PROTOCOL_VERSION}")]
    Version(u32),
}

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Subscribe to a session (attach) or request a fresh one for a
    /// workspace. `cursor` asks for replay.
    #[serde(rename = "session.connect")]
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace_id: Option<WorkspaceId>,
        auth: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol_version: Option<u32>,
    },

    /// Submit a prompt, opening a new execution.
    #[serde(rename = "session.message")]
    Message { session_id: SessionId, content: String },

    /// Cancel a named execution.
    #[serde(rename = "session.cancel")]
    Cancel { session_id: SessionId, execution_id: ExecutionId },

    #[serde(rename = "session.ping")]
    Ping,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Per-execution roll-up carried on `execution.complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub turns: u32,
    pub bytes_out: u64,
    pub wall_ms: u64,
}

/// Frames the server pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "message")]
    Message {
        session_id: SessionId,
        seq: u64,
        ts: String,
        kind: MessageKind,
        content: String,
        #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
        meta: serde_json::Map<String, serde_json::Value>,
    },

    #[serde(rename = "execution.complete")]
    ExecutionComplete {
        session_id: SessionId,
        execution_id: ExecutionId,
        status: ExecStatus,
        seq_start: u64,
        seq_end: u64,
        summary: Summary,
    },

    /// Declared drop range under the drop-oldest policy.
    #[serde(rename = "gap")]
    Gap { session_id: SessionId, from: u64, to: u64 },

    #[serde(rename = "status")]
    Status { session_id: SessionId, state: SessionState },

    #[serde(rename = "session.pong")]
    Pong,

    /// Structured error; `close` signals the socket will shut next.
    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        code: String,
        message: String,
        #[serde(default)]
        close: bool,
    },
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","code":"internal","message":"frame encoding failed","close":true}"#
                .to_string()
        })
    }

    pub fn message(session_id: SessionId, message: &Message) -> Self {
        ServerFrame::Message {
            session_id,
            seq: message.seq,
            ts: rfc3339(message.ts_ms),
            kind: message.kind,
            content: message.content.clone(),
            meta: message.meta.clone(),
        }
    }

    pub fn complete(session_id: SessionId, summary: &ExecutionSummary) -> Self {
        ServerFrame::ExecutionComplete {
            session_id,
            execution_id: summary.execution_id,
            status: summary.status,
            seq_start: summary.seq_start,
            seq_end: summary.seq_end,
            summary: Summary {
                turns: summary.turns,
                bytes_out: summary.bytes_out,
                wall_ms: summary.wall_ms(),
            },
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>, close: bool) -> Self {
        ServerFrame::Error { session_id: None, code: code.into(), message: message.into(), close }
    }
}

fn rfc3339(epoch_ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(epoch_ms as i64)
        .map(|ts| ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
