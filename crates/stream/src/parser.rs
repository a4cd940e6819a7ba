// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stream parser: framed bytes → sequenced messages.
//!
//! Consumes a subprocess stdout stream frame by frame and yields
//! [`Message`] values with a strictly increasing per-session `seq`.
//! The start cursor is injected so the numbering survives process
//! restarts. The first framing or schema violation yields a single
//! synthetic protocol-error message and poisons the parser; the
//! supervisor must be restarted.

use crate::frame::{read_frame, FrameError};
use amux_core::{Clock, Message, MessageKind, SystemClock};
use serde::Deserialize;
use tokio::io::AsyncRead;

/// JSON body of one subprocess record.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub meta: Option<serde_json::Map<String, serde_json::Value>>,
}

/// One step of the parsed sequence.
#[derive(Debug)]
pub enum Parsed {
    Message(Message),
    /// The stream ended cleanly at a frame boundary.
    Eof,
    /// Protocol violation. Carries the synthetic error message; every
    /// subsequent call returns `Eof`.
    Poison(Message),
}

pub struct StreamParser<C: Clock = SystemClock> {
    max_frame: usize,
    /// Seq to assign to the next emitted message.
    next_seq: u64,
    clock: C,
    poisoned: bool,
}

impl<C: Clock> StreamParser<C> {
    /// `start_seq` is the first seq this parser will assign; pass the
    /// predecessor's cursor + 1 when restarting a process.
    pub fn new(max_frame: usize, start_seq: u64, clock: C) -> Self {
        Self { max_frame, next_seq: start_seq.max(1), clock, poisoned: false }
    }

    /// Seq the next emitted message will carry.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Last seq already emitted, 0 if none.
    pub fn cursor(&self) -> u64 {
        self.next_seq - 1
    }

    /// Pull the next message off the stream. FIFO, one frame per call.
    pub async fn next<R>(&mut self, reader: &mut R) -> Parsed
    where
        R: AsyncRead + Unpin,
    {
        if self.poisoned {
            return Parsed::Eof;
        }

        let body = match read_frame(reader, self.max_frame).await {
            Ok(Some(body)) => body,
            Ok(None) => return Parsed::Eof,
            Err(err) => return self.poison(err),
        };

        // UTF-8 is validated before JSON so the two failure modes stay
        // distinguishable in the fault context.
        if let Err(err) = std::str::from_utf8(&body) {
            return self.poison(FrameError::Utf8(err));
        }

        let record: RawRecord = match serde_json::from_slice(&body) {
            Ok(record) => record,
            Err(err) => return self.poison(FrameError::Json(err)),
        };

        let kind: MessageKind = match serde_json::from_value(serde_json::Value::String(
            record.kind.clone(),
        )) {
            Ok(kind) => kind,
            Err(_) => {
                return self.poison_message(format!("unknown message type: {}", record.kind))
            }
        };

        // `complete` records terminate the execution but are not
        // delivered as message frames, so they do not consume a seq.
        let seq = if kind == MessageKind::Complete { self.cursor() } else { self.take_seq() };
        let mut message =
            Message::new(seq, kind, record.content.unwrap_or_default(), self.clock.epoch_ms());
        if let Some(meta) = record.meta {
            message = message.with_meta(meta);
        }
        if let Some(id) = record.id {
            message.meta.insert("id".into(), serde_json::Value::String(id));
        }
        Parsed::Message(message)
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn poison(&mut self, err: FrameError) -> Parsed {
        self.poison_message(err.to_string())
    }

    fn poison_message(&mut self, detail: String) -> Parsed {
        self.poisoned = true;
        tracing::warn!(%detail, "stream poisoned by protocol violation");
        let mut message =
            Message::new(self.take_seq(), MessageKind::Error, detail, self.clock.epoch_ms());
        message
            .meta
            .insert("kind".into(), serde_json::Value::String("protocol".into()));
        Parsed::Poison(message)
    }
}

#[cfg(test)]
#[path = "parser_tests.rs"]
mod tests;
