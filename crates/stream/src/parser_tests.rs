// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::frame::encode_frame;
use amux_core::FakeClock;
use std::io::Cursor;

fn frames(records: &[serde_json::Value]) -> Cursor<Vec<u8>> {
    let mut buf = Vec::new();
    for record in records {
        buf.extend_from_slice(&encode_frame(record.to_string().as_bytes()));
    }
    Cursor::new(buf)
}

fn parser(start_seq: u64) -> StreamParser<FakeClock> {
    StreamParser::new(4096, start_seq, FakeClock::new())
}

async fn expect_message<R: tokio::io::AsyncRead + Unpin>(
    p: &mut StreamParser<FakeClock>,
    reader: &mut R,
) -> Message {
    match p.next(reader).await {
        Parsed::Message(m) => m,
        other => panic!("expected message, got {:?}", other),
    }
}

#[tokio::test]
async fn parses_records_in_fifo_order_with_increasing_seq() {
    let mut reader = frames(&[
        serde_json::json!({"type": "system", "content": "ready"}),
        serde_json::json!({"type": "text", "content": "hello"}),
        serde_json::json!({"type": "complete"}),
    ]);
    let mut p = parser(1);

    let first = expect_message(&mut p, &mut reader).await;
    assert_eq!(first.seq, 1);
    assert_eq!(first.kind, MessageKind::System);
    assert_eq!(first.content, "ready");

    let second = expect_message(&mut p, &mut reader).await;
    assert_eq!(second.seq, 2);
    assert_eq!(second.kind, MessageKind::Text);

    // Completion markers ride on the cursor without consuming a seq.
    let third = expect_message(&mut p, &mut reader).await;
    assert_eq!(third.seq, 2);
    assert!(third.ends_execution());
    assert_eq!(p.next_seq(), 3);

    assert!(matches!(p.next(&mut reader).await, Parsed::Eof));
}

#[tokio::test]
async fn seq_continues_from_injected_cursor() {
    let mut reader = frames(&[serde_json::json!({"type": "text", "content": "after restart"})]);
    let mut p = parser(11);
    let msg = expect_message(&mut p, &mut reader).await;
    assert_eq!(msg.seq, 11);
    assert_eq!(p.cursor(), 11);
    assert_eq!(p.next_seq(), 12);
}

#[tokio::test]
async fn start_seq_zero_is_promoted_to_one() {
    let p = parser(0);
    assert_eq!(p.next_seq(), 1);
}

#[tokio::test]
async fn meta_and_id_are_carried() {
    let mut reader = frames(&[serde_json::json!({
        "type": "tool_use",
        "id": "call-9",
        "content": "ls",
        "meta": {"tool": "bash"},
    })]);
    let mut p = parser(1);
    let msg = expect_message(&mut p, &mut reader).await;
    assert_eq!(msg.meta["tool"], "bash");
    assert_eq!(msg.meta["id"], "call-9");
}

#[tokio::test]
async fn unknown_type_poisons_with_protocol_error() {
    let mut reader = frames(&[
        serde_json::json!({"type": "telepathy", "content": "?"}),
        serde_json::json!({"type": "text", "content": "never read"}),
    ]);
    let mut p = parser(5);

    match p.next(&mut reader).await {
        Parsed::Poison(msg) => {
            assert_eq!(msg.seq, 5);
            assert_eq!(msg.kind, MessageKind::Error);
            assert!(msg.content.contains("telepathy"));
            assert_eq!(msg.meta["kind"], "protocol");
        }
        other => panic!("expected poison, got {:?}", other),
    }
    // Poisoned: the rest of the stream is not consumed.
    assert!(matches!(p.next(&mut reader).await, Parsed::Eof));
}

#[tokio::test]
async fn invalid_json_poisons() {
    let mut buf = Vec::new();
    buf.extend_from_slice(&encode_frame(b"{not json"));
    let mut reader = Cursor::new(buf);
    let mut p = parser(1);
    assert!(matches!(p.next(&mut reader).await, Parsed::Poison(_)));
}

#[tokio::test]
async fn invalid_utf8_poisons() {
    let mut buf = Vec::new();
    buf.extend_from_slice(&encode_frame(&[0xff, 0xfe, 0x7b]));
    let mut reader = Cursor::new(buf);
    let mut p = parser(1);
    match p.next(&mut reader).await {
        Parsed::Poison(msg) => assert!(msg.content.to_lowercase().contains("utf-8")),
        other => panic!("expected poison, got {:?}", other),
    }
}

#[tokio::test]
async fn oversized_frame_poisons() {
    let mut p = StreamParser::new(8, 1, FakeClock::new());
    let mut reader = frames(&[serde_json::json!({"type": "text", "content": "too big"})]);
    match p.next(&mut reader).await {
        Parsed::Poison(msg) => assert!(msg.content.contains("cap")),
        other => panic!("expected poison, got {:?}", other),
    }
}

#[tokio::test]
async fn truncated_stream_poisons() {
    let mut data = encode_frame(br#"{"type":"text","content":"partial"}"#);
    data.truncate(10);
    let mut reader = Cursor::new(data);
    let mut p = parser(1);
    assert!(matches!(p.next(&mut reader).await, Parsed::Poison(_)));
}

#[tokio::test]
async fn missing_content_defaults_to_empty() {
    let mut reader = frames(&[serde_json::json!({"type": "complete"})]);
    let mut p = parser(1);
    let msg = expect_message(&mut p, &mut reader).await;
    assert_eq!(msg.content, "");
}

#[tokio::test]
async fn timestamps_come_from_the_clock() {
    let clock = FakeClock::new();
    clock.set_epoch_ms(123_456);
    let mut p = StreamParser::new(4096, 1, clock);
    let mut reader = frames(&[serde_json::json!({"type": "text", "content": "x"})]);
    let msg = expect_message(&mut p, &mut reader).await;
    assert_eq!(msg.ts_ms, 123_456);
}
