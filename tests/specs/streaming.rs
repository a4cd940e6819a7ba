// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Basic prompt streaming and replay-after-reconnect.

use super::support::*;

#[tokio::test]
async fn basic_prompt_single_subscriber() {
    // Agent: handshake, then one text + completion shortly after the
    // prompt lands.
    let script = format!("{}; sleep 0.3; {}; {}; sleep 600", ready(), text("hi"), complete());
    let td = start_daemon(&script, |config| {
        config.pool.min = 0;
        config.pool.max = 2;
    })
    .await;

    assert_eq!(td.daemon.pool().size(), 0);
    let (mut ws, session_id) = open_workspace(&td.url, "wks-web").await;
    assert_eq!(td.daemon.pool().size(), 1);

    send(
        &mut ws,
        serde_json::json!({
            "type": "session.message",
            "session_id": session_id,
            "content": "hello",
        }),
    )
    .await;

    // In order: the replayed ready handshake, the text, the completion.
    let (first, _) = recv_until(&mut ws, "message").await;
    assert_eq!(first["seq"], 1);
    assert_eq!(first["kind"], "system");
    assert_eq!(first["content"], "ready");

    let (second, _) = recv_until(&mut ws, "message").await;
    assert_eq!(second["seq"], 2);
    assert_eq!(second["kind"], "text");
    assert_eq!(second["content"], "hi");

    let (done, _) = recv_until(&mut ws, "execution.complete").await;
    assert_eq!(done["status"], "success");
    assert_eq!(done["seq_start"], 2);
    assert_eq!(done["seq_end"], 2);
    assert_eq!(done["session_id"].as_str(), Some(session_id.as_str()));

    // Executions are recorded through the repository.
    let session = amux_core::SessionId::from_string(&session_id);
    assert_eq!(td.repo.executions_of(session).len(), 1);

    td.shutdown().await;
}

#[tokio::test]
async fn pings_get_pongs() {
    let script = format!("{}; sleep 600", ready());
    let td = start_daemon(&script, |_| {}).await;
    let (mut ws, _session_id) = open_workspace(&td.url, "wks-ping").await;

    send(&mut ws, serde_json::json!({"type": "session.ping"})).await;
    let (pong, _) = recv_until(&mut ws, "session.pong").await;
    assert_eq!(pong["type"], "session.pong");
    td.shutdown().await;
}

#[tokio::test]
async fn replay_after_reconnect() {
    // Agent emits seqs 1..=50 (ready + 49 texts); the hub retains 20.
    let mut script = ready();
    for i in 2..=50 {
        script.push_str("; ");
        script.push_str(&text(&format!("m{}", i)));
    }
    script.push_str("; sleep 600");

    let td = start_daemon(&script, |config| {
        config.stream.replay_buffer_messages = 20;
        config.stream.replay_buffer_bytes = 1024 * 1024;
    })
    .await;

    let (mut owner, session_id) = open_workspace(&td.url, "wks-replay").await;
    // Drain until the last live message so the ring is fully settled.
    loop {
        let frame = recv(&mut owner).await;
        if frame["type"] == "message" && frame["seq"] == 50 {
            break;
        }
    }

    // Reconnect with a cursor inside the retained window.
    let mut late = connect(&td.url).await;
    send(
        &mut late,
        serde_json::json!({
            "type": "session.connect",
            "session_id": session_id,
            "auth": TOKEN,
            "cursor": 35,
        }),
    )
    .await;
    let (_, _) = recv_until(&mut late, "status").await;
    for expected in 35..=50u64 {
        let (frame, _) = recv_until(&mut late, "message").await;
        assert_eq!(frame["seq"], expected);
    }

    // A cursor older than the ring gets a replay-gap error first, then
    // the oldest retained seq onwards (31..=50).
    let mut stale = connect(&td.url).await;
    send(
        &mut stale,
        serde_json::json!({
            "type": "session.connect",
            "session_id": session_id,
            "auth": TOKEN,
            "cursor": 5,
        }),
    )
    .await;
    let (_, _) = recv_until(&mut stale, "status").await;
    let (first, _) = recv_until(&mut stale, "message").await;
    assert_eq!(first["kind"], "error");
    assert_eq!(first["meta"]["kind"], "replay_gap");
    assert_eq!(first["meta"]["oldest"], 31);
    for expected in 31..=50u64 {
        let (frame, _) = recv_until(&mut stale, "message").await;
        assert_eq!(frame["seq"], expected);
    }

    td.shutdown().await;
}

#[tokio::test]
async fn bad_token_is_refused() {
    let script = format!("{}; sleep 600", ready());
    let td = start_daemon(&script, |_| {}).await;

    let mut ws = connect(&td.url).await;
    send(
        &mut ws,
        serde_json::json!({
            "type": "session.connect",
            "workspace_id": "wks-a",
            "auth": "tok-wrong",
        }),
    )
    .await;
    let (error, _) = recv_until(&mut ws, "error").await;
    assert_eq!(error["code"], "auth_failed");
    assert_eq!(error["close"], true);
    td.shutdown().await;
}

#[tokio::test]
async fn denied_principal_cannot_attach() {
    let script = format!("{}; sleep 600", ready());
    let td = start_daemon(&script, |_| {}).await;
    // A token whose principal has no roles at all.
    td.repo.insert_token("tok-mallory", amux_core::PrincipalId::from_string("usr-mallory"));

    let mut ws = connect(&td.url).await;
    send(
        &mut ws,
        serde_json::json!({
            "type": "session.connect",
            "workspace_id": "wks-a",
            "auth": "tok-mallory",
        }),
    )
    .await;
    let (error, _) = recv_until(&mut ws, "error").await;
    assert_eq!(error["code"], "access_denied");
    td.shutdown().await;
}
