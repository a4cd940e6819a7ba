// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Crash mid-execution: the orchestrator restarts the process in place,
//! the session id survives, and seq numbering continues.

use super::support::*;

#[tokio::test]
async fn process_crash_mid_execution_restarts_in_place() {
    // First run: handshake, one text, then die. Later runs (after the
    // marker file exists) just idle, so recovery converges.
    let crash_then_idle = format!(
        "if [ -f restarted ]; then {}; sleep 600; \
         else touch restarted; {}; sleep 0.3; {}; exit 9; fi",
        ready(),
        ready(),
        text("partial"),
    );
    let td = start_daemon(&crash_then_idle, |config| {
        config.retry.max_attempts = 1;
    })
    .await;

    let (mut ws, session_id) = open_workspace(&td.url, "wks-crash").await;
    send(
        &mut ws,
        serde_json::json!({
            "type": "session.message",
            "session_id": session_id,
            "content": "go",
        }),
    )
    .await;

    // The execution fails when the subprocess dies.
    let (done, _) = recv_until(&mut ws, "execution.complete").await;
    assert_eq!(done["status"], "failed");
    assert_eq!(done["session_id"].as_str(), Some(session_id.as_str()));

    // Recovery: status terminating, then status ready, same session id,
    // and the replacement's messages continue the seq numbering (seqs 1
    // and 2 were spent before the crash).
    let mut saw_terminating = false;
    let mut saw_ready = false;
    let mut max_seq = 0u64;
    while !(saw_ready && max_seq >= 3) {
        let frame = recv(&mut ws).await;
        match frame["type"].as_str() {
            Some("status") => {
                assert_eq!(frame["session_id"].as_str(), Some(session_id.as_str()));
                match frame["state"].as_str() {
                    Some("terminating") => saw_terminating = true,
                    Some("ready") => {
                        assert!(saw_terminating, "terminating precedes ready");
                        saw_ready = true;
                    }
                    _ => {}
                }
            }
            Some("message") => {
                max_seq = max_seq.max(frame["seq"].as_u64().unwrap_or(0));
            }
            _ => {}
        }
    }

    // The session is usable again.
    assert_eq!(
        td.daemon.pool().find(amux_core::SessionId::from_string(&session_id)).map(|s| s.id()),
        Some(amux_core::SessionId::from_string(&session_id)),
    );

    td.shutdown().await;
}
