// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Slow consumer under drop-oldest: the parser never stalls, the slow
//! subscriber sees gaps, and seqs stay strictly increasing.

use amux_core::{
    AgentProfile, PrincipalId, SessionConfig, SessionState, SlowConsumerPolicy, StreamConfig,
    WorkspaceId,
};
use amux_engine::{Incident, Session, SessionPool};
use amux_stream::StreamItem;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn emit(json: &str) -> String {
    let len = (json.len() as u32).to_be_bytes();
    format!(
        "printf '\\{:03o}\\{:03o}\\{:03o}\\{:03o}'; printf '%s' '{}'",
        len[0], len[1], len[2], len[3], json
    )
}

#[tokio::test]
async fn drop_oldest_sheds_without_stalling_the_parser() {
    // Agent: handshake, then 200 rapid-fire texts and a completion.
    let mut script = emit(r#"{"type":"system","content":"ready"}"#);
    script.push_str("; sleep 0.3");
    for i in 0..200 {
        script.push_str("; ");
        script.push_str(&emit(&format!(r#"{{"type":"text","content":"burst {}"}}"#, i)));
    }
    script.push_str("; ");
    script.push_str(&emit(r#"{"type":"complete"}"#));
    script.push_str("; sleep 600");

    let (incident_tx, _incident_rx) = mpsc::channel::<Incident>(16);
    let pool = SessionPool::new(
        amux_core::PoolConfig::default(),
        SessionConfig {
            shutdown_grace: Duration::from_millis(100),
            term_grace: Duration::from_millis(300),
            probe_interval: Duration::from_secs(86_400),
            ..SessionConfig::default()
        },
        StreamConfig {
            slow_consumer_policy: SlowConsumerPolicy::DropOldest,
            subscriber_queue: 8,
            replay_buffer_messages: 100,
            ..StreamConfig::default()
        },
        amux_core::SystemClock,
        Arc::new(amux_core::NullSink),
        incident_tx,
    );

    let profile = AgentProfile::new("/bin/sh", PathBuf::from("/tmp"))
        .args(vec!["-c".into(), script]);
    let session: Arc<Session<_>> = pool
        .acquire(
            PrincipalId::from_string("usr-a"),
            WorkspaceId::from_string("wks-a"),
            profile,
        )
        .await
        .expect("acquire");

    let mut subscription = session.subscribe(None);
    let handle = session.acquire("burst please", CancellationToken::new()).await.expect("prompt");
    assert_eq!(session.state(), SessionState::Busy);

    // Read one item per 10ms: much slower than the burst.
    let mut seqs = Vec::new();
    let mut gaps = Vec::new();
    loop {
        tokio::time::sleep(Duration::from_millis(10)).await;
        match subscription.next().await {
            StreamItem::Message(m) => seqs.push(m.seq),
            StreamItem::Gap { from, to } => gaps.push((from, to)),
            StreamItem::ExecutionComplete(summary) => {
                assert_eq!(summary.status, amux_core::ExecStatus::Success);
                break;
            }
            StreamItem::Status(_) | StreamItem::ReplayGap { .. } => {}
            StreamItem::Closed(reason) => panic!("closed early: {}", reason),
        }
    }

    // The parser finished the whole burst (it never stalled), the slow
    // subscriber saw a strict subset with declared gaps.
    assert!(!gaps.is_empty(), "no gap was declared");
    assert!(seqs.len() < 201, "nothing was shed");
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(seqs, sorted, "seqs must be strictly increasing");
    // Gap ranges never overlap delivered seqs.
    for (from, to) in &gaps {
        assert!(from <= to);
        assert!(!seqs.iter().any(|s| s >= from && s <= to));
    }

    // Completion returned the session to idle.
    let summary = handle.wait().await.expect("summary");
    assert_eq!(summary.seq_end, 201);
    assert_eq!(session.state(), SessionState::Idle);

    pool.shutdown().await;
}
