// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pool exhaustion with fair waiting: one release wakes exactly one
//! waiter, everyone else times out with `pool_exhausted`.

use amux_core::{
    AgentProfile, PoolConfig, PrincipalId, SessionConfig, StreamConfig, WorkspaceId,
};
use amux_engine::{Incident, PoolError, SessionPool};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn emit(json: &str) -> String {
    let len = (json.len() as u32).to_be_bytes();
    format!(
        "printf '\\{:03o}\\{:03o}\\{:03o}\\{:03o}'; printf '%s' '{}'",
        len[0], len[1], len[2], len[3], json
    )
}

fn idle_profile() -> AgentProfile {
    let script = format!("{}; sleep 600", emit(r#"{"type":"system","content":"ready"}"#));
    AgentProfile::new("/bin/sh", PathBuf::from("/tmp")).args(vec!["-c".into(), script])
}

#[tokio::test]
async fn exhausted_pool_waits_fairly() {
    let (incident_tx, _incident_rx) = mpsc::channel::<Incident>(16);
    let pool = SessionPool::new(
        PoolConfig {
            max: 2,
            warm_target: 0,
            acquire_deadline: Duration::from_millis(800),
            ..PoolConfig::default()
        },
        SessionConfig {
            shutdown_grace: Duration::from_millis(100),
            term_grace: Duration::from_millis(300),
            probe_interval: Duration::from_secs(86_400),
            ..SessionConfig::default()
        },
        StreamConfig::default(),
        amux_core::SystemClock,
        Arc::new(amux_core::NullSink),
        incident_tx,
    );
    let workspace = WorkspaceId::from_string("wks-shared");

    // Fill the pool: two sessions, both held.
    let first = pool
        .acquire(PrincipalId::from_string("usr-1"), workspace, idle_profile())
        .await
        .expect("first");
    let first_id = first.id();
    let _second = pool
        .acquire(PrincipalId::from_string("usr-2"), workspace, idle_profile())
        .await
        .expect("second");

    // Three more acquirers for distinct affinity keys all queue up.
    let mut waiters = Vec::new();
    for i in 3..6 {
        let pool = Arc::clone(&pool);
        waiters.push(tokio::spawn(async move {
            pool.acquire(
                PrincipalId::from_string(&format!("usr-{}", i)),
                WorkspaceId::from_string("wks-shared"),
                idle_profile(),
            )
            .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    // One release: exactly one waiter is woken with that session.
    pool.release(first).await;

    let mut granted = Vec::new();
    let mut exhausted = 0;
    for waiter in waiters {
        match waiter.await.expect("join") {
            Ok(session) => granted.push(session),
            Err(PoolError::Exhausted(_)) => exhausted += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(granted.len(), 1, "exactly one waiter is woken");
    assert_eq!(exhausted, 2, "the rest time out with pool_exhausted");
    assert_eq!(granted[0].id(), first_id, "the released session is handed over");
    assert!(pool.size() <= 2, "bounded pool: {}", pool.size());

    pool.shutdown().await;
}

#[tokio::test]
async fn resource_counters_accumulate_across_executions() {
    let (incident_tx, _incident_rx) = mpsc::channel::<Incident>(16);
    let pool = SessionPool::new(
        PoolConfig { warm_target: 0, ..PoolConfig::default() },
        SessionConfig {
            shutdown_grace: Duration::from_millis(100),
            term_grace: Duration::from_millis(300),
            probe_interval: Duration::from_secs(86_400),
            ..SessionConfig::default()
        },
        StreamConfig::default(),
        amux_core::SystemClock,
        Arc::new(amux_core::NullSink),
        incident_tx,
    );

    let script = format!(
        "{}; sleep 0.2; {}; {}; sleep 0.2; {}; {}; sleep 600",
        emit(r#"{"type":"system","content":"ready"}"#),
        emit(r#"{"type":"text","content":"first answer"}"#),
        emit(r#"{"type":"complete"}"#),
        emit(r#"{"type":"text","content":"second answer"}"#),
        emit(r#"{"type":"complete"}"#),
    );
    let profile =
        AgentProfile::new("/bin/sh", PathBuf::from("/tmp")).args(vec!["-c".into(), script]);
    let session = pool
        .acquire(PrincipalId::from_string("usr-a"), WorkspaceId::from_string("wks-a"), profile)
        .await
        .expect("acquire");

    for prompt in ["one", "two"] {
        let handle = session
            .acquire(prompt, tokio_util::sync::CancellationToken::new())
            .await
            .expect("prompt");
        handle.wait().await.expect("summary");
    }

    let usage = session.usage();
    assert!(usage.bytes_in > 0);
    assert!(usage.bytes_out >= "first answersecond answer".len() as u64);
    assert!(usage.turns_used >= 2);
    assert!(usage.wall_ms > 0);

    pool.shutdown().await;
}
