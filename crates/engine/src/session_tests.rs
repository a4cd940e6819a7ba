// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use amux_core::{CaptureSink, FakeClock};
use amux_stream::StreamItem;
use std::path::PathBuf;

fn emit(json: &str) -> String {
    let len = (json.len() as u32).to_be_bytes();
    format!(
        "printf '\\{:03o}\\{:03o}\\{:03o}\\{:03o}'; printf '%s' '{}'",
        len[0], len[1], len[2], len[3], json
    )
}

fn ready() -> String {
    emit(r#"{"type":"system","content":"ready"}"#)
}

fn profile(script: &str) -> AgentProfile {
    AgentProfile::new("/bin/sh", PathBuf::from("/tmp"))
        .args(vec!["-c".into(), script.to_string()])
}

fn quick_config() -> SessionConfig {
    SessionConfig {
        start_deadline: Duration::from_secs(5),
        shutdown_grace: Duration::from_millis(100),
        term_grace: Duration::from_millis(300),
        ..SessionConfig::default()
    }
}

struct Harness {
    session: Arc<Session<FakeClock>>,
    sink: CaptureSink,
    incidents: mpsc::Receiver<Incident>,
}

async fn start_session(script: &str) -> Harness {
    start_session_with(script, quick_config()).await
}

async fn start_session_with(script: &str, config: SessionConfig) -> Harness {
    let sink = CaptureSink::new();
    let (incident_tx, incidents) = mpsc::channel(8);
    let (session, ready_rx) = Session::spawn(
        SessionId::generate(),
        WorkspaceId::from_string("wks-test"),
        PrincipalId::from_string("usr-test"),
        profile(script),
        config,
        StreamConfig::default(),
        FakeClock::new(),
        Arc::new(sink.clone()),
        incident_tx,
        1,
    );
    ready_rx.await.unwrap().unwrap();
    Harness { session, sink, incidents }
}

async fn collect_until_complete(sub: &mut amux_stream::Subscription) -> (Vec<Message>, ExecutionSummary) {
    let mut messages = Vec::new();
    loop {
        match sub.next().await {
            StreamItem::Message(m) => messages.push((*m).clone()),
            StreamItem::ExecutionComplete(summary) => return (messages, summary),
            StreamItem::Status(_) | StreamItem::Gap { .. } | StreamItem::ReplayGap { .. } => {}
            StreamItem::Closed(reason) => panic!("stream closed early: {}", reason),
        }
    }
}

#[tokio::test]
async fn prompt_flows_to_completion_with_ordered_seqs() {
    let script = format!(
        "{}; sleep 0.2; {}; {}; sleep 5",
        ready(),
        emit(r#"{"type":"text","content":"hi"}"#),
        emit(r#"{"type":"complete"}"#),
    );
    let h = start_session(&script).await;
    assert_eq!(h.session.state(), SessionState::Ready);

    let mut sub = h.session.subscribe(Some(1));
    let handle = h.session.acquire("hello", CancellationToken::new()).await.unwrap();
    assert_eq!(h.session.state(), SessionState::Busy);

    let (messages, summary) = collect_until_complete(&mut sub).await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].seq, 1);
    assert_eq!(messages[0].kind, MessageKind::System);
    assert_eq!(messages[0].content, "ready");
    assert_eq!(messages[1].seq, 2);
    assert_eq!(messages[1].content, "hi");

    assert_eq!(summary.status, ExecStatus::Success);
    assert_eq!(summary.seq_start, 2);
    assert_eq!(summary.seq_end, 2);

    let waited = handle.wait().await.unwrap();
    assert_eq!(waited.execution_id, summary.execution_id);
    assert_eq!(h.session.state(), SessionState::Idle);

    let usage = h.session.usage();
    assert!(usage.bytes_in > 0);
    assert!(usage.bytes_out > 0);
    h.session.terminate().await;
}

#[tokio::test]
async fn busy_session_rejects_second_prompt() {
    let script = format!("{}; sleep 5", ready());
    let h = start_session(&script).await;
    let _handle = h.session.acquire("first", CancellationToken::new()).await.unwrap();
    match h.session.acquire("second", CancellationToken::new()).await {
        Err(SessionError::NotAcquirable(SessionState::Busy)) => {}
        other => panic!("expected busy rejection, got {:?}", other.map(|_| ())),
    }
    h.session.terminate().await;
}

#[tokio::test]
async fn consecutive_executions_reuse_the_session() {
    let script = format!(
        "{}; sleep 0.2; {}; {}; sleep 0.2; {}; {}; sleep 5",
        ready(),
        emit(r#"{"type":"text","content":"one"}"#),
        emit(r#"{"type":"complete"}"#),
        emit(r#"{"type":"text","content":"two"}"#),
        emit(r#"{"type":"complete"}"#),
    );
    let h = start_session(&script).await;

    let first = h.session.acquire("a", CancellationToken::new()).await.unwrap();
    let first = first.wait().await.unwrap();
    assert_eq!(first.seq_start, 2);
    assert_eq!(first.seq_end, 2);

    let second = h.session.acquire("b", CancellationToken::new()).await.unwrap();
    let second = second.wait().await.unwrap();
    assert_eq!(second.status, ExecStatus::Success);
    assert_eq!(second.seq_start, 3);
    assert_eq!(second.seq_end, 3);
    h.session.terminate().await;
}

#[tokio::test]
async fn process_death_mid_execution_fails_it_and_reports_process_fault() {
    let script = format!(
        "{}; sleep 0.2; {}; exit 9",
        ready(),
        emit(r#"{"type":"text","content":"partial"}"#),
    );
    let mut h = start_session(&script).await;
    let mut sub = h.session.subscribe(None);
    let handle = h.session.acquire("go", CancellationToken::new()).await.unwrap();

    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.status, ExecStatus::Failed);

    let incident = h.incidents.recv().await.unwrap();
    assert_eq!(incident.fault.kind, FaultKind::Process);
    assert_eq!(incident.session, Some(h.session.id()));
    assert!(incident.fault.context.contains_key("pid"));

    assert_eq!(h.session.state(), SessionState::Terminating);
    // Subscribers stay attached and see the terminating status.
    let mut saw_terminating = false;
    while let Some(item) = sub.try_next() {
        if matches!(item, StreamItem::Status(SessionState::Terminating)) {
            saw_terminating = true;
        }
    }
    assert!(saw_terminating);
}

#[tokio::test]
async fn restart_process_preserves_id_and_seq_cursor() {
    let script = format!(
        "{}; sleep 0.2; {}; exit 1",
        ready(),
        emit(r#"{"type":"text","content":"before crash"}"#),
    );
    let mut h = start_session(&script).await;
    let id_before = h.session.id();
    let handle = h.session.acquire("go", CancellationToken::new()).await.unwrap();
    let _ = handle.wait().await.unwrap();
    let _ = h.incidents.recv().await.unwrap();
    assert_eq!(h.session.state(), SessionState::Terminating);

    let mut sub = h.session.subscribe(None);
    h.session.restart_process().await.unwrap();
    assert_eq!(h.session.state(), SessionState::Ready);
    assert_eq!(h.session.id(), id_before);

    // The replacement's ready handshake continues the numbering:
    // seqs 1 (ready) and 2 (text) were used before the crash.
    let mut ready_seq = None;
    for _ in 0..4 {
        match sub.next().await {
            StreamItem::Message(m) if m.kind == MessageKind::System => {
                ready_seq = Some(m.seq);
                break;
            }
            StreamItem::Status(_) => continue,
            other => panic!("unexpected item {:?}", other),
        }
    }
    assert_eq!(ready_seq, Some(3));
    h.session.terminate().await;
}

#[tokio::test]
async fn cancel_finishes_execution_as_cancelled() {
    let script = format!("{}; sleep 5", ready());
    let h = start_session(&script).await;
    let handle = h.session.acquire("work", CancellationToken::new()).await.unwrap();
    handle.cancel();
    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.status, ExecStatus::Cancelled);
    // No messages were emitted: the seq range is empty.
    assert!(summary.seq_start > summary.seq_end);
    assert_eq!(h.session.state(), SessionState::Idle);
    h.session.terminate().await;
}

#[tokio::test]
async fn silent_agent_times_out_on_first_message_deadline() {
    let script = format!("{}; sleep 30", ready());
    let config = SessionConfig {
        first_message_deadline: Duration::from_millis(300),
        execution_deadline: Duration::from_secs(30),
        ..quick_config()
    };
    let mut h = start_session_with(&script, config).await;
    let handle = h.session.acquire("anyone there", CancellationToken::new()).await.unwrap();
    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.status, ExecStatus::Timeout);

    let incident = h.incidents.recv().await.unwrap();
    assert_eq!(incident.fault.kind, FaultKind::Timeout);
    assert_eq!(h.session.state(), SessionState::Idle, "session survives a timeout");
    h.session.terminate().await;
}

#[tokio::test]
async fn terminate_closes_the_hub_and_ends_the_session() {
    let script = format!("{}; sleep 5", ready());
    let h = start_session(&script).await;
    let mut sub = h.session.subscribe(None);
    h.session.terminate().await;
    assert_eq!(h.session.state(), SessionState::Ended);

    // Subscriber drains to the terminal sentinel.
    loop {
        match sub.next().await {
            StreamItem::Closed(reason) => {
                assert_eq!(reason, amux_stream::CloseReason::SessionClosed);
                break;
            }
            _ => continue,
        }
    }
    assert_eq!(h.session.subscriber_count(), 0);
}

#[tokio::test]
async fn probe_succeeds_while_agent_is_alive() {
    let script = format!("{}; sleep 5", ready());
    let h = start_session(&script).await;
    assert!(h.session.probe().await);
    h.session.terminate().await;
    assert!(!h.session.probe().await);
}

#[tokio::test]
async fn start_failure_marks_session_failed() {
    let sink = CaptureSink::new();
    let (incident_tx, mut incidents) = mpsc::channel(8);
    let (session, ready_rx) = Session::spawn(
        SessionId::generate(),
        WorkspaceId::from_string("wks-test"),
        PrincipalId::from_string("usr-test"),
        AgentProfile::new("/nonexistent/agent", PathBuf::from("/tmp")),
        quick_config(),
        StreamConfig::default(),
        FakeClock::new(),
        Arc::new(sink),
        incident_tx,
        1,
    );
    let fault = ready_rx.await.unwrap().unwrap_err();
    assert_eq!(fault.kind, FaultKind::Process);
    assert_eq!(session.state(), SessionState::Failed);
    let incident = incidents.recv().await.unwrap();
    assert_eq!(incident.source.to_string(), "supervisor");
}

#[tokio::test]
async fn state_audit_trail_is_emitted() {
    let script = format!(
        "{}; sleep 0.2; {}; sleep 5",
        ready(),
        emit(r#"{"type":"complete"}"#),
    );
    let h = start_session(&script).await;
    let handle = h.session.acquire("x", CancellationToken::new()).await.unwrap();
    let _ = handle.wait().await.unwrap();

    let states: Vec<(SessionState, SessionState)> = h
        .sink
        .tagged("session:state")
        .into_iter()
        .filter_map(|e| match e {
            amux_core::AuditEvent::SessionState { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert!(states.contains(&(SessionState::Pending, SessionState::Ready)));
    assert!(states.contains(&(SessionState::Ready, SessionState::Busy)));
    assert!(states.contains(&(SessionState::Busy, SessionState::Idle)));
    h.session.terminate().await;
}

#[tokio::test]
async fn affinity_key_reflects_profile_fingerprint() {
    let script = format!("{}; sleep 5", ready());
    let h = start_session(&script).await;
    assert_eq!(h.session.affinity().principal, PrincipalId::from_string("usr-test"));
    assert_eq!(h.session.affinity().fingerprint, h.session.profile().fingerprint());
    h.session.terminate().await;
}
