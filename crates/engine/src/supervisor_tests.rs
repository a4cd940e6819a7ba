// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use amux_core::FakeClock;
use std::path::PathBuf;

/// Shell fragment that prints one length-prefixed JSON frame.
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
        shutdown_grace: Duration::from_millis(200),
        term_grace: Duration::from_millis(500),
        ..SessionConfig::default()
    }
}

const MAX_FRAME: usize = 1024 * 1024;

async fn start(
    script: &str,
    start_seq: u64,
) -> Result<(Supervisor, AgentStream<FakeClock>, Message), SupervisorError> {
    Supervisor::start(&profile(script), &quick_config(), MAX_FRAME, start_seq, FakeClock::new())
        .await
}

#[tokio::test]
async fn start_succeeds_on_ready_handshake() {
    let script = format!("{}; sleep 5", ready());
    let (supervisor, _stream, msg) = start(&script, 1).await.unwrap();

    assert_eq!(msg.seq, 1);
    assert_eq!(msg.kind, MessageKind::System);
    assert_eq!(msg.content, "ready");
    assert!(supervisor.alive());
    assert!(supervisor.pid() > 0);

    supervisor.terminate(&quick_config()).await;
    assert!(!supervisor.alive());
}

#[tokio::test]
async fn ready_message_continues_from_start_seq() {
    let script = format!("{}; sleep 5", ready());
    let (supervisor, stream, msg) = start(&script, 42).await.unwrap();
    assert_eq!(msg.seq, 42);
    assert_eq!(stream.cursor(), 42);
    supervisor.terminate(&quick_config()).await;
}

#[tokio::test]
async fn start_times_out_without_handshake() {
    let config = SessionConfig {
        start_deadline: Duration::from_millis(200),
        ..quick_config()
    };
    let result = Supervisor::start(
        &profile("sleep 5"),
        &config,
        MAX_FRAME,
        1,
        FakeClock::new(),
    )
    .await;
    match result {
        Err(SupervisorError::StartTimeout(d)) => assert_eq!(d, Duration::from_millis(200)),
        other => panic!("expected StartTimeout, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn start_rejects_wrong_first_message() {
    let script = format!("{}; sleep 1", emit(r#"{"type":"text","content":"hi"}"#));
    match start(&script, 1).await {
        Err(SupervisorError::BadHandshake { got }) => assert!(got.contains("text")),
        other => panic!("expected BadHandshake, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn start_reports_eof_when_agent_exits_silently() {
    match start("exit 3", 1).await {
        Err(SupervisorError::HandshakeEof) => {}
        other => panic!("expected HandshakeEof, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn spawn_failure_is_reported() {
    let profile = AgentProfile::new("/nonexistent/agent-binary", PathBuf::from("/tmp"));
    let result =
        Supervisor::start(&profile, &quick_config(), MAX_FRAME, 1, FakeClock::new()).await;
    assert!(matches!(result, Err(SupervisorError::SpawnFailed(_))));
}

#[tokio::test]
async fn streams_messages_after_ready() {
    let script = format!(
        "{}; {}; {}",
        ready(),
        emit(r#"{"type":"text","content":"hello"}"#),
        emit(r#"{"type":"complete"}"#),
    );
    let (supervisor, mut stream, _ready) = start(&script, 1).await.unwrap();

    match stream.next().await {
        Parsed::Message(m) => {
            assert_eq!(m.seq, 2);
            assert_eq!(m.content, "hello");
        }
        other => panic!("expected text, got {:?}", other),
    }
    match stream.next().await {
        Parsed::Message(m) => assert!(m.ends_execution()),
        other => panic!("expected complete, got {:?}", other),
    }
    assert!(matches!(stream.next().await, Parsed::Eof));
    supervisor.terminate(&quick_config()).await;
}

#[tokio::test]
async fn write_prompt_reports_body_length() {
    // The script ignores stdin but keeps the pipe open.
    let script = format!("{}; sleep 5", ready());
    let (supervisor, _stream, _ready) = start(&script, 1).await.unwrap();
    let written = supervisor.write_prompt("hello").await.unwrap();
    assert!(written > "hello".len());
    supervisor.terminate(&quick_config()).await;
}

#[tokio::test]
async fn write_prompt_fails_once_process_exited() {
    let script = format!("{}; exit 7", ready());
    let (supervisor, mut stream, _ready) = start(&script, 1).await.unwrap();
    assert!(matches!(stream.next().await, Parsed::Eof));

    // Give the reaper a beat to record the exit.
    tokio::time::sleep(Duration::from_millis(200)).await;
    match supervisor.write_prompt("too late").await {
        Err(SupervisorError::ProcessDead { status }) => assert_eq!(status, Some(7)),
        Err(SupervisorError::StdinBroken(_)) => {}
        other => panic!("expected dead process error, got {:?}", other.map(|_| ())),
    }
    assert_eq!(supervisor.exit_code(), Some(7));
}

#[tokio::test]
async fn terminate_escalates_to_sigkill_for_stubborn_agents() {
    // Trap TERM so only SIGKILL works; the sentinel is never read.
    let script = format!("trap '' TERM; {}; sleep 30", ready());
    let (supervisor, _stream, _ready) = start(&script, 1).await.unwrap();
    let started = std::time::Instant::now();
    supervisor.terminate(&quick_config()).await;
    assert!(!supervisor.alive());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn stderr_tail_is_captured() {
    let script = format!("echo 'agent warning: low disk' >&2; {}; sleep 5", ready());
    let (supervisor, _stream, _ready) = start(&script, 1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(supervisor.stderr_tail().contains("low disk"));
    supervisor.terminate(&quick_config()).await;
}

#[tokio::test]
async fn annotate_attaches_process_context() {
    let script = format!("echo oops >&2; {}; sleep 5", ready());
    let (supervisor, _stream, _ready) = start(&script, 1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let fault = supervisor.annotate(Fault::new(
        amux_core::FaultKind::Process,
        amux_core::Severity::High,
        "test",
    ));
    assert_eq!(fault.context.get("pid"), Some(&supervisor.pid().to_string()));
    assert!(fault.context.get("stderr_tail").map(|t| t.contains("oops")).unwrap_or(false));
    supervisor.terminate(&quick_config()).await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn health_samples_rss_for_live_process() {
    let script = format!("{}; sleep 5", ready());
    let (supervisor, _stream, _ready) = start(&script, 1).await.unwrap();
    let health = supervisor.health();
    assert!(health.alive);
    assert!(health.rss_bytes > 0);
    supervisor.terminate(&quick_config()).await;
}
