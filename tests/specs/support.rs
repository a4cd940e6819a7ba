// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixture: an in-process daemon wired to an in-memory
//! repository, host-directory containers, and a `/bin/sh` fake agent
//! that speaks the 4-byte length-prefixed JSON framing.

use amux_core::PrincipalId;
use amux_daemon::{Daemon, DaemonConfig, HostContainers, MemoryRepository};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const TOKEN: &str = "tok-alice";

/// Shell fragment that prints one framed JSON record.
pub fn emit(json: &str) -> String {
    let len = (json.len() as u32).to_be_bytes();
    format!(
        "printf '\\{:03o}\\{:03o}\\{:03o}\\{:03o}'; printf '%s' '{}'",
        len[0], len[1], len[2], len[3], json
    )
}

pub fn ready() -> String {
    emit(r#"{"type":"system","content":"ready"}"#)
}

pub fn text(content: &str) -> String {
    emit(&format!(r#"{{"type":"text","content":"{}"}}"#, content))
}

pub fn complete() -> String {
    emit(r#"{"type":"complete"}"#)
}

const ROLES: &str = r#"
version = 1

[[role]]
name = "developer"

[[role.permission]]
resource_type = "workspace"
action = "attach"
effect = "allow"

[[role.permission]]
resource_type = "session"
action = "attach"
effect = "allow"
"#;

pub struct TestDaemon {
    pub daemon: Daemon,
    pub repo: Arc<MemoryRepository>,
    pub url: String,
    _tmp: tempfile::TempDir,
}

impl TestDaemon {
    pub async fn shutdown(&self) {
        self.daemon.shutdown().await;
    }
}

/// Boot a daemon whose agent runs `script` under `/bin/sh -c`.
pub async fn start_daemon(
    script: &str,
    tweak: impl FnOnce(&mut DaemonConfig),
) -> TestDaemon {
    let tmp = tempfile::tempdir().expect("tempdir");
    let roles_path = tmp.path().join("roles.toml");
    std::fs::write(&roles_path, ROLES).expect("roles file");

    let mut config = DaemonConfig::default();
    config.listen = "127.0.0.1:0".to_string();
    config.state_dir = tmp.path().to_path_buf();
    config.policy_file = Some(roles_path);
    config.agent.command = "/bin/sh".to_string();
    config.agent.args = vec!["-c".to_string(), script.to_string()];
    config.session.shutdown_grace = Duration::from_millis(100);
    config.session.term_grace = Duration::from_millis(300);
    config.session.probe_interval = Duration::from_secs(86_400);
    tweak(&mut config);

    let repo = MemoryRepository::new();
    let principal = PrincipalId::from_string("usr-alice");
    repo.insert_token(TOKEN, principal);
    repo.insert_roles(principal, vec!["developer".to_string()]);

    let containers = Arc::new(HostContainers::new(config.workspace_root()));
    let daemon = Daemon::start(config, repo.clone(), containers).await.expect("daemon start");
    let url = format!("ws://{}", daemon.local_addr());
    TestDaemon { daemon, repo, url, _tmp: tmp }
}

pub async fn connect(url: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.expect("ws connect");
    ws
}

pub async fn send(ws: &mut Ws, frame: serde_json::Value) {
    ws.send(WsMessage::text(frame.to_string())).await.expect("ws send");
}

/// Next JSON text frame, with a generous deadline.
pub async fn recv(ws: &mut Ws) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("frame deadline")
            .expect("socket open")
            .expect("frame ok");
        match frame {
            WsMessage::Text(text) => {
                return serde_json::from_str(&text).expect("json frame");
            }
            WsMessage::Close(_) => panic!("socket closed while waiting for a frame"),
            _ => continue,
        }
    }
}

/// Receive until a frame of `type` arrives, returning it. Other frames
/// are collected and returned alongside.
pub async fn recv_until(ws: &mut Ws, kind: &str) -> (serde_json::Value, Vec<serde_json::Value>) {
    let mut before = Vec::new();
    loop {
        let frame = recv(ws).await;
        if frame["type"] == kind {
            return (frame, before);
        }
        before.push(frame);
    }
}

/// Standard opening: connect to a fresh workspace session with replay
/// from seq 1, returning the socket and the session id.
pub async fn open_workspace(url: &str, workspace: &str) -> (Ws, String) {
    let mut ws = connect(url).await;
    send(
        &mut ws,
        serde_json::json!({
            "type": "session.connect",
            "workspace_id": workspace,
            "auth": TOKEN,
            "cursor": 1,
        }),
    )
    .await;
    let (status, _) = recv_until(&mut ws, "status").await;
    let session_id = status["session_id"].as_str().expect("session id").to_string();
    (ws, session_id)
}
