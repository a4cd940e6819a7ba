// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process supervisor: owns one agent subprocess.
//!
//! Spawns the CLI with the profile's argv, cwd, and an isolated
//! environment, then declares success only once the agent's first
//! framed message is `system:ready`. Stdin writes are serialized behind
//! an async mutex; stderr is captured into a rolling 64 KiB tail that
//! rides along on every process-kind fault. Termination escalates:
//! in-band shutdown sentinel, SIGTERM, SIGKILL.

use amux_core::{AgentProfile, Clock, Fault, Message, MessageKind, SessionConfig, SystemClock};
use amux_stream::{write_record, Parsed, StreamParser};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Notify;

/// Rolling stderr retention.
const STDERR_TAIL_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn agent: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("agent did not complete the ready handshake within {0:?}")]
    StartTimeout(Duration),

    #[error("agent handshake was {got}, expected system:ready")]
    BadHandshake { got: String },

    #[error("agent stdout closed before the ready handshake")]
    HandshakeEof,

    #[error("stdin write failed: {0}")]
    StdinBroken(#[source] std::io::Error),

    #[error("process dead: agent exited with status {status:?}")]
    ProcessDead { status: Option<i32> },

    #[error("probe not acknowledged within {0:?}")]
    ProbeTimeout(Duration),

    #[error("agent rss {rss} exceeds ceiling {ceiling}")]
    ResourceExceeded { rss: u64, ceiling: u64 },
}

/// Point-in-time process health sample. `last_message_age` is tracked
/// by the session, which owns the parse loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessHealth {
    pub alive: bool,
    pub rss_bytes: u64,
    pub cpu_pct: f32,
}

/// The supervisor's half of stdout: framed bytes → sequenced messages.
/// Single consumer, owned by the session's parse loop.
pub struct AgentStream<C: Clock = SystemClock> {
    stdout: BufReader<ChildStdout>,
    parser: StreamParser<C>,
}

impl<C: Clock> AgentStream<C> {
    pub async fn next(&mut self) -> Parsed {
        self.parser.next(&mut self.stdout).await
    }

    /// Last seq emitted; the replacement parser starts at cursor + 1.
    pub fn cursor(&self) -> u64 {
        self.parser.cursor()
    }
}

struct ExitCell {
    status: Mutex<Option<std::process::ExitStatus>>,
    exited: Notify,
}

impl ExitCell {
    fn get(&self) -> Option<std::process::ExitStatus> {
        *self.status.lock()
    }
}

struct CpuSample {
    at: Instant,
    jiffies: u64,
}

pub struct Supervisor {
    pid: u32,
    max_frame: usize,
    /// Writer mutex: prompt writes are serialized.
    stdin: tokio::sync::Mutex<BufWriter<ChildStdin>>,
    exit: Arc<ExitCell>,
    stderr_tail: Arc<Mutex<VecDeque<u8>>>,
    cpu_prev: Mutex<Option<CpuSample>>,
}

impl Supervisor {
    /// Spawn the agent and wait for its `system:ready` handshake.
    ///
    /// `start_seq` seeds the parser so seq numbering survives process
    /// restarts. On success the ready message (already sequenced) is
    /// returned for publication.
    pub async fn start<C: Clock>(
        profile: &AgentProfile,
        config: &SessionConfig,
        max_frame: usize,
        start_seq: u64,
        clock: C,
    ) -> Result<(Self, AgentStream<C>, Message), SupervisorError> {
        let mut cmd = Command::new(&profile.command);
        cmd.args(&profile.args)
            .current_dir(&profile.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Isolate the environment: only PATH leaks through unless the
        // profile overrides it.
        cmd.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        for (key, value) in &profile.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(SupervisorError::SpawnFailed)?;
        let pid = child.id().unwrap_or_default();

        let stdin = child.stdin.take().ok_or_else(|| {
            SupervisorError::SpawnFailed(std::io::Error::other("agent stdin unavailable"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SupervisorError::SpawnFailed(std::io::Error::other("agent stdout unavailable"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            SupervisorError::SpawnFailed(std::io::Error::other("agent stderr unavailable"))
        })?;

        let stderr_tail: Arc<Mutex<VecDeque<u8>>> = Arc::new(Mutex::new(VecDeque::new()));
        tokio::spawn(pump_stderr(stderr, Arc::clone(&stderr_tail)));

        let exit = Arc::new(ExitCell { status: Mutex::new(None), exited: Notify::new() });
        tokio::spawn(reap(child, Arc::clone(&exit)));

        let supervisor = Self {
            pid,
            max_frame,
            stdin: tokio::sync::Mutex::new(BufWriter::new(stdin)),
            exit,
            stderr_tail,
            cpu_prev: Mutex::new(None),
        };
        let mut stream = AgentStream {
            stdout: BufReader::new(stdout),
            parser: StreamParser::new(max_frame, start_seq, clock),
        };

        let ready = match tokio::time::timeout(config.start_deadline, stream.next()).await {
            Err(_) => {
                supervisor.kill_now();
                return Err(SupervisorError::StartTimeout(config.start_deadline));
            }
            Ok(Parsed::Eof) => {
                supervisor.kill_now();
                return Err(SupervisorError::HandshakeEof);
            }
            Ok(Parsed::Poison(msg)) => {
                supervisor.kill_now();
                return Err(SupervisorError::BadHandshake { got: format!("error: {}", msg.content) });
            }
            Ok(Parsed::Message(msg)) => {
                if msg.kind == MessageKind::System && msg.content == "ready" {
                    msg
                } else {
                    supervisor.kill_now();
                    return Err(SupervisorError::BadHandshake {
                        got: format!("{}:{}", msg.kind, msg.content),
                    });
                }
            }
        };

        tracing::info!(pid, command = %profile.command, "agent ready");
        Ok((supervisor, stream, ready))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn alive(&self) -> bool {
        self.exit.get().is_none()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit.get().and_then(|s| s.code())
    }

    /// Forward a prompt record to the agent's stdin. Returns the body
    /// length written, for bytes-in accounting.
    pub async fn write_prompt(&self, text: &str) -> Result<usize, SupervisorError> {
        self.write_json(&serde_json::json!({ "type": "prompt", "content": text })).await
    }

    /// Inject a no-op liveness probe.
    pub async fn write_probe(&self) -> Result<usize, SupervisorError> {
        self.write_json(&serde_json::json!({ "type": "system", "content": "probe" })).await
    }

    /// Cooperative interrupt for the current execution.
    pub async fn write_cancel(&self) -> Result<usize, SupervisorError> {
        self.write_json(&serde_json::json!({ "type": "cancel" })).await
    }

    async fn write_json(&self, record: &serde_json::Value) -> Result<usize, SupervisorError> {
        if let Some(status) = self.exit.get() {
            return Err(SupervisorError::ProcessDead { status: status.code() });
        }
        let body_len = record.to_string().len();
        let mut stdin = self.stdin.lock().await;
        write_record(&mut *stdin, record, self.max_frame).await.map_err(|e| match e {
            amux_stream::FrameError::Io(io) => SupervisorError::StdinBroken(io),
            other => SupervisorError::StdinBroken(std::io::Error::other(other.to_string())),
        })?;
        Ok(body_len)
    }

    /// Terminate the agent: shutdown sentinel, cooperative wait, then
    /// SIGTERM, then SIGKILL. Never leaves a running child behind.
    pub async fn terminate(&self, config: &SessionConfig) -> Option<i32> {
        if self.exit.get().is_none() {
            let _ = self.write_json(&serde_json::json!({ "type": "shutdown" })).await;
            if self.wait_exit(config.shutdown_grace).await {
                return self.exit_code();
            }
            self.signal(Signal::SIGTERM);
            if self.wait_exit(config.term_grace).await {
                return self.exit_code();
            }
            tracing::warn!(pid = self.pid, "agent ignored SIGTERM, killing");
            self.signal(Signal::SIGKILL);
            self.wait_exit(Duration::from_secs(2)).await;
        }
        self.exit_code()
    }

    /// Immediate SIGKILL, used on failed handshakes.
    fn kill_now(&self) {
        self.signal(Signal::SIGKILL);
    }

    fn signal(&self, signal: Signal) {
        if self.pid == 0 || self.exit.get().is_some() {
            return;
        }
        if let Err(err) = kill(Pid::from_raw(self.pid as i32), signal) {
            tracing::debug!(pid = self.pid, %err, "signal delivery failed");
        }
    }

    async fn wait_exit(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.exit.get().is_some() {
                return true;
            }
            if tokio::time::timeout_at(deadline, self.exit.exited.notified()).await.is_err() {
                return self.exit.get().is_some();
            }
        }
    }

    /// Non-blocking health sample from /proc.
    pub fn health(&self) -> ProcessHealth {
        ProcessHealth {
            alive: self.alive(),
            rss_bytes: read_rss(self.pid),
            cpu_pct: self.sample_cpu(),
        }
    }

    /// Last 64 KiB of stderr, lossily decoded.
    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock();
        let bytes: Vec<u8> = tail.iter().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Attach pid, exit status, and the stderr tail to a fault.
    pub fn annotate(&self, fault: Fault) -> Fault {
        let mut fault = fault.context("pid", self.pid.to_string());
        if let Some(code) = self.exit_code() {
            fault = fault.context("exit_status", code.to_string());
        }
        let tail = self.stderr_tail();
        if !tail.is_empty() {
            fault = fault.context("stderr_tail", tail);
        }
        fault
    }

    fn sample_cpu(&self) -> f32 {
        let Some(jiffies) = read_cpu_jiffies(self.pid) else {
            return 0.0;
        };
        let now = Instant::now();
        let mut prev = self.cpu_prev.lock();
        let pct = match prev.as_ref() {
            Some(sample) => {
                let wall = now.duration_since(sample.at).as_secs_f32();
                if wall > 0.0 {
                    let spent = jiffies.saturating_sub(sample.jiffies) as f32 / 100.0;
                    (spent / wall * 100.0).min(100.0 * num_cpus_estimate())
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        *prev = Some(CpuSample { at: now, jiffies });
        pct
    }
}

async fn pump_stderr(stderr: tokio::process::ChildStderr, tail: Arc<Mutex<VecDeque<u8>>>) {
    let mut reader = BufReader::new(stderr);
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut tail = tail.lock();
                tail.extend(&buf[..n]);
                while tail.len() > STDERR_TAIL_BYTES {
                    tail.pop_front();
                }
            }
        }
    }
}

async fn reap(mut child: Child, exit: Arc<ExitCell>) {
    match child.wait().await {
        Ok(status) => {
            *exit.status.lock() = Some(status);
        }
        Err(err) => {
            tracing::warn!(%err, "agent reaper failed");
            // Mark exited so writers stop retrying.
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                *exit.status.lock() = Some(std::process::ExitStatus::from_raw(0));
            }
        }
    }
    exit.exited.notify_waiters();
}

#[cfg(target_os = "linux")]
fn read_rss(pid: u32) -> u64 {
    let Ok(statm) = std::fs::read_to_string(format!("/proc/{}/statm", pid)) else {
        return 0;
    };
    statm
        .split_whitespace()
        .nth(1)
        .and_then(|pages| pages.parse::<u64>().ok())
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn read_rss(_pid: u32) -> u64 {
    0
}

#[cfg(target_os = "linux")]
fn read_cpu_jiffies(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // Skip past the parenthesized comm field, then utime and stime are
    // the 12th and 13th remaining fields (stat fields 14 and 15).
    let after_comm = stat.rsplit(')').next()?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_jiffies(_pid: u32) -> Option<u64> {
    None
}

fn num_cpus_estimate() -> f32 {
    std::thread::available_parallelism().map(|n| n.get() as f32).unwrap_or(1.0)
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
