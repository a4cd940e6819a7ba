// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session: one pooled agent subprocess behind an owner task.
//!
//! All state mutation happens on the session's owner task; handles talk
//! to it over a command channel. The owner task also runs the parse
//! loop, so message sequencing, execution bookkeeping, and state
//! transitions are naturally serialized.
//!
//! At most one execution is in flight per session. Subscribers attach
//! to the session's hub and survive process restarts; the seq cursor is
//! threaded into each replacement parser.

use crate::recovery::Incident;
use crate::supervisor::{AgentStream, ProcessHealth, Supervisor, SupervisorError};
use amux_core::{
    AffinityKey, AgentProfile, AuditEvent, Clock, EventSink, ExecStatus, ExecutionId,
    ExecutionSummary, Fault, FaultKind, IncidentId, Message, MessageKind, PrincipalId,
    ResourceUsage, SessionConfig, SessionId, SessionState, Severity, StreamConfig, WorkspaceId,
};
use amux_resilience::Source;
use amux_stream::{Hub, Parsed, Subscription};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is {0}, cannot accept a prompt")]
    NotAcquirable(SessionState),

    #[error("session terminated")]
    Terminated,

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("restart refused: {0}")]
    RestartRefused(String),
}

/// Handle to one in-flight execution.
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
    pub session_id: SessionId,
    cancel: CancellationToken,
    done: oneshot::Receiver<ExecutionSummary>,
}

impl ExecutionHandle {
    /// Request cancellation of this execution. Best effort: if the
    /// prompt already completed, this is a no-op.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolve to the execution's terminal summary.
    pub async fn wait(self) -> Result<ExecutionSummary, SessionError> {
        self.done.await.map_err(|_| SessionError::Terminated)
    }
}

enum Cmd {
    Acquire {
        prompt: String,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<ExecutionHandle, SessionError>>,
    },
    Release,
    RestartProcess {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Terminate {
        reply: oneshot::Sender<Option<i32>>,
    },
    /// Mark the session failed: subscribers get a terminal error
    /// message, then the hub closes.
    Fail {
        fault: Box<Fault>,
        reply: oneshot::Sender<()>,
    },
    Probe {
        reply: oneshot::Sender<bool>,
    },
}

/// Who the session currently serves. Mutable because the pool may
/// reassign a warm session to a new principal with the same profile
/// fingerprint.
struct Identity {
    workspace: WorkspaceId,
    principal: PrincipalId,
    affinity: AffinityKey,
}

struct Shared<C: Clock> {
    state: Mutex<SessionState>,
    usage: Mutex<ResourceUsage>,
    hub: Arc<Hub>,
    supervisor: Mutex<Option<Arc<Supervisor>>>,
    last_message_at: Mutex<Instant>,
    last_used_at: Mutex<Instant>,
    created_at: Instant,
    clock: C,
}

/// Cloneable handle to a pooled session. The owner task holds the other
/// end of the command channel.
pub struct Session<C: Clock> {
    id: SessionId,
    identity: Mutex<Identity>,
    profile: AgentProfile,
    cmd_tx: mpsc::Sender<Cmd>,
    shared: Arc<Shared<C>>,
}

impl<C: Clock> Session<C> {
    /// Create the session and its owner task. The returned receiver
    /// resolves once the agent handshake finishes (or fails).
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: SessionId,
        workspace: WorkspaceId,
        principal: PrincipalId,
        profile: AgentProfile,
        config: SessionConfig,
        stream_config: StreamConfig,
        clock: C,
        sink: Arc<dyn EventSink>,
        incident_tx: mpsc::Sender<Incident>,
        start_seq: u64,
    ) -> (Arc<Self>, oneshot::Receiver<Result<(), Fault>>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (ready_tx, ready_rx) = oneshot::channel();

        let hub = Arc::new(Hub::new(stream_config.clone()));
        let now = clock.now();
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::Pending),
            usage: Mutex::new(ResourceUsage::default()),
            hub,
            supervisor: Mutex::new(None),
            last_message_at: Mutex::new(now),
            last_used_at: Mutex::new(now),
            created_at: now,
            clock: clock.clone(),
        });

        let session = Arc::new(Self {
            id,
            identity: Mutex::new(Identity {
                workspace,
                principal,
                affinity: AffinityKey::new(principal, workspace, &profile),
            }),
            profile: profile.clone(),
            cmd_tx,
            shared: Arc::clone(&shared),
        });

        let owner = Owner {
            id,
            workspace,
            profile,
            config,
            max_frame: stream_config.max_frame_bytes,
            shared,
            cmd_rx,
            incident_tx,
            sink,
            stream: None,
            exec: None,
            seq_cursor: start_seq.saturating_sub(1),
            restarting: false,
        };
        tokio::spawn(owner.run(ready_tx));

        (session, ready_rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn workspace(&self) -> WorkspaceId {
        self.identity.lock().workspace
    }

    pub fn principal(&self) -> PrincipalId {
        self.identity.lock().principal
    }

    pub fn affinity(&self) -> AffinityKey {
        self.identity.lock().affinity.clone()
    }

    /// Hand this warm session to a new owner. Only legal when the
    /// profile fingerprint matches the previous one; the pool enforces
    /// the reuse threshold.
    pub fn reassign(&self, principal: PrincipalId, workspace: WorkspaceId) {
        let mut identity = self.identity.lock();
        identity.principal = principal;
        identity.workspace = workspace;
        identity.affinity = AffinityKey::new(principal, workspace, &self.profile);
    }

    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn usage(&self) -> ResourceUsage {
        *self.shared.usage.lock()
    }

    /// Submit a prompt, opening a new execution. Fails unless the
    /// session is `ready` or `idle`.
    pub async fn acquire(
        &self,
        prompt: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<ExecutionHandle, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Acquire { prompt: prompt.into(), cancel, reply })
            .await
            .map_err(|_| SessionError::Terminated)?;
        rx.await.map_err(|_| SessionError::Terminated)?
    }

    /// Attach a subscriber to this session's message stream.
    pub fn subscribe(&self, cursor: Option<u64>) -> Subscription {
        self.shared.hub.subscribe(cursor)
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.shared.hub
    }

    /// Caller is done with the session; timestamps last use.
    pub async fn release(&self) {
        let _ = self.cmd_tx.send(Cmd::Release).await;
    }

    /// Swap the supervisor in place, preserving id and seq cursor.
    pub async fn restart_process(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::RestartProcess { reply })
            .await
            .map_err(|_| SessionError::Terminated)?;
        rx.await.map_err(|_| SessionError::Terminated)?
    }

    /// Tear the session down. Idempotent; resolves to the agent's exit
    /// code when known.
    pub async fn terminate(&self) -> Option<i32> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Terminate { reply }).await.is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// Surface an unrecoverable fault: subscribers receive a terminal
    /// error message and the session sinks to `failed`.
    pub async fn fail(&self, fault: Fault) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Fail { fault: Box::new(fault), reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Inject a liveness probe; resolves true if the write succeeded.
    pub async fn probe(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Probe { reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn last_message_age(&self) -> Duration {
        self.shared.clock.now().duration_since(*self.shared.last_message_at.lock())
    }

    pub fn idle_age(&self) -> Duration {
        self.shared.clock.now().duration_since(*self.shared.last_used_at.lock())
    }

    pub fn age(&self) -> Duration {
        self.shared.clock.now().duration_since(self.shared.created_at)
    }

    /// Non-blocking process health; `None` before start or after end.
    pub fn health(&self) -> Option<ProcessHealth> {
        self.shared.supervisor.lock().as_ref().map(|s| s.health())
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.hub.subscriber_count()
    }

    pub fn retained_bytes(&self) -> usize {
        self.shared.hub.retained_bytes()
    }
}

/// What the owner task reacted to in one loop turn.
enum Tick {
    Cmd(Option<Cmd>),
    Parsed(Parsed),
    ExecDeadline,
    ExecCancelled,
}

struct ExecState {
    id: ExecutionId,
    started_ms: u64,
    seq_start: u64,
    first_seq_seen: bool,
    turns: u32,
    bytes_out: u64,
    cancel: CancellationToken,
    done: oneshot::Sender<ExecutionSummary>,
    deadline: tokio::time::Instant,
    first_message_deadline: Option<tokio::time::Instant>,
}

struct Owner<C: Clock> {
    id: SessionId,
    workspace: WorkspaceId,
    profile: AgentProfile,
    config: SessionConfig,
    max_frame: usize,
    shared: Arc<Shared<C>>,
    cmd_rx: mpsc::Receiver<Cmd>,
    incident_tx: mpsc::Sender<Incident>,
    sink: Arc<dyn EventSink>,
    stream: Option<AgentStream<C>>,
    exec: Option<ExecState>,
    /// Last seq observed from the parser; replacement parsers start at
    /// `seq_cursor + 1`.
    seq_cursor: u64,
    /// Set while recovery is swapping the supervisor, so EOF from the
    /// dying process is not reported as a fresh incident.
    restarting: bool,
}

impl<C: Clock> Owner<C> {
    async fn run(mut self, ready_tx: oneshot::Sender<Result<(), Fault>>) {
        match self.start_supervisor().await {
            Ok(()) => {
                self.set_state(SessionState::Ready);
                let _ = ready_tx.send(Ok(()));
            }
            Err(fault) => {
                self.set_state(SessionState::Failed);
                self.report(Source::Supervisor, fault.clone()).await;
                self.shared.hub.close();
                let _ = ready_tx.send(Err(fault));
                return;
            }
        }

        loop {
            let tick = {
                tokio::select! {
                    cmd = self.cmd_rx.recv() => Tick::Cmd(cmd),
                    parsed = next_parsed(&mut self.stream) => Tick::Parsed(parsed),
                    () = exec_deadline(&self.exec) => Tick::ExecDeadline,
                    () = exec_cancelled(&self.exec) => Tick::ExecCancelled,
                }
            };
            match tick {
                Tick::Cmd(None) => {
                    // Every handle dropped: tear down silently.
                    self.shutdown().await;
                    return;
                }
                Tick::Cmd(Some(cmd)) => {
                    if self.handle_cmd(cmd).await {
                        return;
                    }
                }
                Tick::Parsed(parsed) => self.handle_parsed(parsed).await,
                Tick::ExecDeadline => self.expire_execution().await,
                Tick::ExecCancelled => self.cancel_execution().await,
            }
        }
    }

    /// Returns true when the owner task should exit.
    async fn handle_cmd(&mut self, cmd: Cmd) -> bool {
        match cmd {
            Cmd::Acquire { prompt, cancel, reply } => {
                let result = self.begin_execution(prompt, cancel).await;
                let _ = reply.send(result);
                false
            }
            Cmd::Release => {
                *self.shared.last_used_at.lock() = self.shared.clock.now();
                false
            }
            Cmd::RestartProcess { reply } => {
                let result = self.restart_in_place().await;
                let _ = reply.send(result);
                false
            }
            Cmd::Terminate { reply } => {
                let code = self.shutdown().await;
                let _ = reply.send(code);
                true
            }
            Cmd::Fail { fault, reply } => {
                self.fail_session(*fault).await;
                let _ = reply.send(());
                true
            }
            Cmd::Probe { reply } => {
                let supervisor = self.shared.supervisor.lock().clone();
                let ok = match supervisor {
                    Some(s) => s.write_probe().await.is_ok(),
                    None => false,
                };
                let _ = reply.send(ok);
                false
            }
        }
    }

    async fn start_supervisor(&mut self) -> Result<(), Fault> {
        let start_seq = self.seq_cursor + 1;
        match Supervisor::start(
            &self.profile,
            &self.config,
            self.max_frame,
            start_seq,
            self.shared.clock.clone(),
        )
        .await
        {
            Ok((supervisor, stream, ready)) => {
                self.seq_cursor = ready.seq;
                *self.shared.last_message_at.lock() = self.shared.clock.now();
                *self.shared.supervisor.lock() = Some(Arc::new(supervisor));
                self.stream = Some(stream);
                self.shared.hub.publish(ready).await;
                Ok(())
            }
            Err(err) => {
                let (kind, severity) = match &err {
                    SupervisorError::StartTimeout(_) => (FaultKind::Timeout, Severity::High),
                    _ => (FaultKind::Process, Severity::High),
                };
                Err(Fault::new(kind, severity, err.to_string())
                    .context("session", self.id.to_string()))
            }
        }
    }

    async fn begin_execution(
        &mut self,
        prompt: String,
        cancel: CancellationToken,
    ) -> Result<ExecutionHandle, SessionError> {
        let state = *self.shared.state.lock();
        if !state.is_acquirable() {
            return Err(SessionError::NotAcquirable(state));
        }
        let supervisor = self
            .shared
            .supervisor
            .lock()
            .clone()
            .ok_or(SessionError::NotAcquirable(state))?;

        let written = match supervisor.write_prompt(&prompt).await {
            Ok(written) => written,
            Err(err) => {
                let fault = supervisor.annotate(
                    Fault::new(FaultKind::Process, Severity::High, err.to_string())
                        .context("session", self.id.to_string()),
                );
                self.report(Source::Supervisor, fault).await;
                self.set_state(SessionState::Terminating);
                return Err(SessionError::Supervisor(err));
            }
        };

        self.shared.usage.lock().bytes_in += written as u64;
        self.set_state(SessionState::Busy);

        let execution_id = ExecutionId::generate();
        let (done_tx, done_rx) = oneshot::channel();
        let now = tokio::time::Instant::now();
        self.exec = Some(ExecState {
            id: execution_id,
            started_ms: self.shared.clock.epoch_ms(),
            seq_start: self.seq_cursor + 1,
            first_seq_seen: false,
            turns: 0,
            bytes_out: 0,
            cancel: cancel.clone(),
            done: done_tx,
            deadline: now + self.config.execution_deadline,
            first_message_deadline: Some(now + self.config.first_message_deadline),
        });

        Ok(ExecutionHandle {
            execution_id,
            session_id: self.id,
            cancel,
            done: done_rx,
        })
    }

    async fn handle_parsed(&mut self, parsed: Parsed) {
        match parsed {
            Parsed::Message(msg) => {
                self.seq_cursor = msg.seq;
                *self.shared.last_message_at.lock() = self.shared.clock.now();
                {
                    let mut usage = self.shared.usage.lock();
                    usage.bytes_out += msg.content.len() as u64;
                }
                if let Some(exec) = self.exec.as_mut() {
                    exec.first_message_deadline = None;
                    exec.first_seq_seen = true;
                    exec.bytes_out += msg.content.len() as u64;
                    if msg.kind == MessageKind::ToolUse {
                        exec.turns += 1;
                    }
                }
                if msg.ends_execution() {
                    // Completion markers become `execution.complete`
                    // frames, not message frames.
                    self.finish_execution(ExecStatus::Success).await;
                } else {
                    self.shared.hub.publish(msg).await;
                }
            }
            Parsed::Poison(msg) => {
                self.shared.hub.publish(msg.clone()).await;
                self.seq_cursor = msg.seq;
                self.stream = None;
                let fault = self.annotated(
                    Fault::new(FaultKind::Protocol, Severity::High, msg.content.clone()),
                );
                self.finish_execution(ExecStatus::Failed).await;
                self.set_state(SessionState::Terminating);
                self.report(Source::Parser, fault).await;
            }
            Parsed::Eof => {
                self.stream = None;
                if self.restarting {
                    return;
                }
                let exit_code = self
                    .shared
                    .supervisor
                    .lock()
                    .as_ref()
                    .and_then(|s| s.exit_code());
                let fault = self.annotated(Fault::new(
                    FaultKind::Process,
                    Severity::High,
                    format!("process dead: agent exited with status {:?}", exit_code),
                ));
                self.finish_execution(ExecStatus::Failed).await;
                self.set_state(SessionState::Terminating);
                self.report(Source::Supervisor, fault).await;
            }
        }
    }

    async fn expire_execution(&mut self) {
        let Some(exec) = self.exec.as_ref() else {
            return;
        };
        let waiting_first = exec.first_message_deadline.is_some() && !exec.first_seq_seen;
        let fault = Fault::new(
            FaultKind::Timeout,
            Severity::Medium,
            if waiting_first {
                "prompt-to-first-message deadline elapsed"
            } else {
                "execution deadline elapsed"
            },
        )
        .context("session", self.id.to_string());
        // Ask the agent to stop; the session itself stays usable.
        self.write_cancel_record().await;
        self.finish_execution(ExecStatus::Timeout).await;
        self.report(Source::Session, fault).await;
    }

    async fn cancel_execution(&mut self) {
        self.write_cancel_record().await;
        self.finish_execution(ExecStatus::Cancelled).await;
    }

    async fn write_cancel_record(&self) {
        let supervisor = self.shared.supervisor.lock().clone();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.write_cancel().await;
        }
    }

    async fn finish_execution(&mut self, status: ExecStatus) {
        let Some(exec) = self.exec.take() else {
            return;
        };
        let finished_ms = self.shared.clock.epoch_ms();
        let summary = ExecutionSummary {
            execution_id: exec.id,
            status,
            seq_start: exec.seq_start,
            seq_end: self.seq_cursor,
            turns: exec.turns,
            bytes_out: exec.bytes_out,
            started_ms: exec.started_ms,
            finished_ms,
        };
        {
            let mut usage = self.shared.usage.lock();
            usage.turns_used += exec.turns.max(1);
            usage.wall_ms += summary.wall_ms();
            if let Some(health) = self.shared.supervisor.lock().as_ref().map(|s| s.health()) {
                usage.note_rss(health.rss_bytes);
            }
        }
        self.sink.emit(AuditEvent::ExecutionComplete {
            session: self.id,
            execution: exec.id,
            status,
            wall_ms: summary.wall_ms(),
        });
        self.shared.hub.publish_complete(summary.clone());
        let _ = exec.done.send(summary);
        *self.shared.last_used_at.lock() = self.shared.clock.now();

        // Busy → Idle only on the normal path; hard failures already
        // moved the session to terminating.
        if *self.shared.state.lock() == SessionState::Busy {
            self.set_state(SessionState::Idle);
        }
    }

    async fn restart_in_place(&mut self) -> Result<(), SessionError> {
        let state = *self.shared.state.lock();
        if state.is_terminal() {
            return Err(SessionError::RestartRefused(format!("session is {}", state)));
        }
        self.restarting = true;
        let supervisor = self.shared.supervisor.lock().clone();
        if let Some(supervisor) = supervisor {
            supervisor.terminate(&self.config).await;
        }
        self.stream = None;
        if state != SessionState::Terminating {
            self.set_state(SessionState::Terminating);
        }
        self.finish_execution(ExecStatus::Failed).await;

        let result = self.start_supervisor().await;
        self.restarting = false;
        match result {
            Ok(()) => {
                self.set_state(SessionState::Ready);
                tracing::info!(session = %self.id, cursor = self.seq_cursor, "process restarted in place");
                Ok(())
            }
            Err(fault) => Err(SessionError::RestartRefused(fault.to_string())),
        }
    }

    async fn fail_session(&mut self, fault: Fault) {
        self.finish_execution(ExecStatus::Failed).await;
        let mut message = Message::new(
            self.seq_cursor + 1,
            MessageKind::Error,
            fault.message.clone(),
            self.shared.clock.epoch_ms(),
        );
        self.seq_cursor += 1;
        message
            .meta
            .insert("kind".into(), serde_json::Value::String(fault.kind.to_string()));
        self.shared.hub.publish(message).await;

        let supervisor = self.shared.supervisor.lock().clone();
        if let Some(supervisor) = supervisor {
            supervisor.terminate(&self.config).await;
        }
        self.stream = None;
        *self.shared.supervisor.lock() = None;
        self.set_state(SessionState::Terminating);
        self.set_state(SessionState::Failed);
        self.shared.hub.close();
        self.sink.emit(AuditEvent::SessionDestroyed { id: self.id, reason: "failed".into() });
    }

    async fn shutdown(&mut self) -> Option<i32> {
        self.set_state(SessionState::Terminating);
        self.finish_execution(ExecStatus::Failed).await;
        let supervisor = self.shared.supervisor.lock().clone();
        let code = match supervisor {
            Some(supervisor) => supervisor.terminate(&self.config).await,
            None => None,
        };
        self.stream = None;
        *self.shared.supervisor.lock() = None;
        self.set_state(SessionState::Ended);
        self.shared.hub.close();
        self.sink.emit(AuditEvent::SessionDestroyed {
            id: self.id,
            reason: "terminated".into(),
        });
        code
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.shared.state.lock();
        let from = *state;
        if from == next {
            return;
        }
        debug_assert!(from.may_become(next), "illegal transition {} -> {}", from, next);
        *state = next;
        drop(state);
        self.sink.emit(AuditEvent::SessionState { id: self.id, from, to: next });
        // Status frames only for edges subscribers act on.
        if matches!(
            next,
            SessionState::Ready
                | SessionState::Terminating
                | SessionState::Ended
                | SessionState::Failed
        ) && from != SessionState::Pending
        {
            self.shared.hub.publish_status(next);
        }
    }

    fn annotated(&self, fault: Fault) -> Fault {
        let fault = fault.context("session", self.id.to_string());
        match self.shared.supervisor.lock().as_ref() {
            Some(supervisor) => supervisor.annotate(fault),
            None => fault,
        }
    }

    async fn report(&self, source: Source, fault: Fault) {
        let incident = Incident {
            id: IncidentId::generate(),
            session: Some(self.id),
            workspace: Some(self.workspace),
            source,
            fault,
        };
        if self.incident_tx.send(incident).await.is_err() {
            tracing::debug!(session = %self.id, "no recovery orchestrator attached");
        }
    }
}

async fn next_parsed<C: Clock>(stream: &mut Option<AgentStream<C>>) -> Parsed {
    match stream {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

async fn exec_deadline(exec: &Option<ExecState>) {
    match exec {
        Some(e) => {
            let at = e.first_message_deadline.unwrap_or(e.deadline).min(e.deadline);
            tokio::time::sleep_until(at).await
        }
        None => std::future::pending().await,
    }
}

async fn exec_cancelled(exec: &Option<ExecState>) {
    match exec {
        Some(e) => e.cancel.cancelled().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
