// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket listener.
//!
//! Accepts connections and handles each in a spawned task without
//! blocking the accept loop. The first client frame must be
//! `session.connect`: it authenticates the principal, authorizes the
//! workspace attach, and binds the connection to a session. After that
//! the task pumps the session's subscription out and client prompts in.

use crate::adapters::Repository;
use crate::config::AgentCommand;
use crate::protocol::{ClientFrame, ServerFrame, PROTOCOL_VERSION};
use amux_access::AccessGate;
use amux_core::{AgentProfile, PrincipalId, SessionId, SystemClock, WorkspaceId};
use amux_engine::{ContainerController, ExecutionHandle, Session, SessionPool, WorkspaceSpec};
use amux_resilience::{Retrier, Source};
use amux_stream::{CloseReason, StreamItem, Subscription};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

/// Shared daemon context for all connection tasks.
pub(crate) struct ListenCtx {
    pub pool: Arc<SessionPool<SystemClock>>,
    pub gate: Arc<AccessGate<SystemClock>>,
    pub repo: Arc<dyn Repository>,
    pub containers: Arc<dyn ContainerController>,
    pub retrier: Arc<Retrier<SystemClock>>,
    pub agent: AgentCommand,
    pub workspace_root: PathBuf,
    pub cancel: CancellationToken,
}

/// Accept loop. Runs until cancelled.
pub(crate) async fn run(listener: TcpListener, ctx: Arc<ListenCtx>) {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "connection accepted");
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        if let Err(err) = handle_socket(stream, ctx).await {
                            debug!(%addr, %err, "connection ended");
                        }
                    });
                }
                Err(err) => warn!(%err, "accept error"),
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ConnError {
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("handshake rejected: {0}")]
    Rejected(String),

    #[error("client went away")]
    Gone,
}

async fn handle_socket(stream: TcpStream, ctx: Arc<ListenCtx>) -> Result<(), ConnError> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let mut conn = match handshake(ws, &ctx).await {
        Ok(conn) => conn,
        Err(HandshakeFail::Fatal(err)) => return Err(err),
        Err(HandshakeFail::Refused(mut ws, code, message)) => {
            let frame = ServerFrame::error(code, message.clone(), true);
            let _ = ws.send(WsMessage::text(frame.to_json())).await;
            let _ = ws.close(None).await;
            return Err(ConnError::Rejected(message));
        }
    };
    let result = conn.pump(&ctx).await;
    conn.teardown(&ctx).await;
    result
}

enum HandshakeFail {
    Fatal(ConnError),
    Refused(WebSocketStream<TcpStream>, &'static str, String),
}

struct Conn {
    ws: WebSocketStream<TcpStream>,
    principal: PrincipalId,
    session: Arc<Session<SystemClock>>,
    subscription: Subscription,
    /// Executions this connection opened, for cancellation.
    executions: HashMap<amux_core::ExecutionId, ExecutionHandle>,
    /// True when this connection materialized the session and must
    /// release it on disconnect.
    owns_session: bool,
}

async fn handshake(
    mut ws: WebSocketStream<TcpStream>,
    ctx: &Arc<ListenCtx>,
) -> Result<Conn, HandshakeFail> {
    let first = tokio::time::timeout(HANDSHAKE_DEADLINE, ws.next()).await;
    let text = match first {
        Err(_) => {
            return Err(HandshakeFail::Refused(
                ws,
                "timeout",
                "no session.connect within the handshake deadline".into(),
            ))
        }
        Ok(None) => return Err(HandshakeFail::Fatal(ConnError::Gone)),
        Ok(Some(Err(err))) => return Err(HandshakeFail::Fatal(err.into())),
        Ok(Some(Ok(WsMessage::Text(text)))) => text,
        Ok(Some(Ok(_))) => {
            return Err(HandshakeFail::Refused(
                ws,
                "validation",
                "invalid first frame: expected a session.connect text frame".into(),
            ))
        }
    };

    let (session_id, workspace_id, auth, cursor) = match ClientFrame::parse(&text) {
        Ok(ClientFrame::Connect { session_id, workspace_id, auth, cursor, protocol_version }) => {
            if let Some(version) = protocol_version {
                if version != PROTOCOL_VERSION {
                    return Err(HandshakeFail::Refused(
                        ws,
                        "validation",
                        format!("unsupported protocol version {}", version),
                    ));
                }
            }
            (session_id, workspace_id, auth, cursor)
        }
        Ok(_) => {
            return Err(HandshakeFail::Refused(
                ws,
                "validation",
                "invalid first frame: expected session.connect".into(),
            ))
        }
        Err(err) => {
            return Err(HandshakeFail::Refused(ws, "validation", err.to_string()));
        }
    };

    // Token → principal.
    let principal = match ctx.repo.resolve_token(&auth).await {
        Ok(Some(principal)) => principal,
        Ok(None) => {
            return Err(HandshakeFail::Refused(ws, "auth_failed", "unknown auth token".into()))
        }
        Err(err) => {
            return Err(HandshakeFail::Refused(ws, "internal", err.to_string()));
        }
    };

    // Bind to a session: attach to an existing one or materialize a
    // fresh one for the named workspace.
    let (session, owns_session) = match session_id {
        Some(id) => match attach_existing(ctx, principal, id).await {
            Ok(session) => (session, false),
            Err((code, message)) => return Err(HandshakeFail::Refused(ws, code, message)),
        },
        None => {
            let Some(workspace) = workspace_id else {
                return Err(HandshakeFail::Refused(
                    ws,
                    "validation",
                    "session.connect needs a session_id or a workspace_id".into(),
                ));
            };
            match open_session(ctx, principal, workspace).await {
                Ok(session) => (session, true),
                Err((code, message)) => return Err(HandshakeFail::Refused(ws, code, message)),
            }
        }
    };

    let subscription = session.subscribe(cursor);
    let hello = ServerFrame::Status { session_id: session.id(), state: session.state() };
    if ws.send(WsMessage::text(hello.to_json())).await.is_err() {
        return Err(HandshakeFail::Fatal(ConnError::Gone));
    }
    info!(principal = %principal, session = %session.id(), "client connected");

    Ok(Conn {
        ws,
        principal,
        session,
        subscription,
        executions: HashMap::new(),
        owns_session,
    })
}

async fn attach_existing(
    ctx: &Arc<ListenCtx>,
    principal: PrincipalId,
    id: SessionId,
) -> Result<Arc<Session<SystemClock>>, (&'static str, String)> {
    let Some(session) = ctx.pool.find(id) else {
        return Err(("unknown_session", format!("no session {}", id)));
    };
    // Owners attach freely; anyone else needs a session/attach grant.
    if session.principal() != principal {
        let decision = ctx
            .gate
            .authorize(principal, "session", id.as_str(), "attach")
            .await
            .map_err(|e| ("internal", e.to_string()))?;
        if !decision.allow {
            return Err(("access_denied", decision.reason));
        }
    }
    Ok(session)
}

async fn open_session(
    ctx: &Arc<ListenCtx>,
    principal: PrincipalId,
    workspace: WorkspaceId,
) -> Result<Arc<Session<SystemClock>>, (&'static str, String)> {
    let decision = ctx
        .gate
        .authorize(principal, "workspace", workspace.as_str(), "attach")
        .await
        .map_err(|e| ("internal", e.to_string()))?;
    if !decision.allow {
        return Err(("access_denied", decision.reason));
    }

    let dir = ensure_workspace(ctx, workspace)
        .await
        .map_err(|message| ("container_unavailable", message))?;

    let profile = AgentProfile::new(&ctx.agent.command, dir).args(ctx.agent.args.clone());
    let session = ctx
        .pool
        .acquire(principal, workspace, profile)
        .await
        .map_err(|err| match err {
            amux_engine::PoolError::Exhausted(_) => ("pool_exhausted", err.to_string()),
            amux_engine::PoolError::BufferCap { .. } => ("memory_cap", err.to_string()),
            _ => ("session_start_failed", err.to_string()),
        })?;

    let now = amux_core::Clock::epoch_ms(&amux_core::SystemClock);
    let record = amux_core::SessionRecord {
        id: session.id(),
        workspace,
        principal,
        profile: session.profile().clone(),
        state: session.state(),
        created_ms: now,
        last_used_ms: now,
        usage: session.usage(),
        seq_cursor: session.hub().last_seq(),
    };
    if let Err(err) = ctx.repo.put_session(record).await {
        warn!(%err, "session record write failed");
    }
    Ok(session)
}

/// Make sure a container backs the workspace; create it through the
/// breaker-gated retrier when missing.
async fn ensure_workspace(
    ctx: &Arc<ListenCtx>,
    workspace: WorkspaceId,
) -> Result<PathBuf, String> {
    let dir = ctx.workspace_root.join(workspace.as_str());
    if ctx.containers.lookup(&workspace).await.is_none() {
        let spec = WorkspaceSpec {
            workspace,
            root: dir.clone(),
            memory_limit_bytes: 2 * 1024 * 1024 * 1024,
            cpu_quota_pct: 200,
        };
        let containers = Arc::clone(&ctx.containers);
        ctx.retrier
            .run(Source::Container, "container", &ctx.cancel, || {
                let containers = Arc::clone(&containers);
                let spec = spec.clone();
                async move { containers.create(&spec).await }
            })
            .await
            .map_err(|err| err.to_string())?;
    }
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|err| format!("workspace dir {}: {}", dir.display(), err))?;
    Ok(dir)
}

impl Conn {
    /// Main connection loop: session items out, client frames in.
    async fn pump(&mut self, ctx: &Arc<ListenCtx>) -> Result<(), ConnError> {
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    self.send(ServerFrame::error("shutting_down", "daemon is shutting down", true))
                        .await?;
                    return Ok(());
                }
                item = self.subscription.next() => {
                    if self.forward(ctx, item).await? {
                        return Ok(());
                    }
                }
                frame = self.ws.next() => match frame {
                    None | Some(Ok(WsMessage::Close(_))) => return Ok(()),
                    Some(Err(err)) => return Err(err.into()),
                    Some(Ok(WsMessage::Text(text))) => self.handle_client_frame(&text).await?,
                    Some(Ok(_)) => {} // binary/ping/pong: ignored
                },
            }
        }
    }

    /// Forward one subscription item; true means the stream is done.
    async fn forward(
        &mut self,
        ctx: &Arc<ListenCtx>,
        item: StreamItem,
    ) -> Result<bool, ConnError> {
        let session_id = self.session.id();
        match item {
            StreamItem::Message(message) => {
                self.send(ServerFrame::message(session_id, &message)).await?;
            }
            StreamItem::Gap { from, to } => {
                self.send(ServerFrame::Gap { session_id, from, to }).await?;
            }
            StreamItem::ReplayGap { requested, oldest } => {
                let mut meta = serde_json::Map::new();
                meta.insert("kind".into(), serde_json::Value::String("replay_gap".into()));
                meta.insert("requested".into(), requested.into());
                meta.insert("oldest".into(), oldest.into());
                self.send(ServerFrame::Message {
                    session_id,
                    seq: 0,
                    ts: String::new(),
                    kind: amux_core::MessageKind::Error,
                    content: format!(
                        "replay cursor {} is older than the retained buffer, resuming at {}",
                        requested, oldest
                    ),
                    meta,
                })
                .await?;
            }
            StreamItem::Status(state) => {
                self.send(ServerFrame::Status { session_id, state }).await?;
            }
            StreamItem::ExecutionComplete(summary) => {
                self.executions.remove(&summary.execution_id);
                if let Err(err) = ctx.repo.put_execution(session_id, summary.clone()).await {
                    warn!(%err, "execution record write failed");
                }
                self.send(ServerFrame::complete(session_id, &summary)).await?;
            }
            StreamItem::Closed(reason) => {
                let code = match reason {
                    CloseReason::SessionClosed => "session_closed",
                    CloseReason::SlowConsumer => "slow_consumer",
                    CloseReason::Unsubscribed => "unsubscribed",
                };
                self.send(ServerFrame::error(code, reason.to_string(), true)).await?;
                let _ = self.ws.close(None).await;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn handle_client_frame(&mut self, text: &str) -> Result<(), ConnError> {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                self.send(ServerFrame::error("validation", err.to_string(), false)).await?;
                return Ok(());
            }
        };
        match frame {
            ClientFrame::Ping => self.send(ServerFrame::Pong).await?,
            ClientFrame::Connect { .. } => {
                self.send(ServerFrame::error(
                    "validation",
                    "already connected",
                    false,
                ))
                .await?;
            }
            ClientFrame::Message { session_id, content } => {
                if session_id != self.session.id() {
                    self.send(ServerFrame::error("validation", "unknown session id", false))
                        .await?;
                    return Ok(());
                }
                let cancel = CancellationToken::new();
                match self.session.acquire(content, cancel).await {
                    Ok(handle) => {
                        debug!(
                            principal = %self.principal,
                            execution = %handle.execution_id,
                            "execution opened"
                        );
                        self.executions.insert(handle.execution_id, handle);
                    }
                    Err(err) => {
                        self.send(ServerFrame::error("not_ready", err.to_string(), false))
                            .await?;
                    }
                }
            }
            ClientFrame::Cancel { session_id, execution_id } => {
                if session_id != self.session.id() {
                    self.send(ServerFrame::error("validation", "unknown session id", false))
                        .await?;
                    return Ok(());
                }
                match self.executions.get(&execution_id) {
                    Some(handle) => handle.cancel(),
                    None => {
                        self.send(ServerFrame::error(
                            "unknown_execution",
                            format!("no execution {}", execution_id),
                            false,
                        ))
                        .await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn send(&mut self, frame: ServerFrame) -> Result<(), ConnError> {
        self.ws.send(WsMessage::text(frame.to_json())).await?;
        Ok(())
    }

    async fn teardown(self, ctx: &Arc<ListenCtx>) {
        self.session.hub().unsubscribe(self.subscription.id());
        if self.owns_session {
            ctx.pool.release(Arc::clone(&self.session)).await;
        }
        debug!(session = %self.session.id(), "client disconnected");
    }
}
