// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Recovery orchestrator.
//!
//! Incidents arrive from the supervisor, parser, session, pool, and
//! container layers already classified. Each incident's fault maps to a
//! ranked strategy list; strategies run in order behind the breaker and
//! retrier, each under its own timeout, until one succeeds or the fault
//! is surfaced to subscribers.

use crate::container::ContainerController;
use crate::pool::{PoolError, SessionPool};
use amux_core::{
    AuditEvent, Clock, EventSink, Fault, FaultKind, IncidentId, SessionId, Severity, Strategy,
    WorkspaceId,
};
use amux_resilience::{Retrier, RetryError, Source};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One failure, as reported to the orchestrator.
#[derive(Debug, Clone)]
pub struct Incident {
    pub id: IncidentId,
    pub session: Option<SessionId>,
    pub workspace: Option<WorkspaceId>,
    pub source: Source,
    pub fault: Fault,
}

/// The concrete actions recovery strategies drive. Implemented over the
/// pool and container controller; faked in tests.
#[async_trait]
pub trait RecoveryOps: Send + Sync + 'static {
    /// `retry`: reissue a cheap liveness check against the session.
    async fn probe(&self, session: SessionId) -> Result<(), Fault>;

    /// Swap the subprocess in place; session id and seq survive.
    async fn restart_process(&self, session: SessionId) -> Result<(), Fault>;

    /// Destroy the session and materialize a replacement for the same
    /// (workspace, principal, profile).
    async fn restart_session(&self, session: SessionId) -> Result<(), Fault>;

    /// Discard the workspace's container, recreate it, then replace the
    /// session.
    async fn cleanup_and_recreate(
        &self,
        session: Option<SessionId>,
        workspace: Option<WorkspaceId>,
    ) -> Result<(), Fault>;

    /// Give up: mark the session failed and notify subscribers.
    async fn surface(&self, session: Option<SessionId>, fault: Fault);
}

/// Production [`RecoveryOps`] backed by the pool and the container
/// control plane.
pub struct PoolRecovery<C: Clock> {
    pool: Arc<SessionPool<C>>,
    containers: Arc<dyn ContainerController>,
}

impl<C: Clock> PoolRecovery<C> {
    pub fn new(pool: Arc<SessionPool<C>>, containers: Arc<dyn ContainerController>) -> Self {
        Self { pool, containers }
    }

    fn not_found(session: SessionId) -> Fault {
        Fault::new(
            FaultKind::Internal,
            Severity::Medium,
            format!("session {} no longer in pool", session),
        )
    }
}

#[async_trait]
impl<C: Clock> RecoveryOps for PoolRecovery<C> {
    async fn probe(&self, session: SessionId) -> Result<(), Fault> {
        let found = self.pool.find(session).ok_or_else(|| Self::not_found(session))?;
        if found.probe().await {
            Ok(())
        } else {
            Err(Fault::new(
                FaultKind::Process,
                Severity::High,
                format!("session {} failed probe", session),
            ))
        }
    }

    async fn restart_process(&self, session: SessionId) -> Result<(), Fault> {
        let found = self.pool.find(session).ok_or_else(|| Self::not_found(session))?;
        found.restart_process().await.map_err(|err| {
            Fault::new(FaultKind::Process, Severity::High, err.to_string())
                .context("session", session.to_string())
        })
    }

    async fn restart_session(&self, session: SessionId) -> Result<(), Fault> {
        match self.pool.replace(session).await {
            Ok(_) => Ok(()),
            Err(PoolError::Start(fault)) => Err(fault),
            Err(err) => Err(Fault::new(FaultKind::Internal, Severity::High, err.to_string())),
        }
    }

    async fn cleanup_and_recreate(
        &self,
        session: Option<SessionId>,
        workspace: Option<WorkspaceId>,
    ) -> Result<(), Fault> {
        let workspace = workspace.ok_or_else(|| {
            Fault::new(FaultKind::Internal, Severity::Medium, "incident names no workspace")
        })?;
        self.containers.recreate(&workspace).await.map_err(|err| {
            Fault::new(FaultKind::Resource, Severity::High, err.to_string())
                .context("workspace", workspace.to_string())
        })?;
        match session {
            Some(session) => self.restart_session(session).await,
            None => Ok(()),
        }
    }

    async fn surface(&self, session: Option<SessionId>, fault: Fault) {
        if let Some(session) = session {
            self.pool.surface(session, fault).await;
        }
    }
}

/// Ranked strategies for a classified fault. The classifier's suggested
/// strategy leads; the table supplies the escalation tail.
pub fn strategies_for(fault: &Fault, source: Source, has_session: bool) -> Vec<Strategy> {
    if !has_session {
        return vec![Strategy::Surface];
    }
    let tail: &[Strategy] = match (fault.kind, source) {
        (FaultKind::Process, _) => {
            &[Strategy::RestartProcess, Strategy::RestartSession, Strategy::Surface]
        }
        (FaultKind::Protocol, _) => &[Strategy::RestartProcess, Strategy::Surface],
        (FaultKind::Resource, Source::Container) => {
            &[Strategy::CleanupAndRecreate, Strategy::Surface]
        }
        (FaultKind::Resource, _) => {
            &[Strategy::RestartProcess, Strategy::RestartSession, Strategy::Surface]
        }
        (FaultKind::Timeout, Source::Supervisor) => {
            &[Strategy::RestartProcess, Strategy::Surface]
        }
        (FaultKind::Timeout, _) | (FaultKind::Network, _) => {
            &[Strategy::Retry, Strategy::Surface]
        }
        _ => &[Strategy::Surface],
    };

    let mut ranked = vec![fault.strategy];
    for strategy in tail {
        if !ranked.contains(strategy) {
            ranked.push(*strategy);
        }
    }
    if !ranked.contains(&Strategy::Surface) {
        ranked.push(Strategy::Surface);
    }
    ranked
}

pub struct RecoveryOrchestrator<C: Clock> {
    ops: Arc<dyn RecoveryOps>,
    retrier: Arc<Retrier<C>>,
    sink: Arc<dyn EventSink>,
    /// Budget for each individual strategy attempt.
    strategy_timeout: Duration,
    cancel: CancellationToken,
}

impl<C: Clock> RecoveryOrchestrator<C> {
    pub fn new(
        ops: Arc<dyn RecoveryOps>,
        retrier: Arc<Retrier<C>>,
        sink: Arc<dyn EventSink>,
        strategy_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            ops,
            retrier,
            sink,
            strategy_timeout,
            cancel: CancellationToken::new(),
        })
    }

    /// Start the intake loop; incidents are processed one at a time.
    pub fn spawn(self: &Arc<Self>) -> mpsc::Sender<Incident> {
        let (tx, rx) = mpsc::channel::<Incident>(64);
        self.attach(rx);
        tx
    }

    /// Drain an existing incident channel (for callers that created the
    /// channel before the orchestrator existed).
    pub fn attach(self: &Arc<Self>, mut rx: mpsc::Receiver<Incident>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => return,
                    incident = rx.recv() => match incident {
                        Some(incident) => this.handle(incident).await,
                        None => return,
                    },
                }
            }
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Drive one incident through its strategy ladder.
    pub async fn handle(&self, incident: Incident) {
        self.sink.emit(AuditEvent::RecoveryIncident {
            incident: incident.id,
            session: incident.session,
            fault: incident.fault.clone(),
        });
        tracing::warn!(
            incident = %incident.id,
            source = %incident.source,
            "recovering from fault: {}",
            incident.fault
        );

        let strategies =
            strategies_for(&incident.fault, incident.source, incident.session.is_some());
        for strategy in strategies {
            if strategy == Strategy::Surface {
                self.ops.surface(incident.session, incident.fault.clone()).await;
                self.sink.emit(AuditEvent::RecoverySurfaced { incident: incident.id });
                return;
            }

            let started = Instant::now();
            let outcome = tokio::time::timeout(
                self.strategy_timeout,
                self.attempt(strategy, &incident),
            )
            .await;
            let success = matches!(outcome, Ok(Ok(())));
            self.sink.emit(AuditEvent::RecoveryAttempt {
                incident: incident.id,
                strategy,
                success,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
            if success {
                tracing::info!(incident = %incident.id, %strategy, "recovered");
                return;
            }
            tracing::warn!(incident = %incident.id, %strategy, "strategy failed, escalating");
        }
    }

    async fn attempt(&self, strategy: Strategy, incident: &Incident) -> Result<(), RetryError> {
        let target = match incident.session {
            Some(session) => format!("recovery:{}", session),
            None => "recovery:global".to_string(),
        };
        let ops = &self.ops;
        let session = incident.session;
        let workspace = incident.workspace;
        self.retrier
            .run(incident.source, &target, &self.cancel, || async move {
                match strategy {
                    Strategy::Retry => match session {
                        Some(session) => ops.probe(session).await,
                        None => Ok(()),
                    },
                    Strategy::RestartProcess => match session {
                        Some(session) => ops.restart_process(session).await,
                        None => Ok(()),
                    },
                    Strategy::RestartSession => match session {
                        Some(session) => ops.restart_session(session).await,
                        None => Ok(()),
                    },
                    Strategy::CleanupAndRecreate => {
                        ops.cleanup_and_recreate(session, workspace).await
                    }
                    Strategy::Surface => Ok(()),
                }
            })
            .await
    }
}

#[cfg(test)]
#[path = "recovery_tests.rs"]
mod tests;
