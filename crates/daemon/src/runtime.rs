// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Composition root: wires the sink, repository, containers, pool,
//! recovery, access gate, and listener together, and owns shutdown.

use crate::adapters::{ChannelSink, RepoDirectory, Repository};
use crate::config::DaemonConfig;
use crate::listener::{self, ListenCtx};
use amux_access::{AccessGate, PolicySet, SubjectDirectory};
use amux_core::{AuditEvent, EventSink, SystemClock};
use amux_engine::{
    ContainerController, Incident, PoolRecovery, RecoveryOps, RecoveryOrchestrator, SessionPool,
};
use amux_resilience::{BreakerRegistry, Classifier, Retrier};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid roles file: {0}")]
    Policy(#[from] amux_access::PolicyError),

    #[error("failed to read roles file {path}: {source}")]
    PolicyRead {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state dir: {0}")]
    StateDir(std::io::Error),
}

/// A running daemon. Dropping it does not stop the tasks; call
/// [`Daemon::shutdown`].
pub struct Daemon {
    pub config: DaemonConfig,
    pool: Arc<SessionPool<SystemClock>>,
    gate: Arc<AccessGate<SystemClock>>,
    recovery: Arc<RecoveryOrchestrator<SystemClock>>,
    sink: Arc<ChannelSink>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    sink_cancel: CancellationToken,
}

impl Daemon {
    /// Build and start everything against the given backends.
    pub async fn start(
        config: DaemonConfig,
        repo: Arc<dyn Repository>,
        containers: Arc<dyn ContainerController>,
    ) -> Result<Self, DaemonError> {
        std::fs::create_dir_all(config.workspace_root()).map_err(DaemonError::StateDir)?;

        let cancel = CancellationToken::new();
        // The sink outlives the main token so shutdown events still
        // reach the audit trail.
        let sink_cancel = CancellationToken::new();
        let clock = SystemClock;
        let sink = ChannelSink::spawn(Arc::clone(&repo), sink_cancel.clone());
        let sink_dyn: Arc<dyn EventSink> = sink.clone();

        let classifier = Arc::new(Classifier::with_default_rules());
        let registry = Arc::new(BreakerRegistry::new(
            config.breaker.clone(),
            clock,
            Arc::clone(&sink_dyn),
        ));
        let retrier = Arc::new(Retrier::new(
            config.retry.clone(),
            Arc::clone(&classifier),
            Arc::clone(&registry),
        ));

        // Incident channel: the pool and sessions feed it, the
        // orchestrator drains it.
        let (incident_tx, incident_rx) = mpsc::channel::<Incident>(64);
        let pool = SessionPool::new(
            config.pool.clone(),
            config.session.clone(),
            config.stream.clone(),
            clock,
            Arc::clone(&sink_dyn),
            incident_tx,
        );

        let ops: Arc<dyn RecoveryOps> =
            Arc::new(PoolRecovery::new(Arc::clone(&pool), Arc::clone(&containers)));
        let recovery = RecoveryOrchestrator::new(
            ops,
            Arc::clone(&retrier),
            Arc::clone(&sink_dyn),
            Duration::from_secs(30),
        );
        recovery.attach(incident_rx);

        let policies = match &config.policy_file {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| {
                    DaemonError::PolicyRead { path: path.clone(), source }
                })?;
                PolicySet::from_toml_str(&text)?
            }
            None => PolicySet::empty(),
        };
        let directory: Arc<dyn SubjectDirectory> =
            Arc::new(RepoDirectory::new(Arc::clone(&repo)));
        let gate = Arc::new(AccessGate::new(
            config.access.clone(),
            policies,
            directory,
            clock,
            Arc::clone(&sink_dyn),
        ));

        let tcp = TcpListener::bind(&config.listen)
            .await
            .map_err(|source| DaemonError::Bind { addr: config.listen.clone(), source })?;
        let local_addr = tcp
            .local_addr()
            .map_err(|source| DaemonError::Bind { addr: config.listen.clone(), source })?;

        let ctx = Arc::new(ListenCtx {
            pool: Arc::clone(&pool),
            gate: Arc::clone(&gate),
            repo,
            containers,
            retrier,
            agent: config.agent.clone(),
            workspace_root: config.workspace_root(),
            cancel: cancel.clone(),
        });
        tokio::spawn(listener::run(tcp, ctx));

        sink_dyn.emit(AuditEvent::DaemonStarted { pid: std::process::id() });
        info!(%local_addr, "amuxd listening");

        Ok(Self { config, pool, gate, recovery, sink, local_addr, cancel, sink_cancel })
    }

    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn gate(&self) -> &Arc<AccessGate<SystemClock>> {
        &self.gate
    }

    pub fn pool(&self) -> &Arc<SessionPool<SystemClock>> {
        &self.pool
    }

    /// Re-read the roles file and bump the policy version.
    pub fn reload_policies(&self) -> Result<(), DaemonError> {
        let Some(path) = &self.config.policy_file else {
            return Ok(());
        };
        let text = std::fs::read_to_string(path).map_err(DaemonError::StateDir)?;
        self.gate.reload(PolicySet::from_toml_str(&text)?);
        Ok(())
    }

    /// Park until cancelled.
    pub async fn wait(&self) {
        self.cancel.cancelled().await;
    }

    /// Drain the pool and stop every task.
    pub async fn shutdown(&self) {
        info!("amuxd shutting down");
        self.cancel.cancel();
        self.recovery.stop();
        let drained = self.pool.shutdown().await;
        self.sink.emit(AuditEvent::DaemonShutdown { drained_sessions: drained });
        // Give the sink a beat to flush the final events.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.sink_cancel.cancel();
    }
}
