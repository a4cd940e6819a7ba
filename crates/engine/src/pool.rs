// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session pool: warm reuse, affinity routing, sizing, and sweeps.
//!
//! Membership lives behind one mutex; per-session state is never
//! touched under it, only Arc references move. Acquisition prefers an
//! exact affinity hit, then a fingerprint-compatible reassignment, then
//! a fresh session under the size cap, then a fair FIFO wait.
//!
//! A scaler task keeps `warm_target` idle sessions around recent
//! affinity keys; a janitor task reaps the dead, enforces idle and
//! absolute TTLs, probes health, and surfaces leaked sessions.

use crate::recovery::Incident;
use crate::session::Session;
use amux_core::{
    AffinityKey, AgentProfile, AuditEvent, Clock, EventSink, Fault, FaultKind, IncidentId,
    PoolConfig, PrincipalId, SessionConfig, SessionId, SessionState, Severity, StreamConfig,
    WorkspaceId,
};
use amux_resilience::Source;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool exhausted: no session released within {0:?}")]
    Exhausted(Duration),

    #[error("memory cap reached: {used} of {cap} replay-buffer bytes in use")]
    BufferCap { used: usize, cap: usize },

    #[error("session start failed: {0}")]
    Start(Fault),

    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("pool is shutting down")]
    ShuttingDown,
}

/// A queued acquirer. `tx` is dropped when the waiter times out, so a
/// failed send just moves on to the next in line. `since` lets the
/// scaler treat long-suffering waiters as a scale-up signal.
struct Waiter<C: Clock> {
    fingerprint: String,
    principal: PrincipalId,
    workspace: WorkspaceId,
    since: std::time::Instant,
    tx: oneshot::Sender<Arc<Session<C>>>,
}

struct PoolInner<C: Clock> {
    idle: HashMap<AffinityKey, VecDeque<Arc<Session<C>>>>,
    active: HashMap<SessionId, Arc<Session<C>>>,
    terminating: HashMap<SessionId, Arc<Session<C>>>,
    waiters: VecDeque<Waiter<C>>,
    /// Sessions mid-startup, counted against `max`.
    starting: usize,
    /// Recently requested (principal, workspace, profile) triples, most
    /// recent last. The scaler warms these.
    recent: VecDeque<(PrincipalId, WorkspaceId, AgentProfile)>,
    last_scale_at: Option<std::time::Instant>,
    shutting_down: bool,
}

impl<C: Clock> PoolInner<C> {
    fn size(&self) -> usize {
        self.idle.values().map(VecDeque::len).sum::<usize>()
            + self.active.len()
            + self.terminating.len()
            + self.starting
    }

    fn idle_count(&self) -> usize {
        self.idle.values().map(VecDeque::len).sum()
    }
}

pub struct SessionPool<C: Clock> {
    config: PoolConfig,
    session_config: SessionConfig,
    stream_config: StreamConfig,
    clock: C,
    sink: Arc<dyn EventSink>,
    incident_tx: mpsc::Sender<Incident>,
    inner: Mutex<PoolInner<C>>,
    cancel: CancellationToken,
}

impl<C: Clock> SessionPool<C> {
    pub fn new(
        config: PoolConfig,
        session_config: SessionConfig,
        stream_config: StreamConfig,
        clock: C,
        sink: Arc<dyn EventSink>,
        incident_tx: mpsc::Sender<Incident>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            session_config,
            stream_config,
            clock,
            sink,
            incident_tx,
            inner: Mutex::new(PoolInner {
                idle: HashMap::new(),
                active: HashMap::new(),
                terminating: HashMap::new(),
                waiters: VecDeque::new(),
                starting: 0,
                recent: VecDeque::new(),
                last_scale_at: None,
                shutting_down: false,
            }),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(Self::scaler_loop(Arc::downgrade(&pool)));
        tokio::spawn(Self::janitor_loop(Arc::downgrade(&pool)));
        pool
    }

    /// Acquire a session for (principal, workspace, profile).
    pub async fn acquire(
        &self,
        principal: PrincipalId,
        workspace: WorkspaceId,
        profile: AgentProfile,
    ) -> Result<Arc<Session<C>>, PoolError> {
        let key = AffinityKey::new(principal, workspace, &profile);
        let wait_rx = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return Err(PoolError::ShuttingDown);
            }
            self.note_recent(&mut inner, principal, workspace, &profile);

            // 1. Exact affinity hit.
            while let Some(session) = pop_idle(&mut inner.idle, &key) {
                if session.state().is_acquirable() && session.health().map(|h| h.alive).unwrap_or(false)
                {
                    inner.active.insert(session.id(), Arc::clone(&session));
                    return Ok(session);
                }
                self.destroy_detached(Arc::clone(&session), "unhealthy on acquire");
            }

            // 2. Fingerprint-compatible reassignment past the reuse
            //    threshold.
            if inner.idle_count() >= self.config.reuse_threshold {
                if let Some(session) =
                    take_by_fingerprint(&mut inner.idle, &profile.fingerprint())
                {
                    session.reassign(principal, workspace);
                    inner.active.insert(session.id(), Arc::clone(&session));
                    return Ok(session);
                }
            }

            // 3. Create under the cap.
            if inner.size() < self.config.max {
                self.check_buffer_cap(&inner)?;
                inner.starting += 1;
                None
            } else {
                // 4. Fair FIFO wait.
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(Waiter {
                    fingerprint: profile.fingerprint(),
                    principal,
                    workspace,
                    since: self.clock.now(),
                    tx,
                });
                self.sink.emit(AuditEvent::PoolExhausted { waiters: inner.waiters.len() });
                Some(rx)
            }
        };

        match wait_rx {
            None => self.create_session(principal, workspace, profile).await,
            Some(rx) => {
                match tokio::time::timeout(self.config.acquire_deadline, rx).await {
                    Ok(Ok(session)) => Ok(session),
                    Ok(Err(_)) => {
                        if self.inner.lock().shutting_down {
                            Err(PoolError::ShuttingDown)
                        } else {
                            Err(PoolError::Exhausted(self.config.acquire_deadline))
                        }
                    }
                    Err(_) => {
                        // Timed out: drop our waiter slot.
                        let mut inner = self.inner.lock();
                        inner.waiters.retain(|w| !w.tx.is_closed());
                        Err(PoolError::Exhausted(self.config.acquire_deadline))
                    }
                }
            }
        }
    }

    /// Return a session to the idle lists. A session that is not back
    /// in an acquirable state is destroyed instead.
    pub async fn release(&self, session: Arc<Session<C>>) {
        session.release().await;
        let id = session.id();

        let handoff = {
            let mut inner = self.inner.lock();
            if inner.active.remove(&id).is_none() {
                tracing::warn!(session = %id, "release of unknown session");
                return;
            }

            if !session.state().is_acquirable() {
                inner.terminating.insert(id, Arc::clone(&session));
                Some(Handoff::Destroy(session))
            } else if let Some(waiter) = next_live_waiter(&mut inner.waiters) {
                if waiter.fingerprint == session.profile().fingerprint() {
                    session.reassign(waiter.principal, waiter.workspace);
                    inner.active.insert(id, Arc::clone(&session));
                    Some(Handoff::Wake(waiter, session))
                } else {
                    // Wrong shape for the head of the line: recycle the
                    // slot so the waiter can start fresh.
                    inner.terminating.insert(id, Arc::clone(&session));
                    inner.starting += 1;
                    Some(Handoff::Recycle(waiter, session))
                }
            } else {
                inner.idle.entry(session.affinity()).or_default().push_back(session);
                None
            }
        };

        match handoff {
            None => {}
            Some(Handoff::Wake(waiter, session)) => {
                if let Err(session) = waiter.tx.send(session) {
                    // Waiter vanished between checks; park the session.
                    let mut inner = self.inner.lock();
                    inner.active.remove(&session.id());
                    inner.idle.entry(session.affinity()).or_default().push_back(session);
                }
            }
            Some(Handoff::Destroy(session)) => {
                self.destroy(session, "released in non-idle state").await;
            }
            Some(Handoff::Recycle(waiter, session)) => {
                self.destroy(session, "recycled for waiter").await;
                let created = self
                    .create_session(waiter.principal, waiter.workspace, None)
                    .await;
                match created {
                    Ok(session) => {
                        if waiter.tx.send(session).is_err() {
                            tracing::debug!("waiter gone before recycled session arrived");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, "failed to recycle a session for a waiter");
                        drop(waiter);
                    }
                }
            }
        }
    }

    /// Destroy a session and create a replacement with the same
    /// identity and profile, continuing the seq cursor.
    pub async fn replace(&self, id: SessionId) -> Result<Arc<Session<C>>, PoolError> {
        let session = self.find(id).ok_or(PoolError::NotFound(id))?;
        let principal = session.principal();
        let workspace = session.workspace();
        let profile = session.profile().clone();
        let cursor = session.hub().last_seq();

        self.remove_everywhere(id);
        {
            let mut inner = self.inner.lock();
            inner.terminating.insert(id, Arc::clone(&session));
        }
        self.destroy(session, "replaced").await;

        {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return Err(PoolError::ShuttingDown);
            }
            inner.starting += 1;
        }
        self.spawn_session(principal, workspace, profile, cursor + 1).await
    }

    /// Mark a session failed, notify its subscribers, and drop it from
    /// the pool. Terminal step of the `surface` strategy.
    pub async fn surface(&self, id: SessionId, fault: Fault) {
        if let Some(session) = self.find(id) {
            self.remove_everywhere(id);
            session.fail(fault).await;
        }
    }

    /// Look a session up across idle, active, and terminating sets.
    pub fn find(&self, id: SessionId) -> Option<Arc<Session<C>>> {
        let inner = self.inner.lock();
        if let Some(session) = inner.active.get(&id) {
            return Some(Arc::clone(session));
        }
        if let Some(session) = inner.terminating.get(&id) {
            return Some(Arc::clone(session));
        }
        inner
            .idle
            .values()
            .flat_map(|list| list.iter())
            .find(|s| s.id() == id)
            .map(Arc::clone)
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock();
        (inner.idle_count(), inner.active.len(), inner.terminating.len())
    }

    pub fn size(&self) -> usize {
        self.inner.lock().size()
    }

    /// Drain everything. Returns the number of sessions terminated.
    pub async fn shutdown(&self) -> usize {
        self.cancel.cancel();
        let sessions: Vec<Arc<Session<C>>> = {
            let mut inner = self.inner.lock();
            inner.shutting_down = true;
            inner.waiters.clear();
            let mut all: Vec<Arc<Session<C>>> = inner.active.values().map(Arc::clone).collect();
            all.extend(inner.terminating.values().map(Arc::clone));
            all.extend(inner.idle.values().flat_map(|l| l.iter().map(Arc::clone)));
            inner.active.clear();
            inner.terminating.clear();
            inner.idle.clear();
            all
        };
        let drained = sessions.len();
        for session in sessions {
            session.terminate().await;
        }
        drained
    }

    async fn create_session(
        &self,
        principal: PrincipalId,
        workspace: WorkspaceId,
        profile: impl Into<Option<AgentProfile>>,
    ) -> Result<Arc<Session<C>>, PoolError> {
        let profile = match profile.into() {
            Some(profile) => profile,
            None => {
                // Recycled waiter path: profile comes off the recent list.
                let inner = self.inner.lock();
                match inner
                    .recent
                    .iter()
                    .rev()
                    .find(|(p, w, _)| *p == principal && *w == workspace)
                {
                    Some((_, _, profile)) => profile.clone(),
                    None => {
                        drop(inner);
                        self.inner.lock().starting -= 1;
                        return Err(PoolError::Start(Fault::new(
                            FaultKind::Internal,
                            Severity::Medium,
                            "no profile on record for recycled waiter",
                        )));
                    }
                }
            }
        };
        self.spawn_session(principal, workspace, profile, 1).await
    }

    async fn spawn_session(
        &self,
        principal: PrincipalId,
        workspace: WorkspaceId,
        profile: AgentProfile,
        start_seq: u64,
    ) -> Result<Arc<Session<C>>, PoolError> {
        let id = SessionId::generate();
        let (session, ready_rx) = Session::spawn(
            id,
            workspace,
            principal,
            profile,
            self.session_config.clone(),
            self.stream_config.clone(),
            self.clock.clone(),
            Arc::clone(&self.sink),
            self.incident_tx.clone(),
            start_seq,
        );

        let readiness = ready_rx.await;
        let mut inner = self.inner.lock();
        inner.starting -= 1;
        match readiness {
            Ok(Ok(())) => {
                inner.active.insert(id, Arc::clone(&session));
                drop(inner);
                self.sink.emit(AuditEvent::SessionCreated { id, workspace, principal });
                Ok(session)
            }
            Ok(Err(fault)) => Err(PoolError::Start(fault)),
            Err(_) => Err(PoolError::Start(Fault::new(
                FaultKind::Internal,
                Severity::High,
                "session owner task vanished during startup",
            ))),
        }
    }

    fn check_buffer_cap(&self, inner: &PoolInner<C>) -> Result<(), PoolError> {
        let used: usize = inner
            .active
            .values()
            .chain(inner.idle.values().flat_map(|l| l.iter()))
            .map(|s| s.retained_bytes())
            .sum();
        if used > self.config.global_buffer_cap_bytes {
            return Err(PoolError::BufferCap {
                used,
                cap: self.config.global_buffer_cap_bytes,
            });
        }
        Ok(())
    }

    fn note_recent(
        &self,
        inner: &mut PoolInner<C>,
        principal: PrincipalId,
        workspace: WorkspaceId,
        profile: &AgentProfile,
    ) {
        inner
            .recent
            .retain(|(p, w, pr)| !(*p == principal && *w == workspace && pr == profile));
        inner.recent.push_back((principal, workspace, profile.clone()));
        while inner.recent.len() > 8 {
            inner.recent.pop_front();
        }
    }

    /// Fire-and-forget destruction for paths inside the pool lock.
    fn destroy_detached(&self, session: Arc<Session<C>>, reason: &'static str) {
        tokio::spawn(async move {
            tracing::debug!(session = %session.id(), reason, "destroying session");
            session.terminate().await;
        });
    }

    async fn destroy(&self, session: Arc<Session<C>>, reason: &str) {
        tracing::debug!(session = %session.id(), reason, "destroying session");
        session.terminate().await;
        self.inner.lock().terminating.remove(&session.id());
    }

    fn remove_everywhere(&self, id: SessionId) {
        let mut inner = self.inner.lock();
        inner.active.remove(&id);
        inner.terminating.remove(&id);
        for list in inner.idle.values_mut() {
            list.retain(|s| s.id() != id);
        }
        inner.idle.retain(|_, list| !list.is_empty());
    }

    // --- scaler ---

    async fn scaler_loop(pool: std::sync::Weak<Self>) {
        let (tick, cancel) = match pool.upgrade() {
            Some(p) => (p.config.sweep_interval, p.cancel.clone()),
            None => return,
        };
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            let Some(pool) = pool.upgrade() else { return };
            pool.scale_once().await;
        }
    }

    async fn scale_once(&self) {
        let decision = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return;
            }
            let now = self.clock.now();
            let cooled = inner
                .last_scale_at
                .map(|at| now.duration_since(at) >= self.config.scale_cooldown)
                .unwrap_or(true);

            let idle = inner.idle_count();
            let size = inner.size();
            let below_min = size < self.config.min;
            let waiters_aged = inner.waiters.iter().any(|w| {
                !w.tx.is_closed()
                    && now.duration_since(w.since) > self.config.acquire_wait_high
            });
            // Restoring the min floor bypasses the cooldown so the pool
            // recovers its baseline within a sweep tick.
            if !cooled && !below_min {
                return;
            }

            if size < self.config.max
                && (below_min || idle < self.config.warm_target || waiters_aged)
            {
                // Warm the most recent key without an idle session.
                let target = inner
                    .recent
                    .iter()
                    .rev()
                    .find(|(p, w, profile)| {
                        let key = AffinityKey::new(*p, *w, profile);
                        inner.idle.get(&key).map(|l| l.is_empty()).unwrap_or(true)
                    })
                    .cloned();
                if let Some((principal, workspace, profile)) = target {
                    inner.starting += 1;
                    inner.last_scale_at = Some(now);
                    self.sink.emit(AuditEvent::PoolScaleUp { size, target: size + 1 });
                    Some(ScaleDecision::Up { principal, workspace, profile })
                } else {
                    None
                }
            } else if idle > self.config.warm_target && size > self.config.min {
                // Shed the oldest surplus idle session, but never below
                // the min floor.
                let victim = inner
                    .idle
                    .values()
                    .flat_map(|l| l.iter())
                    .filter(|s| s.idle_age() >= self.config.scale_down_idle)
                    .max_by_key(|s| s.idle_age())
                    .map(Arc::clone);
                match victim {
                    Some(session) => {
                        let id = session.id();
                        for list in inner.idle.values_mut() {
                            list.retain(|s| s.id() != id);
                        }
                        inner.idle.retain(|_, list| !list.is_empty());
                        inner.terminating.insert(id, Arc::clone(&session));
                        inner.last_scale_at = Some(now);
                        self.sink.emit(AuditEvent::PoolScaleDown {
                            size: inner.size(),
                            evicted: id,
                        });
                        Some(ScaleDecision::Down(session))
                    }
                    None => None,
                }
            } else {
                None
            }
        };

        match decision {
            Some(ScaleDecision::Up { principal, workspace, profile }) => {
                match self.spawn_session(principal, workspace, profile, 1).await {
                    Ok(session) => self.park_or_hand_off(session),
                    Err(err) => tracing::warn!(%err, "warm scale-up failed"),
                }
            }
            Some(ScaleDecision::Down(session)) => {
                self.destroy(session, "scale down").await;
            }
            None => {}
        }
    }

    /// A freshly warmed session goes to the first waiter whose profile
    /// fingerprint it matches; otherwise it parks on the idle list.
    fn park_or_hand_off(&self, session: Arc<Session<C>>) {
        let waiter = {
            let mut inner = self.inner.lock();
            inner.active.remove(&session.id());
            match next_live_waiter(&mut inner.waiters) {
                Some(waiter) if waiter.fingerprint == session.profile().fingerprint() => {
                    session.reassign(waiter.principal, waiter.workspace);
                    inner.active.insert(session.id(), Arc::clone(&session));
                    Some(waiter)
                }
                other => {
                    if let Some(waiter) = other {
                        // Wrong shape: keep the waiter's place in line.
                        inner.waiters.push_front(waiter);
                    }
                    inner
                        .idle
                        .entry(session.affinity())
                        .or_default()
                        .push_back(Arc::clone(&session));
                    None
                }
            }
        };
        if let Some(waiter) = waiter {
            if let Err(session) = waiter.tx.send(session) {
                // Waiter vanished between checks; park the session.
                let mut inner = self.inner.lock();
                inner.active.remove(&session.id());
                inner.idle.entry(session.affinity()).or_default().push_back(session);
            }
        }
    }

    // --- janitor ---

    async fn janitor_loop(pool: std::sync::Weak<Self>) {
        let (tick, cancel) = match pool.upgrade() {
            Some(p) => (p.config.sweep_interval, p.cancel.clone()),
            None => return,
        };
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut rss_strikes: HashMap<SessionId, u8> = HashMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            let Some(pool) = pool.upgrade() else { return };
            pool.sweep_once(&mut rss_strikes).await;
        }
    }

    async fn sweep_once(&self, rss_strikes: &mut HashMap<SessionId, u8>) {
        let mut doomed: Vec<(Arc<Session<C>>, &'static str)> = Vec::new();
        let mut suspects: Vec<Arc<Session<C>>> = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return;
            }

            // Reap dead and expired idle sessions.
            let mut keep: HashMap<AffinityKey, VecDeque<Arc<Session<C>>>> = HashMap::new();
            for (key, list) in inner.idle.drain() {
                for session in list {
                    let dead = !session.health().map(|h| h.alive).unwrap_or(false);
                    let reason = if dead {
                        Some("supervisor dead")
                    } else if session.idle_age() >= self.config.idle_ttl {
                        Some("idle ttl")
                    } else if session.age() >= self.config.absolute_ttl {
                        Some("absolute ttl")
                    } else {
                        None
                    };
                    match reason {
                        Some(reason) => doomed.push((session, reason)),
                        None => keep.entry(key.clone()).or_default().push_back(session),
                    }
                }
            }
            inner.idle = keep;

            // Reap active sessions that already ended or failed out
            // from under their holder; they still count against max.
            let dead: Vec<Arc<Session<C>>> = inner
                .active
                .values()
                .filter(|s| s.state().is_terminal())
                .map(Arc::clone)
                .collect();
            for session in dead {
                inner.active.remove(&session.id());
                doomed.push((session, "ended outside the pool"));
            }

            // Surface leaks: active sessions nobody is driving.
            let leaked: Vec<SessionId> = inner
                .active
                .values()
                .filter(|s| {
                    s.state() == SessionState::Idle
                        && s.subscriber_count() == 0
                        && s.idle_age() >= self.config.idle_ttl
                })
                .map(|s| s.id())
                .collect();
            for id in leaked {
                if let Some(session) = inner.active.remove(&id) {
                    self.sink.emit(AuditEvent::PoolLeak { id });
                    inner.idle.entry(session.affinity()).or_default().push_back(session);
                }
            }

            // Health suspects: silent past the probe interval.
            for session in inner.active.values().chain(inner.idle.values().flat_map(|l| l.iter()))
            {
                if session.last_message_age() >= self.session_config.probe_interval {
                    suspects.push(Arc::clone(session));
                }
            }
        }

        for (session, reason) in doomed {
            let id = session.id();
            {
                let mut inner = self.inner.lock();
                inner.terminating.insert(id, Arc::clone(&session));
            }
            self.destroy(session, reason).await;
            rss_strikes.remove(&id);
        }

        for session in suspects {
            self.check_health(session, rss_strikes).await;
        }
    }

    async fn check_health(
        &self,
        session: Arc<Session<C>>,
        rss_strikes: &mut HashMap<SessionId, u8>,
    ) {
        let id = session.id();

        // RSS ceiling: two consecutive strikes mark the session
        // unhealthy.
        let over_ceiling = session
            .health()
            .map(|h| h.rss_bytes > self.session_config.rss_ceiling_bytes)
            .unwrap_or(false);
        let strikes = if over_ceiling {
            let strikes = rss_strikes.entry(id).or_insert(0);
            *strikes += 1;
            *strikes
        } else {
            rss_strikes.remove(&id);
            0
        };

        let unhealthy = if strikes >= 2 {
            true
        } else if session.state() == SessionState::Busy {
            // An execution is flowing; silence is judged by the
            // execution deadline, not the probe.
            false
        } else {
            // Inject a probe and give the agent `probe_deadline` to
            // produce anything.
            if !session.probe().await {
                true
            } else {
                tokio::time::sleep(self.session_config.probe_deadline).await;
                session.last_message_age() >= self.session_config.probe_interval
            }
        };

        if unhealthy {
            rss_strikes.remove(&id);
            self.remove_everywhere(id);
            {
                let mut inner = self.inner.lock();
                inner.terminating.insert(id, Arc::clone(&session));
            }
            let fault = Fault::new(
                if strikes >= 2 { FaultKind::Resource } else { FaultKind::Process },
                Severity::High,
                if strikes >= 2 {
                    format!("session {} rss over ceiling twice", id)
                } else {
                    format!("session {} unresponsive to probe", id)
                },
            )
            .context("session", id.to_string());
            let incident = Incident {
                id: IncidentId::generate(),
                session: Some(id),
                workspace: Some(session.workspace()),
                source: Source::Pool,
                fault,
            };
            if self.incident_tx.send(incident).await.is_err() {
                // No recovery attached: destroy outright.
                self.destroy(session, "unhealthy, no recovery").await;
            }
        }
    }
}

enum ScaleDecision<C: Clock> {
    Up { principal: PrincipalId, workspace: WorkspaceId, profile: AgentProfile },
    Down(Arc<Session<C>>),
}

enum Handoff<C: Clock> {
    Wake(Waiter<C>, Arc<Session<C>>),
    Destroy(Arc<Session<C>>),
    Recycle(Waiter<C>, Arc<Session<C>>),
}

fn pop_idle<C: Clock>(
    idle: &mut HashMap<AffinityKey, VecDeque<Arc<Session<C>>>>,
    key: &AffinityKey,
) -> Option<Arc<Session<C>>> {
    let list = idle.get_mut(key)?;
    let session = list.pop_back();
    if list.is_empty() {
        idle.remove(key);
    }
    session
}

fn take_by_fingerprint<C: Clock>(
    idle: &mut HashMap<AffinityKey, VecDeque<Arc<Session<C>>>>,
    fingerprint: &str,
) -> Option<Arc<Session<C>>> {
    let key = idle.keys().find(|k| k.fingerprint == fingerprint)?.clone();
    pop_idle(idle, &key)
}

fn next_live_waiter<C: Clock>(waiters: &mut VecDeque<Waiter<C>>) -> Option<Waiter<C>> {
    while let Some(waiter) = waiters.pop_front() {
        if !waiter.tx.is_closed() {
            return Some(waiter);
        }
    }
    None
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
