// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Narrow persistence interface.
//!
//! The core needs session metadata, execution roll-ups, an audit trail,
//! auth-token resolution, and principal→role lookup. All writes are
//! idempotent by primary key; no transactions.

use amux_access::{GateError, SubjectDirectory};
use amux_core::{AuditEvent, ExecutionSummary, PrincipalId, SessionId, SessionRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Repository: Send + Sync + 'static {
    async fn put_session(&self, record: SessionRecord) -> Result<(), RepoError>;

    async fn get_session(&self, id: SessionId) -> Result<Option<SessionRecord>, RepoError>;

    async fn delete_session(&self, id: SessionId) -> Result<(), RepoError>;

    async fn put_execution(
        &self,
        session: SessionId,
        summary: ExecutionSummary,
    ) -> Result<(), RepoError>;

    async fn append_audit(&self, event: AuditEvent) -> Result<(), RepoError>;

    /// Resolve a connection auth token to its principal.
    async fn resolve_token(&self, token: &str) -> Result<Option<PrincipalId>, RepoError>;

    /// Effective role names for a principal, group roles flattened in.
    async fn roles_of(&self, principal: &PrincipalId) -> Result<Vec<String>, RepoError>;
}

/// In-memory repository for single-node use and tests.
#[derive(Default)]
pub struct MemoryRepository {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
    executions: Mutex<HashMap<SessionId, Vec<ExecutionSummary>>>,
    audit: Mutex<Vec<AuditEvent>>,
    tokens: Mutex<HashMap<String, PrincipalId>>,
    roles: Mutex<HashMap<PrincipalId, Vec<String>>>,
}

impl MemoryRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an auth token for a principal.
    pub fn insert_token(&self, token: impl Into<String>, principal: PrincipalId) {
        self.tokens.lock().insert(token.into(), principal);
    }

    /// Mint a random bearer token for a principal.
    pub fn issue_token(&self, principal: PrincipalId) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.tokens.lock().insert(token.clone(), principal);
        token
    }

    /// Assign role names to a principal.
    pub fn insert_roles(&self, principal: PrincipalId, roles: Vec<String>) {
        self.roles.lock().insert(principal, roles);
    }

    pub fn audit_len(&self) -> usize {
        self.audit.lock().len()
    }

    pub fn executions_of(&self, session: SessionId) -> Vec<ExecutionSummary> {
        self.executions.lock().get(&session).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn put_session(&self, record: SessionRecord) -> Result<(), RepoError> {
        self.sessions.lock().insert(record.id, record);
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<SessionRecord>, RepoError> {
        Ok(self.sessions.lock().get(&id).cloned())
    }

    async fn delete_session(&self, id: SessionId) -> Result<(), RepoError> {
        self.sessions.lock().remove(&id);
        Ok(())
    }

    async fn put_execution(
        &self,
        session: SessionId,
        summary: ExecutionSummary,
    ) -> Result<(), RepoError> {
        let mut executions = self.executions.lock();
        let list = executions.entry(session).or_default();
        list.retain(|s| s.execution_id != summary.execution_id);
        list.push(summary);
        Ok(())
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<(), RepoError> {
        self.audit.lock().push(event);
        Ok(())
    }

    async fn resolve_token(&self, token: &str) -> Result<Option<PrincipalId>, RepoError> {
        Ok(self.tokens.lock().get(token).copied())
    }

    async fn roles_of(&self, principal: &PrincipalId) -> Result<Vec<String>, RepoError> {
        Ok(self.roles.lock().get(principal).cloned().unwrap_or_default())
    }
}

/// Adapts a [`Repository`] to the access gate's directory interface.
pub struct RepoDirectory {
    repo: Arc<dyn Repository>,
}

impl RepoDirectory {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl SubjectDirectory for RepoDirectory {
    async fn roles_of(&self, principal: &PrincipalId) -> Result<Vec<String>, GateError> {
        self.repo
            .roles_of(principal)
            .await
            .map_err(|e| GateError::Directory(e.to_string()))
    }
}

#[cfg(test)]
#[path = "repo_tests.rs"]
mod tests;
