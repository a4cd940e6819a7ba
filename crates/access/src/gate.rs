// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The access gate: `authorize(principal, resource, action)`.
//!
//! Effective permissions are the union over the principal's roles
//! (groups are flattened into roles by the directory), with inherited
//! roles resolved through the policy set and any explicit deny winning
//! over every allow. Positive and negative decisions are both cached.

use crate::cache::{CacheKey, DecisionCache};
use crate::policy::{Effect, PolicySet};
use amux_core::{AccessConfig, AuditEvent, Clock, EventSink, PrincipalId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("subject directory unavailable: {0}")]
    Directory(String),

    #[error("authorize deadline elapsed")]
    Deadline,
}

/// An access decision with its reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allow: bool,
    pub reason: String,
}

impl Decision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self { allow: true, reason: reason.into() }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self { allow: false, reason: reason.into() }
    }
}

/// Maps a principal to its effective role names (direct roles plus the
/// roles of every group the principal belongs to).
#[async_trait]
pub trait SubjectDirectory: Send + Sync + 'static {
    async fn roles_of(&self, principal: &PrincipalId) -> Result<Vec<String>, GateError>;
}

pub struct AccessGate<C: Clock> {
    config: AccessConfig,
    policies: RwLock<Arc<PolicySet>>,
    directory: Arc<dyn SubjectDirectory>,
    cache: DecisionCache<C>,
    version: AtomicU64,
    sink: Arc<dyn EventSink>,
}

impl<C: Clock> AccessGate<C> {
    pub fn new(
        config: AccessConfig,
        policies: PolicySet,
        directory: Arc<dyn SubjectDirectory>,
        clock: C,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let cache = DecisionCache::new(config.cache_capacity, config.cache_ttl, clock);
        let version = AtomicU64::new(policies.version);
        Self {
            config,
            policies: RwLock::new(Arc::new(policies)),
            directory,
            cache,
            version,
            sink,
        }
    }

    /// Swap the policy set and bump the version; every cached decision
    /// computed under the old version becomes unservable.
    pub fn reload(&self, policies: PolicySet) {
        let roles = policies.role_count();
        let version = {
            let mut slot = self.policies.write();
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            *slot = Arc::new(policies);
            version
        };
        self.cache.clear();
        self.sink.emit(AuditEvent::PolicyReloaded { version, roles });
        tracing::info!(version, roles, "access policies reloaded");
    }

    pub fn policy_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Decide whether `principal` may perform `action` on the resource.
    /// Denials carry a reason; directory failures surface as errors for
    /// the caller to deny on.
    pub async fn authorize(
        &self,
        principal: PrincipalId,
        resource_type: &str,
        resource_id: &str,
        action: &str,
    ) -> Result<Decision, GateError> {
        let key = CacheKey {
            principal,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            action: action.to_string(),
        };
        let version = self.policy_version();
        if let Some(decision) = self.cache.get(&key, version) {
            return Ok(decision);
        }

        let roles = tokio::time::timeout(
            self.config.decision_deadline,
            self.directory.roles_of(&principal),
        )
        .await
        .map_err(|_| GateError::Deadline)??;

        let decision = self.evaluate(&roles, resource_type, resource_id, action);
        if !decision.allow {
            self.sink.emit(AuditEvent::AccessDenied {
                principal,
                resource: format!("{}/{}", resource_type, resource_id),
                action: action.to_string(),
                reason: decision.reason.clone(),
            });
        }
        self.cache.insert(key, decision.clone(), version);
        Ok(decision)
    }

    fn evaluate(
        &self,
        roles: &[String],
        resource_type: &str,
        resource_id: &str,
        action: &str,
    ) -> Decision {
        let policies = self.policies.read().clone();
        let mut allowed_by: Option<String> = None;
        for role in roles {
            for permission in policies.resolved_permissions(role) {
                if !permission.covers(resource_type, resource_id, action) {
                    continue;
                }
                match permission.effect {
                    Effect::Deny => {
                        return Decision::deny(format!(
                            "explicitly denied by role {}",
                            role
                        ));
                    }
                    Effect::Allow => {
                        allowed_by.get_or_insert_with(|| role.clone());
                    }
                }
            }
        }
        match allowed_by {
            Some(role) => Decision::allow(format!("granted by role {}", role)),
            None => Decision::deny(format!(
                "no role grants {}/{} {}",
                resource_type, resource_id, action
            )),
        }
    }
}

#[cfg(test)]
#[path = "gate_tests.rs"]
mod tests;
