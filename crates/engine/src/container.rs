// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Container-control interface consumed by the engine.
//!
//! The runtime behind it (Docker, a microVM, plain host directories) is
//! someone else's problem; the engine only needs workspace-scoped
//! create/start/stop/inspect/remove plus a recreate used by the
//! `cleanup_and_recreate` recovery strategy.

use amux_core::{ContainerId, WorkspaceId};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("container unavailable: {0}")]
    Unavailable(String),

    #[error("container oom: {0}")]
    OutOfMemory(String),

    #[error("container gone: {0}")]
    Gone(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub id: ContainerId,
    pub running: bool,
    pub pid: Option<u32>,
    pub rss_bytes: u64,
}

/// Resource bounds and mounts for a workspace's container.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceSpec {
    pub workspace: WorkspaceId,
    pub root: PathBuf,
    pub memory_limit_bytes: u64,
    pub cpu_quota_pct: u32,
}

/// Abstract container control plane. Calls are serialized per container
/// by the implementation; distinct containers are independent.
#[async_trait]
pub trait ContainerController: Send + Sync + 'static {
    async fn create(&self, spec: &WorkspaceSpec) -> Result<ContainerId, ContainerError>;

    async fn start(&self, id: &ContainerId) -> Result<(), ContainerError>;

    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<(), ContainerError>;

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerState, ContainerError>;

    async fn remove(&self, id: &ContainerId) -> Result<(), ContainerError>;

    /// Container currently backing a workspace, if any.
    async fn lookup(&self, workspace: &WorkspaceId) -> Option<ContainerId>;

    /// Tear down and rebuild a workspace's container. Default is
    /// remove-then-create with the workspace's last known spec.
    async fn recreate(&self, workspace: &WorkspaceId) -> Result<ContainerId, ContainerError>;
}
