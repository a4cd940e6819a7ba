// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Container-controller implementations.
//!
//! [`HostContainers`] is the degenerate single-node backend: a
//! "container" is a workspace directory on the host, created and
//! removed in place. [`FakeContainers`] is a scriptable fake for the
//! recovery and breaker test suites.

use amux_core::{ContainerId, WorkspaceId};
use amux_engine::{ContainerController, ContainerError, ContainerState, WorkspaceSpec};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

struct HostEntry {
    id: ContainerId,
    spec: WorkspaceSpec,
    running: bool,
}

/// Workspace directories on the local host.
pub struct HostContainers {
    root: PathBuf,
    entries: Mutex<HashMap<WorkspaceId, HostEntry>>,
}

impl HostContainers {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), entries: Mutex::new(HashMap::new()) }
    }

    /// Directory backing a workspace.
    pub fn workspace_dir(&self, workspace: &WorkspaceId) -> PathBuf {
        self.root.join(workspace.as_str())
    }

    fn entry_id(&self, id: &ContainerId) -> Result<WorkspaceId, ContainerError> {
        self.entries
            .lock()
            .iter()
            .find(|(_, e)| e.id == *id)
            .map(|(w, _)| *w)
            .ok_or_else(|| ContainerError::Gone(format!("no such container {}", id)))
    }
}

#[async_trait]
impl ContainerController for HostContainers {
    async fn create(&self, spec: &WorkspaceSpec) -> Result<ContainerId, ContainerError> {
        let dir = self.workspace_dir(&spec.workspace);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ContainerError::Unavailable(format!("mkdir {}: {}", dir.display(), e)))?;
        let id = ContainerId::generate();
        self.entries.lock().insert(
            spec.workspace,
            HostEntry { id, spec: spec.clone(), running: false },
        );
        Ok(id)
    }

    async fn start(&self, id: &ContainerId) -> Result<(), ContainerError> {
        let workspace = self.entry_id(id)?;
        if let Some(entry) = self.entries.lock().get_mut(&workspace) {
            entry.running = true;
        }
        Ok(())
    }

    async fn stop(&self, id: &ContainerId, _grace: Duration) -> Result<(), ContainerError> {
        let workspace = self.entry_id(id)?;
        if let Some(entry) = self.entries.lock().get_mut(&workspace) {
            entry.running = false;
        }
        Ok(())
    }

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerState, ContainerError> {
        let workspace = self.entry_id(id)?;
        let entries = self.entries.lock();
        let entry = entries
            .get(&workspace)
            .ok_or_else(|| ContainerError::Gone(format!("no such container {}", id)))?;
        Ok(ContainerState { id: entry.id, running: entry.running, pid: None, rss_bytes: 0 })
    }

    async fn remove(&self, id: &ContainerId) -> Result<(), ContainerError> {
        let workspace = self.entry_id(id)?;
        self.entries.lock().remove(&workspace);
        Ok(())
    }

    async fn lookup(&self, workspace: &WorkspaceId) -> Option<ContainerId> {
        self.entries.lock().get(workspace).map(|e| e.id)
    }

    async fn recreate(&self, workspace: &WorkspaceId) -> Result<ContainerId, ContainerError> {
        let spec = {
            let entries = self.entries.lock();
            entries
                .get(workspace)
                .map(|e| e.spec.clone())
                .ok_or_else(|| ContainerError::Gone(format!("workspace {} unknown", workspace)))?
        };
        if let Some(id) = self.lookup(workspace).await {
            let _ = self.remove(&id).await;
        }
        self.create(&spec).await
    }
}

/// Scriptable fake: fail the next N calls, count everything.
#[derive(Default)]
pub struct FakeContainers {
    fail_next: Mutex<u32>,
    calls: Mutex<u32>,
    containers: Mutex<HashMap<WorkspaceId, ContainerId>>,
}

impl FakeContainers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, calls: u32) {
        *self.fail_next.lock() = calls;
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock()
    }

    fn gate(&self) -> Result<(), ContainerError> {
        *self.calls.lock() += 1;
        let mut fail = self.fail_next.lock();
        if *fail > 0 {
            *fail -= 1;
            return Err(ContainerError::Unavailable("container unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerController for FakeContainers {
    async fn create(&self, spec: &WorkspaceSpec) -> Result<ContainerId, ContainerError> {
        self.gate()?;
        let id = ContainerId::generate();
        self.containers.lock().insert(spec.workspace, id);
        Ok(id)
    }

    async fn start(&self, _id: &ContainerId) -> Result<(), ContainerError> {
        self.gate()
    }

    async fn stop(&self, _id: &ContainerId, _grace: Duration) -> Result<(), ContainerError> {
        self.gate()
    }

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerState, ContainerError> {
        self.gate()?;
        Ok(ContainerState { id: *id, running: true, pid: None, rss_bytes: 0 })
    }

    async fn remove(&self, id: &ContainerId) -> Result<(), ContainerError> {
        self.gate()?;
        self.containers.lock().retain(|_, c| c != id);
        Ok(())
    }

    async fn lookup(&self, workspace: &WorkspaceId) -> Option<ContainerId> {
        self.containers.lock().get(workspace).copied()
    }

    async fn recreate(&self, workspace: &WorkspaceId) -> Result<ContainerId, ContainerError> {
        self.gate()?;
        let id = ContainerId::generate();
        self.containers.lock().insert(*workspace, id);
        Ok(id)
    }
}

#[cfg(test)]
#[path = "container_tests.rs"]
mod tests;
