// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon configuration: `amux.toml` plus a handful of environment
//! overrides. The core knob sections live in `amux_core::config`; this
//! adds the daemon-only surface (listen address, state dir, policy
//! file, agent command).

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// The agent CLI every session runs. The working directory is filled
/// in per workspace.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentCommand {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self { command: "claude".to_string(), args: vec!["agent".to_string()] }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// TCP address the WebSocket listener binds.
    pub listen: String,
    /// Pidfile, logs, and workspace directories live under here.
    pub state_dir: PathBuf,
    /// Roles file; absent means an empty policy set (deny everything).
    pub policy_file: Option<PathBuf>,
    pub agent: AgentCommand,
    pub pool: amux_core::PoolConfig,
    pub session: amux_core::SessionConfig,
    pub stream: amux_core::StreamConfig,
    pub breaker: amux_core::BreakerConfig,
    pub retry: amux_core::RetryConfig,
    pub access: amux_core::AccessConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8787".to_string(),
            state_dir: default_state_dir(),
            policy_file: None,
            agent: AgentCommand::default(),
            pool: amux_core::PoolConfig::default(),
            session: amux_core::SessionConfig::default(),
            stream: amux_core::StreamConfig::default(),
            breaker: amux_core::BreakerConfig::default(),
            retry: amux_core::RetryConfig::default(),
            access: amux_core::AccessConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| {
                    ConfigError::Read { path: path.to_path_buf(), source }
                })?;
                Ok(toml::from_str(&text)?)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.state_dir.join("workspaces")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn pidfile(&self) -> PathBuf {
        self.state_dir.join("amuxd.pid")
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from("/var/lib")).join("amux")
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
