// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! amux-daemon: the `amuxd` server.
//!
//! Composes the pool, recovery, access gate, and streaming crates
//! behind a WebSocket listener, and exposes the wire protocol types for
//! client implementations.

pub mod adapters;
pub mod config;
pub mod listener;
pub mod protocol;
pub mod runtime;

pub use adapters::{
    ChannelSink, FakeContainers, HostContainers, MemoryRepository, RepoDirectory, RepoError,
    Repository,
};
pub use config::DaemonConfig;
pub use protocol::{ClientFrame, ServerFrame};
pub use runtime::Daemon;
