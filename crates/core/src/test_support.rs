// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared helpers for this crate's tests and, behind the `test-support`
//! feature, for other crates' tests.

use crate::event::{AuditEvent, EventSink};
use parking_lot::Mutex;
use std::sync::Arc;

/// Sink that records every emitted event for assertions.
#[derive(Clone, Default)]
pub struct CaptureSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Events whose tag matches, e.g. `"pool:scale_up"`.
    pub fn tagged(&self, tag: &str) -> Vec<AuditEvent> {
        self.events.lock().iter().filter(|e| e.tag() == tag).cloned().collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}
