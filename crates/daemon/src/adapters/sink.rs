// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Audit sink: non-blocking fan-in to the repository.
//!
//! `emit` never blocks the caller; events ride a bounded channel to a
//! writer task. When the channel backs up events are shed and the shed
//! count is reported once the channel drains.

use super::repo::Repository;
use amux_core::{AuditEvent, EventSink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct ChannelSink {
    tx: mpsc::Sender<AuditEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Spawn the writer task and return the sink.
    pub fn spawn(repo: Arc<dyn Repository>, cancel: CancellationToken) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(1024);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = rx.recv() => match event {
                        Some(event) => {
                            tracing::debug!("audit: {}", event.log_summary());
                            if let Err(err) = repo.append_audit(event).await {
                                tracing::warn!(%err, "audit write failed");
                            }
                        }
                        None => return,
                    },
                }
            }
        });
        Arc::new(Self { tx, dropped: AtomicU64::new(0) })
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: AuditEvent) {
        // Report prior shedding first so the drop count lands in the
        // trail near where it happened.
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 && self.tx.try_send(AuditEvent::SinkDropped { count: dropped }).is_err() {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
        }
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
#[path = "sink_tests.rs"]
mod tests;
