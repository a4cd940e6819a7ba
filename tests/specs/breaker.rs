// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Breaker over the container control plane: outages trip it, probes
//! close it again.

use amux_core::{BreakerConfig, FakeClock, RetryConfig, WorkspaceId};
use amux_daemon::FakeContainers;
use amux_engine::{ContainerController, WorkspaceSpec};
use amux_resilience::{BreakerRegistry, BreakerState, Classifier, Retrier, RetryError, Source};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn spec(workspace: &str) -> WorkspaceSpec {
    WorkspaceSpec {
        workspace: WorkspaceId::from_string(workspace),
        root: PathBuf::from("/tmp"),
        memory_limit_bytes: 1024 * 1024,
        cpu_quota_pct: 100,
    }
}

#[tokio::test]
async fn container_outage_opens_the_breaker_and_a_probe_closes_it() {
    let clock = FakeClock::new();
    let breaker_config = BreakerConfig {
        min_calls: 10,
        failure_rate: 0.5,
        open_duration: Duration::from_secs(10),
        halfopen_quota: 1,
        ..BreakerConfig::default()
    };
    let registry = Arc::new(BreakerRegistry::new(
        breaker_config,
        clock.clone(),
        Arc::new(amux_core::NullSink),
    ));
    let retrier = Arc::new(Retrier::new(
        RetryConfig { max_attempts: 1, jitter: false, ..RetryConfig::default() },
        Arc::new(Classifier::with_default_rules()),
        Arc::clone(&registry),
    ));
    let containers = Arc::new(FakeContainers::new());
    let cancel = CancellationToken::new();

    let create = |workspace: String| {
        let containers = Arc::clone(&containers);
        let retrier = Arc::clone(&retrier);
        let cancel = cancel.clone();
        async move {
            retrier
                .run(Source::Container, "container", &cancel, || {
                    let containers = Arc::clone(&containers);
                    let spec = spec(&workspace);
                    async move { containers.create(&spec).await }
                })
                .await
        }
    };

    // 8 of the first 10 calls fail: failure rate 0.8 >= 0.5.
    containers.fail_next(8);
    for i in 0..10 {
        let _ = create(format!("wks-{}", i)).await;
    }
    assert_eq!(registry.breaker("container").state(), BreakerState::Open);
    let calls_when_open = containers.calls();
    assert_eq!(calls_when_open, 10);

    // Open: the next create fails fast and no container call is made.
    match create("wks-next".to_string()).await {
        Err(RetryError::CircuitOpen(open)) => assert_eq!(open.target, "container"),
        other => panic!("expected CircuitOpen, got {:?}", other.map(|_| ())),
    }
    assert_eq!(containers.calls(), calls_when_open, "no call issued while open");

    // After the hold a half-open probe is admitted; it succeeds and the
    // breaker closes.
    clock.advance(Duration::from_secs(11));
    create("wks-probe".to_string()).await.expect("probe create");
    assert_eq!(containers.calls(), calls_when_open + 1);
    assert_eq!(registry.breaker("container").state(), BreakerState::Closed);

    // Closed again: calls flow normally.
    create("wks-after".to_string()).await.expect("create after close");
}
