// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use amux_core::{CaptureSink, FakeClock};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

const ROLES: &str = r#"
version = 1

[[role]]
name = "viewer"

[[role.permission]]
resource_type = "workspace"
action = "read"
effect = "allow"

[[role]]
name = "developer"
inherits = ["viewer"]

[[role.permission]]
resource_type = "workspace"
action = "attach"
effect = "allow"

[[role]]
name = "banned"

[[role.permission]]
resource_type = "workspace"
action = "*"
effect = "deny"
"#;

struct FakeDirectory {
    roles: Mutex<HashMap<String, Vec<String>>>,
    calls: Mutex<usize>,
}

impl FakeDirectory {
    fn new(entries: &[(&str, &[&str])]) -> Arc<Self> {
        let mut roles = HashMap::new();
        for (principal, names) in entries {
            roles.insert(
                principal.to_string(),
                names.iter().map(|n| n.to_string()).collect(),
            );
        }
        Arc::new(Self { roles: Mutex::new(roles), calls: Mutex::new(0) })
    }

    fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl SubjectDirectory for FakeDirectory {
    async fn roles_of(&self, principal: &PrincipalId) -> Result<Vec<String>, GateError> {
        *self.calls.lock() += 1;
        Ok(self.roles.lock().get(principal.as_str()).cloned().unwrap_or_default())
    }
}

struct Harness {
    gate: AccessGate<FakeClock>,
    directory: Arc<FakeDirectory>,
    clock: FakeClock,
    sink: CaptureSink,
}

fn harness(entries: &[(&str, &[&str])]) -> Harness {
    let clock = FakeClock::new();
    let sink = CaptureSink::new();
    let directory = FakeDirectory::new(entries);
    let gate = AccessGate::new(
        AccessConfig::default(),
        PolicySet::from_toml_str(ROLES).unwrap(),
        Arc::clone(&directory) as Arc<dyn SubjectDirectory>,
        clock.clone(),
        Arc::new(sink.clone()),
    );
    Harness { gate, directory, clock, sink }
}

fn principal(name: &str) -> PrincipalId {
    PrincipalId::from_string(name)
}

#[tokio::test]
async fn grants_through_direct_role() {
    let h = harness(&[("usr-dev", &["developer"])]);
    let decision = h
        .gate
        .authorize(principal("usr-dev"), "workspace", "wks-1", "attach")
        .await
        .unwrap();
    assert!(decision.allow);
    assert!(decision.reason.contains("developer"));
}

#[tokio::test]
async fn grants_through_inherited_role() {
    let h = harness(&[("usr-dev", &["developer"])]);
    let decision = h
        .gate
        .authorize(principal("usr-dev"), "workspace", "wks-1", "read")
        .await
        .unwrap();
    assert!(decision.allow, "read comes from the inherited viewer role");
}

#[tokio::test]
async fn denies_without_matching_permission() {
    let h = harness(&[("usr-view", &["viewer"])]);
    let decision = h
        .gate
        .authorize(principal("usr-view"), "workspace", "wks-1", "attach")
        .await
        .unwrap();
    assert!(!decision.allow);
    assert!(decision.reason.contains("no role grants"));
    assert_eq!(h.sink.tagged("access:denied").len(), 1);
}

#[tokio::test]
async fn explicit_deny_beats_every_allow() {
    let h = harness(&[("usr-sus", &["developer", "banned"])]);
    let decision = h
        .gate
        .authorize(principal("usr-sus"), "workspace", "wks-1", "attach")
        .await
        .unwrap();
    assert!(!decision.allow);
    assert!(decision.reason.contains("banned"));
}

#[tokio::test]
async fn unknown_principal_is_denied() {
    let h = harness(&[]);
    let decision = h
        .gate
        .authorize(principal("usr-ghost"), "workspace", "wks-1", "read")
        .await
        .unwrap();
    assert!(!decision.allow);
}

#[tokio::test]
async fn positive_hits_come_from_cache() {
    let h = harness(&[("usr-dev", &["developer"])]);
    for _ in 0..3 {
        let decision = h
            .gate
            .authorize(principal("usr-dev"), "workspace", "wks-1", "attach")
            .await
            .unwrap();
        assert!(decision.allow);
    }
    assert_eq!(h.directory.calls(), 1, "two decisions served from cache");
}

#[tokio::test]
async fn denials_are_cached_as_well() {
    let h = harness(&[("usr-view", &["viewer"])]);
    for _ in 0..2 {
        let _ = h
            .gate
            .authorize(principal("usr-view"), "workspace", "wks-1", "attach")
            .await
            .unwrap();
    }
    assert_eq!(h.directory.calls(), 1);
}

#[tokio::test]
async fn cache_expires_after_ttl() {
    let h = harness(&[("usr-dev", &["developer"])]);
    let _ = h
        .gate
        .authorize(principal("usr-dev"), "workspace", "wks-1", "attach")
        .await
        .unwrap();
    h.clock.advance(AccessConfig::default().cache_ttl + Duration::from_secs(1));
    let _ = h
        .gate
        .authorize(principal("usr-dev"), "workspace", "wks-1", "attach")
        .await
        .unwrap();
    assert_eq!(h.directory.calls(), 2);
}

#[tokio::test]
async fn policy_reload_invalidates_prior_decisions() {
    let h = harness(&[("usr-dev", &["developer"])]);
    let before = h
        .gate
        .authorize(principal("usr-dev"), "workspace", "wks-1", "attach")
        .await
        .unwrap();
    assert!(before.allow);

    // New policy set revokes attach from developer.
    let revoked = r#"
        version = 2

        [[role]]
        name = "viewer"

        [[role]]
        name = "developer"
        inherits = ["viewer"]
    "#;
    h.gate.reload(PolicySet::from_toml_str(revoked).unwrap());
    assert_eq!(h.sink.tagged("access:policy_reloaded").len(), 1);

    let after = h
        .gate
        .authorize(principal("usr-dev"), "workspace", "wks-1", "attach")
        .await
        .unwrap();
    assert!(!after.allow, "no decision computed before the bump may be served after it");
    assert_eq!(h.directory.calls(), 2);
}

#[tokio::test]
async fn reload_bumps_version_monotonically() {
    let h = harness(&[]);
    let v0 = h.gate.policy_version();
    h.gate.reload(PolicySet::empty());
    h.gate.reload(PolicySet::empty());
    assert_eq!(h.gate.policy_version(), v0 + 2);
}
