// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ordered rule-table error classifier.
//!
//! Classification is a pure function of the error value and the rule
//! table: the first rule whose source filter and needle set match wins.
//! Errors that already carry a [`Fault`] pass through untouched, so a
//! component that knows its own taxonomy is never second-guessed.

use amux_core::{Fault, FaultKind, Severity, Strategy};
use parking_lot::RwLock;
use std::sync::Arc;

/// Component that raised the failure. Keyed into rules and into the
/// recovery orchestrator's strategy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Supervisor,
    Parser,
    Hub,
    Session,
    Pool,
    Container,
    Access,
    Listener,
}

amux_core::simple_display! {
    Source {
        Supervisor => "supervisor",
        Parser => "parser",
        Hub => "hub",
        Session => "session",
        Pool => "pool",
        Container => "container",
        Access => "access",
        Listener => "listener",
    }
}

/// One pattern-match rule.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Name for audit context; not matched against.
    pub name: &'static str,
    /// Restrict to one source component; `None` matches any.
    pub source: Option<Source>,
    /// Lowercase substrings matched against the rendered cause chain.
    /// Any hit satisfies the rule; an empty list matches everything
    /// from the rule's source.
    pub needles: &'static [&'static str],
    pub kind: FaultKind,
    pub severity: Severity,
    /// Override the kind's default disposition.
    pub retryable: Option<bool>,
    pub strategy: Option<Strategy>,
}

impl Rule {
    fn matches(&self, source: Source, haystack: &str) -> bool {
        if let Some(wanted) = self.source {
            if wanted != source {
                return false;
            }
        }
        if self.needles.is_empty() {
            return self.source.is_some();
        }
        self.needles.iter().any(|needle| haystack.contains(needle))
    }

    fn apply(&self, message: String, cause_chain: Vec<String>, source: Source) -> Fault {
        let mut fault = Fault::new(self.kind, self.severity, message)
            .context("rule", self.name)
            .context("source", source.to_string());
        fault.cause_chain = cause_chain;
        if let Some(retryable) = self.retryable {
            fault.retryable = retryable;
        }
        if let Some(strategy) = self.strategy {
            fault.strategy = strategy;
        }
        fault
    }
}

/// Hot-swappable classifier.
pub struct Classifier {
    rules: RwLock<Arc<Vec<Rule>>>,
}

impl Classifier {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules: RwLock::new(Arc::new(rules)) }
    }

    pub fn with_default_rules() -> Self {
        Self::new(default_rules())
    }

    /// Swap the rule table. In-flight classifications finish against the
    /// table they started with.
    pub fn replace_rules(&self, rules: Vec<Rule>) {
        *self.rules.write() = Arc::new(rules);
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    /// Map a raised error to a classified fault.
    pub fn classify(&self, source: Source, error: &(dyn std::error::Error + 'static)) -> Fault {
        // Pre-classified faults pass through, annotated with the source.
        if let Some(fault) = find_fault(error) {
            return fault.clone().context("source", source.to_string());
        }

        let mut cause_chain = vec![error.to_string()];
        let mut cursor = error.source();
        while let Some(cause) = cursor {
            cause_chain.push(cause.to_string());
            cursor = cause.source();
        }
        let haystack = cause_chain.join(": ").to_lowercase();

        let rules = self.rules.read().clone();
        for rule in rules.iter() {
            if rule.matches(source, &haystack) {
                return rule.apply(error.to_string(), cause_chain, source);
            }
        }

        // Unknown errors surface with full context rather than guessing.
        let mut fault = Fault::new(FaultKind::Internal, Severity::High, error.to_string())
            .context("source", source.to_string());
        fault.cause_chain = cause_chain;
        fault
    }
}

/// Walk the error chain looking for an already-classified [`Fault`].
fn find_fault<'a>(error: &'a (dyn std::error::Error + 'static)) -> Option<&'a Fault> {
    let mut cursor: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = cursor {
        if let Some(fault) = err.downcast_ref::<Fault>() {
            return Some(fault);
        }
        cursor = err.source();
    }
    None
}

/// Built-in rule table. Order is significant: first match wins.
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "spawn-failed",
            source: Some(Source::Supervisor),
            needles: &["spawn", "no such file", "permission denied"],
            kind: FaultKind::Process,
            severity: Severity::High,
            retryable: None,
            strategy: None,
        },
        Rule {
            name: "stdin-broken",
            source: Some(Source::Supervisor),
            needles: &["stdin", "broken pipe"],
            kind: FaultKind::Process,
            severity: Severity::High,
            retryable: None,
            strategy: None,
        },
        Rule {
            name: "process-dead",
            source: None,
            needles: &["process dead", "exited", "killed", "child gone"],
            kind: FaultKind::Process,
            severity: Severity::High,
            retryable: None,
            strategy: None,
        },
        Rule {
            name: "protocol-violation",
            source: Some(Source::Parser),
            needles: &["frame", "utf-8", "json", "unknown message type"],
            kind: FaultKind::Protocol,
            severity: Severity::High,
            retryable: None,
            strategy: Some(Strategy::RestartProcess),
        },
        Rule {
            name: "container-oom",
            source: None,
            needles: &["container oom", "out of memory"],
            kind: FaultKind::Resource,
            severity: Severity::Critical,
            retryable: Some(false),
            strategy: Some(Strategy::CleanupAndRecreate),
        },
        Rule {
            name: "container-gone",
            source: Some(Source::Container),
            needles: &["container gone", "no such container"],
            kind: FaultKind::Resource,
            severity: Severity::High,
            retryable: Some(false),
            strategy: Some(Strategy::CleanupAndRecreate),
        },
        Rule {
            name: "pool-exhausted",
            source: None,
            needles: &["pool exhausted"],
            kind: FaultKind::Resource,
            severity: Severity::Medium,
            retryable: Some(true),
            strategy: Some(Strategy::Retry),
        },
        Rule {
            name: "buffer-cap",
            source: None,
            needles: &["memory cap", "buffer cap"],
            kind: FaultKind::Resource,
            severity: Severity::High,
            retryable: Some(false),
            strategy: Some(Strategy::Surface),
        },
        Rule {
            name: "deadline",
            source: None,
            needles: &["deadline", "timed out", "timeout"],
            kind: FaultKind::Timeout,
            severity: Severity::Medium,
            retryable: None,
            strategy: None,
        },
        Rule {
            name: "access-denied",
            source: None,
            needles: &["denied", "unauthorized", "forbidden"],
            kind: FaultKind::Auth,
            severity: Severity::Medium,
            retryable: None,
            strategy: None,
        },
        Rule {
            name: "bad-client-input",
            source: Some(Source::Listener),
            needles: &["invalid", "malformed", "unsupported"],
            kind: FaultKind::Validation,
            severity: Severity::Low,
            retryable: None,
            strategy: None,
        },
        Rule {
            name: "network",
            source: None,
            needles: &[
                "connection refused",
                "connection reset",
                "peer closed",
                "tls",
                "unreachable",
            ],
            kind: FaultKind::Network,
            severity: Severity::Low,
            retryable: None,
            strategy: None,
        },
    ]
}

#[cfg(test)]
#[path = "classify_tests.rs"]
mod tests;
