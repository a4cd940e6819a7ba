// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded TTL cache for access decisions.
//!
//! Entries carry the policy version they were computed under; a stale
//! version is a miss, so no decision computed before a policy bump can
//! ever be served after it.

use crate::gate::Decision;
use amux_core::{Clock, PrincipalId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub principal: PrincipalId,
    pub resource_type: String,
    pub resource_id: String,
    pub action: String,
}

struct Entry {
    decision: Decision,
    computed_at: Instant,
    version: u64,
}

struct CacheState {
    map: HashMap<CacheKey, Entry>,
    /// Insertion order for capacity eviction.
    order: VecDeque<CacheKey>,
}

pub struct DecisionCache<C: Clock> {
    capacity: usize,
    ttl: Duration,
    clock: C,
    state: Mutex<CacheState>,
}

impl<C: Clock> DecisionCache<C> {
    pub fn new(capacity: usize, ttl: Duration, clock: C) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            clock,
            state: Mutex::new(CacheState { map: HashMap::new(), order: VecDeque::new() }),
        }
    }

    /// Fetch a live entry computed under `version`.
    pub fn get(&self, key: &CacheKey, version: u64) -> Option<Decision> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let entry = state.map.get(key)?;
        if entry.version != version || now.duration_since(entry.computed_at) >= self.ttl {
            state.map.remove(key);
            return None;
        }
        Some(entry.decision.clone())
    }

    pub fn insert(&self, key: CacheKey, decision: Decision, version: u64) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if !state.map.contains_key(&key) {
            state.order.push_back(key.clone());
        }
        state.map.insert(key, Entry { decision, computed_at: now, version });
        while state.map.len() > self.capacity {
            match state.order.pop_front() {
                Some(oldest) => {
                    state.map.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.map.clear();
        state.order.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
