// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed configuration surface.
//!
//! Deserialized from `amux.toml`. Every knob has a default matching the
//! documented timeout table, so an empty file is a valid configuration.
//! Durations accept `"500ms"`, `"30s"`, `"5m"`, `"1h"` strings or bare
//! integer seconds.

use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Parse a duration string like `"500ms"`, `"30s"`, `"5m"`, `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num_str, suffix) = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| (&s[..i], &s[i..]))
        .unwrap_or((s, ""));

    let num: u64 = num_str.parse().map_err(|_| format!("invalid number in duration: {}", s))?;

    let multiplier = match suffix.trim() {
        "ms" => return Ok(Duration::from_millis(num)),
        "" | "s" | "sec" | "secs" => 1,
        "m" | "min" | "mins" => 60,
        "h" | "hr" | "hrs" => 3600,
        "d" | "day" | "days" => 86400,
        other => return Err(format!("unknown duration suffix: {}", other)),
    };

    Ok(Duration::from_secs(num * multiplier))
}

/// Deserialize a duration from a humane string or bare integer seconds.
fn humane_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

/// Backpressure policy applied to a slow subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlowConsumerPolicy {
    /// Stall the parser until the slowest subscriber drains; evict it
    /// after `slow_consumer_deadline`.
    Block,
    /// Drop the oldest queued message for that subscriber and mark the
    /// gap.
    DropOldest,
    /// Disconnect the subscriber immediately.
    Close,
}

crate::simple_display! {
    SlowConsumerPolicy {
        Block => "block",
        DropOldest => "drop_oldest",
        Close => "close",
    }
}

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Linear,
    Exponential,
    /// Exponential, with the base stretched while the system is under
    /// load (running operations, open breakers).
    Adaptive,
}

crate::simple_display! {
    BackoffKind {
        Fixed => "fixed",
        Linear => "linear",
        Exponential => "exponential",
        Adaptive => "adaptive",
    }
}

/// Session pool sizing and lifetime knobs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    /// Idle sessions the scaler tries to keep warm.
    pub warm_target: usize,
    /// Minimum idle count before a fingerprint-only match may be
    /// reassigned to a new affinity key.
    pub reuse_threshold: usize,
    #[serde(deserialize_with = "humane_duration")]
    pub idle_ttl: Duration,
    #[serde(deserialize_with = "humane_duration")]
    pub absolute_ttl: Duration,
    #[serde(deserialize_with = "humane_duration")]
    pub acquire_deadline: Duration,
    /// Queued-acquire age past which waiting callers become a
    /// scale-up signal in their own right.
    #[serde(deserialize_with = "humane_duration")]
    pub acquire_wait_high: Duration,
    #[serde(deserialize_with = "humane_duration")]
    pub scale_cooldown: Duration,
    /// Idle age past which the scaler may shed surplus warm sessions.
    #[serde(deserialize_with = "humane_duration")]
    pub scale_down_idle: Duration,
    /// Scaler and janitor tick.
    #[serde(deserialize_with = "humane_duration")]
    pub sweep_interval: Duration,
    /// Aggregate replay-buffer memory across all sessions; acquisition
    /// is refused above this.
    pub global_buffer_cap_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: 16,
            warm_target: 2,
            reuse_threshold: 2,
            idle_ttl: Duration::from_secs(30 * 60),
            absolute_ttl: Duration::from_secs(4 * 3600),
            acquire_deadline: Duration::from_secs(5),
            acquire_wait_high: Duration::from_secs(1),
            scale_cooldown: Duration::from_secs(10),
            scale_down_idle: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
            global_buffer_cap_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Per-session subprocess timing and resource limits.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Deadline for the `system:ready` handshake after spawn.
    #[serde(deserialize_with = "humane_duration")]
    pub start_deadline: Duration,
    /// Total wall-clock budget for one execution.
    #[serde(deserialize_with = "humane_duration")]
    pub execution_deadline: Duration,
    /// Deadline from prompt write to the first emitted message.
    #[serde(deserialize_with = "humane_duration")]
    pub first_message_deadline: Duration,
    /// Silence length after which a liveness probe is injected.
    #[serde(deserialize_with = "humane_duration")]
    pub probe_interval: Duration,
    /// How long a probe may go unacknowledged.
    #[serde(deserialize_with = "humane_duration")]
    pub probe_deadline: Duration,
    /// RSS ceiling; two consecutive samples above it mark the session
    /// unhealthy.
    pub rss_ceiling_bytes: u64,
    /// Cooperative wait after the shutdown sentinel before SIGTERM.
    #[serde(deserialize_with = "humane_duration")]
    pub shutdown_grace: Duration,
    /// Wait after SIGTERM before SIGKILL.
    #[serde(deserialize_with = "humane_duration")]
    pub term_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start_deadline: Duration::from_secs(15),
            execution_deadline: Duration::from_secs(10 * 60),
            first_message_deadline: Duration::from_secs(30),
            probe_interval: Duration::from_secs(60),
            probe_deadline: Duration::from_secs(3),
            rss_ceiling_bytes: 2 * 1024 * 1024 * 1024,
            shutdown_grace: Duration::from_secs(2),
            term_grace: Duration::from_secs(5),
        }
    }
}

/// Framing and fan-out knobs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    pub max_frame_bytes: usize,
    pub replay_buffer_messages: usize,
    pub replay_buffer_bytes: usize,
    /// Capacity of each subscriber's private outbound queue.
    pub subscriber_queue: usize,
    pub slow_consumer_policy: SlowConsumerPolicy,
    #[serde(deserialize_with = "humane_duration")]
    pub slow_consumer_deadline: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 4 * 1024 * 1024,
            replay_buffer_messages: 256,
            replay_buffer_bytes: 1024 * 1024,
            subscriber_queue: 64,
            slow_consumer_policy: SlowConsumerPolicy::Block,
            slow_consumer_deadline: Duration::from_secs(5),
        }
    }
}

/// Circuit breaker thresholds, shared by every target.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    /// Failure-rate threshold in [0, 1].
    pub failure_rate: f32,
    /// Slow-call-rate threshold in [0, 1].
    pub slow_rate: f32,
    /// Calls required in the window before rates are judged.
    pub min_calls: usize,
    #[serde(deserialize_with = "humane_duration")]
    pub window: Duration,
    /// A call slower than this counts as slow.
    #[serde(deserialize_with = "humane_duration")]
    pub slow_call_after: Duration,
    #[serde(deserialize_with = "humane_duration")]
    pub open_duration: Duration,
    /// Cap for the doubling open duration.
    #[serde(deserialize_with = "humane_duration")]
    pub open_duration_max: Duration,
    /// Concurrent probes admitted while half-open.
    pub halfopen_quota: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.5,
            slow_rate: 0.8,
            min_calls: 10,
            window: Duration::from_secs(30),
            slow_call_after: Duration::from_secs(5),
            open_duration: Duration::from_secs(10),
            open_duration_max: Duration::from_secs(120),
            halfopen_quota: 3,
        }
    }
}

/// Retry policy applied by the adaptive retrier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(deserialize_with = "humane_duration")]
    pub base_delay: Duration,
    #[serde(deserialize_with = "humane_duration")]
    pub max_delay: Duration,
    pub backoff: BackoffKind,
    /// Apply ±25 % jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff: BackoffKind::Exponential,
            jitter: true,
        }
    }
}

/// Access-gate decision cache bounds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccessConfig {
    #[serde(deserialize_with = "humane_duration")]
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    /// Deadline for a single authorize call, cache miss included.
    #[serde(deserialize_with = "humane_duration")]
    pub decision_deadline: Duration,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            cache_capacity: 4096,
            decision_deadline: Duration::from_millis(200),
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub pool: PoolConfig,
    pub session: SessionConfig,
    pub stream: StreamConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub access: AccessConfig,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
