//! Reconciliation primitives shared by the virtual node agent.
//!
//! The agent converges an external execution backend toward the desired pod
//! specs delivered by the control plane. The helpers here carry no async
//! runtime so they can be unit tested in isolation:
//!
//! - **Spec hashing**: detect whether a desired spec differs from the one
//!   last applied, independent of key order in the source document.
//! - **Backoff**: exponential retry delays with jitter, capped by a ceiling.
//! - **Retry tracking**: count consecutive failures per resource and report
//!   when the configured retry ceiling has been crossed.
//!
//! # Invariants
//!
//! - Hashing is deterministic for semantically equal JSON documents
//! - Backoff delays never exceed `max * (1 + jitter)`
//! - A tracker reports exhaustion only after `max_retries + 1` failures

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Default base delay for the first retry.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Default backoff ceiling.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 4;

/// Default window over which failures are counted.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60);

// =============================================================================
// Spec Hash
// =============================================================================

/// Content hash of a desired spec.
///
/// Two specs hash equally when their canonical JSON forms match, so a
/// redelivered event carrying the same spec is recognised as a no-op.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Hash any serializable spec.
    ///
    /// Values that cannot be represented as JSON hash as `null`.
    pub fn of<T: Serialize>(spec: &T) -> Self {
        match serde_json::to_value(spec) {
            Ok(value) => Self::from_json(&value),
            Err(_) => Self::from_json(&serde_json::Value::Null),
        }
    }

    /// Hash a JSON document in canonical form.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let mut canonical = String::new();
        write_canonical(json, &mut canonical);
        let digest = Sha256::digest(canonical.as_bytes());
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sorted keys, no whitespace.
fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        serde_json::Value::String(s) => write_string(s, out),
        serde_json::Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        serde_json::Value::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        serde_json::Value::Null => out.push_str("null"),
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Ceiling for a single delay (before jitter).
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter, mostly useful in tests.
    pub fn fixed(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Delay to wait before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2.0_f64.powi(attempt.min(31) as i32);
        let delay = (self.base.as_millis() as f64 * exp).min(self.max.as_millis() as f64);

        let jitter = if self.jitter > 0.0 {
            let spread = delay * self.jitter.clamp(0.0, 1.0);
            rand::rng().random_range(-spread..=spread)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

// =============================================================================
// Retry Tracker
// =============================================================================

/// Counts failures per resource against a retry ceiling.
#[derive(Debug, Clone)]
pub struct RetryTracker<K: Ord + Clone> {
    /// Retries allowed after the first failed attempt.
    max_retries: u32,

    /// Failures older than this restart the count.
    window: Duration,

    /// key -> (failures, first failure)
    failures: BTreeMap<K, (u32, Instant)>,
}

impl<K: Ord + Clone> RetryTracker<K> {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failed attempt. Returns true once retries are exhausted.
    pub fn record_failure(&mut self, key: &K) -> bool {
        let now = Instant::now();
        let (count, first) = self.failures.entry(key.clone()).or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Failures recorded for `key` inside the current window.
    pub fn failures(&self, key: &K) -> u32 {
        match self.failures.get(key) {
            Some((count, first)) if first.elapsed() <= self.window => *count,
            _ => 0,
        }
    }

    /// Forget failures for `key` (on success or removal).
    pub fn clear(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Drop entries whose window has elapsed. Returns how many went.
    pub fn prune(&mut self) -> usize {
        let window = self.window;
        let before = self.failures.len();
        self.failures
            .retain(|_, (_, first)| first.elapsed() <= window);
        before - self.failures.len()
    }
}
