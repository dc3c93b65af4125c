//! Reconciliation loop primitives.
//!
//! This library provides the scheduling pieces for a polling controller
//! loop that converges one resource per key at a time:
//!
//! - **Outcome**: what a successful reconcile asks for next (requeue or
//!   drop the key).
//! - **Backoff**: per-key exponential delay for failed reconciles.
//! - **Schedule**: key → due-time map drained by the loop tick.
//!
//! # Invariants
//!
//! - A key is due at most once per drain; re-running requires an explicit
//!   reschedule.
//! - Backoff delays are monotonic per consecutive failure and capped.
//! - Draining order is deterministic (due time, then key).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Outcome of a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// When to reconcile the key again; `None` drops the key from the
    /// schedule until the resource reappears.
    pub requeue_after: Option<Duration>,
}

impl Outcome {
    /// Finished; do not requeue.
    pub fn done() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Requeue after the given delay.
    pub fn requeue_after(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    pub fn requeues(&self) -> bool {
        self.requeue_after.is_some()
    }
}

/// Per-key exponential backoff.
///
/// Each consecutive failure doubles the delay from `base` up to `cap`;
/// a success resets the key.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    failures: BTreeMap<String, u32>,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for `key` and return the delay before the next
    /// attempt.
    pub fn next_delay(&mut self, key: &str) -> Duration {
        let failures = self.failures.entry(key.to_string()).or_insert(0);
        let exponent = (*failures).min(31);
        *failures += 1;

        let delay = self.base.saturating_mul(2u32.saturating_pow(exponent));
        delay.min(self.cap)
    }

    /// Clear the failure count for `key`.
    pub fn reset(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Consecutive failures recorded for `key`.
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

/// Key → due-time map for the controller loop.
#[derive(Debug, Default)]
pub struct Schedule {
    due: BTreeMap<String, Instant>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule or reschedule `key` at `at`.
    pub fn set(&mut self, key: &str, at: Instant) {
        self.due.insert(key.to_string(), at);
    }

    /// Drop `key` from the schedule.
    pub fn remove(&mut self, key: &str) {
        self.due.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.due.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }

    /// Earliest due time over all keys.
    pub fn next_due(&self) -> Option<Instant> {
        self.due.values().min().copied()
    }

    /// Remove and return every key due at `now`, ordered by due time and
    /// then key.
    pub fn drain_due(&mut self, now: Instant) -> Vec<String> {
        let mut due: Vec<(Instant, String)> = self
            .due
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, at)| (*at, key.clone()))
            .collect();
        due.sort();

        let keys: Vec<String> = due.into_iter().map(|(_, key)| key).collect();
        for key in &keys {
            self.due.remove(key);
        }
        keys
    }
}
