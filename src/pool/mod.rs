//! Key rotator: hands out one API key per outbound gateway call.
//!
//! Implements round-robin with health awareness: keys that fail
//! repeatedly are benched for a cooldown window and skipped until it
//! elapses. If every key is benched, the one that recovers soonest is
//! handed out anyway so callers never block.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{PipeError, Result};

pub mod cooldown;

pub use cooldown::CooldownPolicy;

/// Mutable health of a single key.
#[derive(Debug, Default)]
struct KeyState {
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    total_selections: u64,
    total_failures: u64,
}

impl KeyState {
    fn is_available(&self, now: Instant) -> bool {
        self.cooldown_until.map_or(true, |until| until <= now)
    }
}

/// Everything that must change together under the lock.
struct RotatorState {
    cursor: usize,
    keys: Vec<KeyState>,
}

/// A key handed out by [`KeyRotator::select_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySelection {
    /// Position of the key in the configured pool.
    pub index: usize,
    pub key: String,
    /// Every key was cooling down; this is the one that recovers first.
    pub fallback: bool,
}

/// Point-in-time view of one key, safe to expose (key is masked).
#[derive(Debug, Clone, Serialize)]
pub struct KeySnapshot {
    pub index: usize,
    pub key: String,
    pub consecutive_failures: u32,
    pub cooling_down: bool,
    pub cooldown_remaining_secs: Option<u64>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub total_selections: u64,
    pub total_failures: u64,
}

/// Thread-safe round-robin key pool with per-key cooldown.
pub struct KeyRotator {
    /// Configured keys, fixed for the lifetime of the rotator.
    members: Vec<String>,
    positions: HashMap<String, usize>,
    policy: CooldownPolicy,
    state: Mutex<RotatorState>,
}

impl KeyRotator {
    /// Build a rotator over `keys`. Blank and duplicate entries are dropped.
    ///
    /// Fails with [`PipeError::PoolExhausted`] if no key remains.
    pub fn new<I, S>(keys: I, policy: CooldownPolicy) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut members = Vec::new();
        let mut positions = HashMap::new();
        for key in keys {
            let key = key.into().trim().to_string();
            if key.is_empty() {
                continue;
            }
            if let Some(&first) = positions.get(&key) {
                warn!(index = first, "Duplicate API key in pool, ignoring");
                continue;
            }
            positions.insert(key.clone(), members.len());
            members.push(key);
        }

        if members.is_empty() {
            return Err(PipeError::PoolExhausted);
        }

        let keys = members.iter().map(|_| KeyState::default()).collect();
        info!(keys = members.len(), "🔑 Key pool ready");

        Ok(Self {
            members,
            positions,
            policy,
            state: Mutex::new(RotatorState { cursor: 0, keys }),
        })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn keys(&self) -> &[String] {
        &self.members
    }

    pub fn policy(&self) -> &CooldownPolicy {
        &self.policy
    }

    /// Select the key for the next outbound call.
    pub fn select_key(&self) -> KeySelection {
        self.select_key_at(Instant::now())
    }

    /// [`select_key`](Self::select_key) against an explicit clock.
    pub fn select_key_at(&self, now: Instant) -> KeySelection {
        let mut state = self.lock();
        let total = state.keys.len();
        let start = state.cursor;

        let healthy = (0..total)
            .map(|offset| (start + offset) % total)
            .find(|&idx| state.keys[idx].is_available(now));

        let (index, fallback) = match healthy {
            Some(idx) => (idx, false),
            None => {
                // All benched: fail open with whichever recovers first.
                let idx = state
                    .keys
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, k)| k.cooldown_until)
                    .map(|(idx, _)| idx)
                    .unwrap_or(start);
                (idx, true)
            }
        };

        state.cursor = (index + 1) % total;
        state.keys[index].total_selections += 1;
        drop(state);

        if fallback {
            warn!(
                key_index = index,
                pool = total,
                "All keys cooling down, using the one that recovers first"
            );
        } else {
            debug!(key_index = index, pool = total, "Selected API key");
        }

        KeySelection {
            index,
            key: self.members[index].clone(),
            fallback,
        }
    }

    /// Report the outcome of a call made with `key`.
    pub fn record_result(&self, key: &str, success: bool) {
        self.record_result_at(key, success, Instant::now());
    }

    /// [`record_result`](Self::record_result) against an explicit clock.
    pub fn record_result_at(&self, key: &str, success: bool, now: Instant) {
        let Some(&index) = self.positions.get(key) else {
            debug!("Outcome reported for a key outside the pool, ignoring");
            return;
        };

        let mut state = self.lock();
        let entry = &mut state.keys[index];

        if success {
            let was_failing = entry.consecutive_failures > 0;
            entry.consecutive_failures = 0;
            entry.cooldown_until = None;
            drop(state);
            if was_failing {
                info!(key_index = index, "Key recovered");
            }
            return;
        }

        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.total_failures += 1;
        let failures = entry.consecutive_failures;
        let cooldown = self.policy.backoff(failures);
        if let Some(cooldown) = cooldown {
            entry.cooldown_until = Some(now + cooldown);
        }
        drop(state);

        match cooldown {
            Some(cooldown) => warn!(
                key_index = index,
                consecutive_failures = failures,
                cooldown_secs = cooldown.as_secs(),
                "Key benched after repeated failures"
            ),
            None => debug!(
                key_index = index,
                consecutive_failures = failures,
                "Key failure recorded"
            ),
        }
    }

    /// Number of keys not currently cooling down.
    pub fn available_count(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .keys
            .iter()
            .filter(|k| k.is_available(now))
            .count()
    }

    pub fn snapshot(&self) -> Vec<KeySnapshot> {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> Vec<KeySnapshot> {
        let wall_now = Utc::now();
        let state = self.lock();
        state
            .keys
            .iter()
            .enumerate()
            .map(|(index, k)| {
                let remaining = k
                    .cooldown_until
                    .map(|until| until.saturating_duration_since(now))
                    .filter(|d| !d.is_zero());
                KeySnapshot {
                    index,
                    key: mask_key(&self.members[index]),
                    consecutive_failures: k.consecutive_failures,
                    cooling_down: remaining.is_some(),
                    cooldown_remaining_secs: remaining.map(|d| d.as_secs()),
                    cooldown_until: remaining.and_then(|d| to_wall_clock(wall_now, d)),
                    total_selections: k.total_selections,
                    total_failures: k.total_failures,
                }
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, RotatorState> {
        // State is never left half-updated, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_wall_clock(now: DateTime<Utc>, remaining: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(remaining)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
}

/// Mask an API key for logs and status output.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}…{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;

    fn policy(threshold: u32) -> CooldownPolicy {
        CooldownPolicy {
            failure_threshold: threshold,
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(300),
        }
    }

    fn rotator(keys: &[&str], threshold: u32) -> KeyRotator {
        KeyRotator::new(keys.iter().copied(), policy(threshold)).unwrap()
    }

    #[test]
    fn test_empty_pool_rejected() {
        let result = KeyRotator::new(Vec::<String>::new(), CooldownPolicy::default());
        assert!(matches!(result, Err(PipeError::PoolExhausted)));

        let blanks = KeyRotator::new(vec!["  ", ""], CooldownPolicy::default());
        assert!(matches!(blanks, Err(PipeError::PoolExhausted)));
    }

    #[test]
    fn test_duplicates_collapsed() {
        let r = rotator(&["a", "b", "a", " b "], 3);
        assert_eq!(r.keys(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_round_robin_visits_every_key() {
        for n in 1..=7 {
            let keys: Vec<String> = (0..n).map(|i| format!("key-{i}")).collect();
            let r = KeyRotator::new(keys.clone(), policy(3)).unwrap();

            for _round in 0..3 {
                let mut seen: Vec<String> = (0..n).map(|_| r.select_key().key).collect();
                seen.sort();
                let mut expected = keys.clone();
                expected.sort();
                assert_eq!(seen, expected, "pool of {n} should be visited once per round");
            }
        }
    }

    #[test]
    fn test_benched_key_skipped_until_cooldown_elapses() {
        let r = rotator(&["k1", "k2", "k3"], 2);
        let t0 = Instant::now();

        r.record_result_at("k2", false, t0);
        r.record_result_at("k2", false, t0);

        let during = t0 + Duration::from_secs(10);
        for _ in 0..12 {
            let sel = r.select_key_at(during);
            assert_ne!(sel.key, "k2");
            assert!(!sel.fallback);
        }

        // Base backoff is 30s for the first cooldown.
        let after = t0 + Duration::from_secs(31);
        let picked: Vec<String> = (0..3).map(|_| r.select_key_at(after).key).collect();
        assert!(picked.contains(&"k2".to_string()));
    }

    #[test]
    fn test_below_threshold_still_selected() {
        let r = rotator(&["k1", "k2"], 3);
        let t0 = Instant::now();
        r.record_result_at("k1", false, t0);
        r.record_result_at("k1", false, t0);

        let picked: Vec<String> = (0..2).map(|_| r.select_key_at(t0).key).collect();
        assert!(picked.contains(&"k1".to_string()));
    }

    #[test]
    fn test_success_resets_failures_and_cooldown() {
        let r = rotator(&["k1", "k2"], 1);
        let t0 = Instant::now();
        r.record_result_at("k1", false, t0);
        assert!(r.snapshot_at(t0)[0].cooling_down);

        r.record_result_at("k1", true, t0);
        let snap = r.snapshot_at(t0);
        assert_eq!(snap[0].consecutive_failures, 0);
        assert!(!snap[0].cooling_down);
        assert_eq!(snap[0].total_failures, 1);

        let picked: Vec<String> = (0..2).map(|_| r.select_key_at(t0).key).collect();
        assert!(picked.contains(&"k1".to_string()));
    }

    #[test]
    fn test_all_cooling_returns_earliest_recovery() {
        let r = rotator(&["k1", "k2", "k3"], 1);
        let t0 = Instant::now();

        // k1 benched first, then k3 and k2 later: k1 recovers first.
        r.record_result_at("k1", false, t0);
        r.record_result_at("k3", false, t0 + Duration::from_secs(5));
        r.record_result_at("k2", false, t0 + Duration::from_secs(8));

        let sel = r.select_key_at(t0 + Duration::from_secs(10));
        assert!(sel.fallback);
        assert_eq!(sel.key, "k1");
        assert_eq!(sel.index, 0);
    }

    #[test]
    fn test_repeated_failures_grow_cooldown() {
        let r = rotator(&["k1"], 1);
        let t0 = Instant::now();

        r.record_result_at("k1", false, t0);
        assert_eq!(r.snapshot_at(t0)[0].cooldown_remaining_secs, Some(30));

        r.record_result_at("k1", false, t0);
        assert_eq!(r.snapshot_at(t0)[0].cooldown_remaining_secs, Some(60));

        for _ in 0..10 {
            r.record_result_at("k1", false, t0);
        }
        assert_eq!(r.snapshot_at(t0)[0].cooldown_remaining_secs, Some(300));
    }

    #[test]
    fn test_unknown_key_ignored() {
        let r = rotator(&["k1"], 1);
        r.record_result("not-in-pool", false);
        assert_eq!(r.snapshot()[0].consecutive_failures, 0);
        assert_eq!(r.available_count(), 1);
    }

    #[test]
    fn test_concurrent_selection_is_fair() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 300;
        let keys: Vec<String> = (0..4).map(|i| format!("key-{i}")).collect();
        let r = Arc::new(KeyRotator::new(keys.clone(), CooldownPolicy::default()).unwrap());

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let r = Arc::clone(&r);
                thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|_| r.select_key().key)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut total = 0;
        for handle in handles {
            for key in handle.join().unwrap() {
                *counts.entry(key).or_default() += 1;
                total += 1;
            }
        }

        assert_eq!(total, THREADS * PER_THREAD);
        for key in &keys {
            assert_eq!(counts[key], THREADS * PER_THREAD / keys.len());
        }
        let selections: u64 = r.snapshot().iter().map(|s| s.total_selections).sum();
        assert_eq!(selections as usize, THREADS * PER_THREAD);
    }

    #[test]
    fn test_concurrent_failures_counted_exactly() {
        let r = Arc::new(rotator(&["k1", "k2"], 1_000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let r = Arc::clone(&r);
                thread::spawn(move || {
                    for _ in 0..50 {
                        r.record_result("k1", false);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(r.snapshot()[0].consecutive_failures, 200);
        assert_eq!(r.snapshot()[0].total_failures, 200);
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("AIzaSyDHD6xhNtU0AKSC"), "AIza…SC");
        assert_eq!(mask_key("short"), "****");
    }
}
