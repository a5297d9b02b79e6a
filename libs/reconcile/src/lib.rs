//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge desired state to current state. Key concepts:
//!
//! - **Desired state**: What the system should look like (formations).
//! - **Current state**: What the system actually looks like (host jobs).
//! - **Convergence**: The process of making current match desired.
//!
//! # Invariants
//!
//! - Diffs are deterministic given the same inputs
//! - Zero counts and absent entries are equivalent

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;

/// Convergence status for one process type of a formation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    /// Running count matches desired count.
    Converged,

    /// Running count is moving toward desired count.
    Converging,

    /// No host satisfies the placement constraints.
    Blocked,

    /// Launches halted after repeated crashes.
    Degraded,
}

impl ConvergenceStatus {
    /// Returns true if the resource has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if the resource needs an operator or a desired-state
    /// change before it can make progress.
    pub fn is_stuck(&self) -> bool {
        matches!(self, Self::Blocked | Self::Degraded)
    }
}

/// Computes `desired - running` for every type present in either map.
///
/// Types whose difference is zero are omitted, so an empty result means
/// converged.
pub fn diff_processes<K: Ord + Clone>(
    desired: &BTreeMap<K, u32>,
    running: &BTreeMap<K, u32>,
) -> BTreeMap<K, i64> {
    let mut diff = BTreeMap::new();
    for (k, want) in desired {
        let have = running.get(k).copied().unwrap_or(0);
        let d = i64::from(*want) - i64::from(have);
        if d != 0 {
            diff.insert(k.clone(), d);
        }
    }
    for (k, have) in running {
        if !desired.contains_key(k) && *have > 0 {
            diff.insert(k.clone(), -i64::from(*have));
        }
    }
    diff
}

/// True if both maps agree once zero entries are ignored.
pub fn processes_equal<K: Ord + Clone>(a: &BTreeMap<K, u32>, b: &BTreeMap<K, u32>) -> bool {
    diff_processes(a, b).is_empty()
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5 * 60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Backoff used between failed placement attempts: 5s doubling to 5min.
    pub fn scheduling() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(5 * 60),
            jitter: 0.2,
        }
    }

    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(30) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exp);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = if self.jitter > 0.0 {
            let range = delay * self.jitter;
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };
        let final_delay = (delay + jitter).clamp(0.0, self.max.as_millis() as f64);

        Duration::from_millis(final_delay as u64)
    }
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy)]
pub struct Attempts {
    pub total: u32,
    pub delay: Duration,
}

impl Attempts {
    pub const fn new(total: u32, delay: Duration) -> Self {
        Self { total, delay }
    }

    /// Runs `op` until it succeeds or the attempts are used up, returning
    /// the last error.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if attempt + 1 >= self.total.max(1) => return Err(e),
                Err(_) => {
                    attempt += 1;
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}

/// A counter whose value halves every `half_life`.
///
/// Used to spot crash loops: each crash adds one, and the value drifts back
/// toward zero while the job stays up.
#[derive(Debug, Clone)]
pub struct DecayingCounter {
    half_life: Duration,
    value: f64,
    updated: Option<Instant>,
}

impl DecayingCounter {
    pub fn new(half_life: Duration) -> Self {
        Self {
            half_life,
            value: 0.0,
            updated: None,
        }
    }

    /// Adds one event at `now` and returns the decayed total.
    pub fn record(&mut self, now: Instant) -> f64 {
        self.value = self.value_at(now) + 1.0;
        self.updated = Some(now);
        self.value
    }

    /// Current value, decayed to `now`.
    pub fn value_at(&self, now: Instant) -> f64 {
        let Some(updated) = self.updated else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(updated).as_secs_f64();
        let half_lives = elapsed / self.half_life.as_secs_f64().max(f64::EPSILON);
        self.value * 0.5_f64.powf(half_lives)
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
        self.updated = None;
    }
}

/// Half-life of the per-type crash counter.
pub const CRASH_HALF_LIFE: Duration = Duration::from_secs(10 * 60);

/// Default anti-entropy interval.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Default per-attempt scheduling timeout.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn procs(items: &[(&str, u32)]) -> BTreeMap<String, u32> {
        items.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_diff_processes() {
        let desired = procs(&[("web", 3), ("worker", 1), ("clock", 0)]);
        let running = procs(&[("web", 1), ("worker", 1), ("old", 2)]);

        let diff = diff_processes(&desired, &running);

        assert_eq!(diff.get("web"), Some(&2));
        assert_eq!(diff.get("worker"), None);
        assert_eq!(diff.get("clock"), None);
        assert_eq!(diff.get("old"), Some(&-2));
    }

    #[test]
    fn test_processes_equal_ignores_zero() {
        assert!(processes_equal(
            &procs(&[("web", 2), ("worker", 0)]),
            &procs(&[("web", 2)])
        ));
        assert!(!processes_equal(&procs(&[("web", 2)]), &procs(&[("web", 1)])));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::scheduling()
        };

        assert_eq!(policy.delay(0), Duration::from_secs(5));
        assert_eq!(policy.delay(1), Duration::from_secs(10));
        assert_eq!(policy.delay(3), Duration::from_secs(40));
        assert_eq!(policy.delay(10), Duration::from_secs(300));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_jitter_stays_bounded() {
        let policy = BackoffPolicy::scheduling();
        for attempt in 0..12 {
            let d = policy.delay(attempt);
            assert!(d <= policy.max);
            assert!(d >= Duration::from_secs(4));
        }
    }

    #[test]
    fn test_decaying_counter_half_life() {
        let start = Instant::now();
        let mut counter = DecayingCounter::new(Duration::from_secs(600));

        counter.record(start);
        counter.record(start);
        assert!((counter.value_at(start) - 2.0).abs() < 1e-9);

        let later = start + Duration::from_secs(600);
        assert!((counter.value_at(later) - 1.0).abs() < 1e-9);

        let value = counter.record(later);
        assert!((value - 2.0).abs() < 1e-9);

        counter.reset();
        assert_eq!(counter.value_at(later), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_returns_last_error() {
        let attempts = Attempts::new(3, Duration::from_millis(10));
        let mut calls = 0;
        let result: Result<(), u32> = attempts
            .run(|n| {
                calls += 1;
                async move { Err(n) }
            })
            .await;
        assert_eq!(result, Err(2));
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_stops_on_success() {
        let attempts = Attempts::new(5, Duration::from_millis(10));
        let result: Result<u32, ()> = attempts
            .run(|n| async move { if n == 1 { Ok(n) } else { Err(()) } })
            .await;
        assert_eq!(result, Ok(1));
    }

    proptest! {
        #[test]
        fn prop_diff_applied_converges(
            desired in proptest::collection::btree_map("[a-d]", 0u32..10, 0..4),
            running in proptest::collection::btree_map("[a-d]", 0u32..10, 0..4),
        ) {
            let diff = diff_processes(&desired, &running);
            let mut after = running.clone();
            for (k, d) in &diff {
                let v = after.entry(k.clone()).or_insert(0);
                *v = (i64::from(*v) + d) as u32;
            }
            prop_assert!(processes_equal(&desired, &after));
        }
    }
}
