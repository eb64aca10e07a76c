//! Variable pools and credential (key) state.
//!
//! Each upstream owns one `PoolSet`: a pool per configured variable plus the
//! per-key runtime state backing `least_requests` / `fastest_response`
//! selection, concurrency gating, and failure cooldowns. Counters are
//! atomics shared via `Arc`; selection never takes a lock.

pub mod strategy;

use dashmap::DashMap;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::config::types::VarValue;
use crate::limit::RateLimiter;
use strategy::Strategy;

/// Monotonic nanoseconds since process start.
pub fn now_ns() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

const EWMA_ALPHA: f64 = 0.3;

/// Runtime state for one distinct credential value of one upstream.
///
/// Created on first reference; carried across config reloads for values
/// that survive, dropped for values the new generation no longer lists.
#[derive(Debug, Default)]
pub struct KeyState {
    in_flight: AtomicU32,
    last_used_ns: AtomicU64,
    /// Exponentially smoothed response time in micros; 0 = unmeasured.
    ewma_us: AtomicU64,
    requests: AtomicU64,
    last_failure_ns: AtomicU64,
    cooldown_until_ns: AtomicU64,
}

impl KeyState {
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn last_used_ns(&self) -> u64 {
        self.last_used_ns.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_used_ns.store(now_ns(), Ordering::Relaxed);
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold one observed response time into the smoothed estimate.
    /// A lost update under a concurrent store is tolerable; the estimate
    /// converges either way.
    pub fn record_response_time(&self, elapsed: Duration) {
        let sample = elapsed.as_micros() as f64;
        let old = self.ewma_us.load(Ordering::Relaxed);
        let next = if old == 0 {
            sample
        } else {
            old as f64 * (1.0 - EWMA_ALPHA) + sample * EWMA_ALPHA
        };
        self.ewma_us.store(next.max(1.0) as u64, Ordering::Relaxed);
    }

    pub fn smoothed_response_time(&self) -> Option<Duration> {
        match self.ewma_us.load(Ordering::Relaxed) {
            0 => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    pub fn start_cooldown(&self, period: Duration) {
        let now = now_ns();
        self.last_failure_ns.store(now, Ordering::Relaxed);
        self.cooldown_until_ns
            .store(now + period.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let until = self.cooldown_until_ns.load(Ordering::Relaxed);
        let now = now_ns();
        if until > now {
            Some(Duration::from_nanos(until - now))
        } else {
            None
        }
    }

    pub fn last_failure_ns(&self) -> u64 {
        self.last_failure_ns.load(Ordering::Relaxed)
    }
}

/// Holds one selected key for the lifetime of a dispatch (including the
/// response body stream). Dropping the lease releases the key's in-flight
/// slot, which is what `key_concurrency = false` serializes on.
pub struct KeyLease {
    pub value: String,
    pub state: Arc<KeyState>,
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

pub enum KeySelection {
    Selected(KeyLease),
    /// No key is currently eligible. `retry_at` is the earliest instant any
    /// candidate could become eligible again (`None` when unknown, e.g. all
    /// candidates are busy non-concurrent keys).
    Deferred { retry_at: Option<Instant> },
}

/// Ordered values for one named variable, with the per-strategy cursor.
pub struct VariablePool {
    name: String,
    values: Vec<VarValue>,
    rendered: Vec<String>,
    weights: Option<Vec<u32>>,
    cursor: AtomicU64,
}

/// Selection input for one eligible pool entry.
struct Candidate {
    index: usize,
    in_flight: u32,
    last_used_ns: u64,
    ewma_us: Option<u64>,
}

impl VariablePool {
    pub fn new(name: String, values: Vec<VarValue>, weights: Option<Vec<u32>>) -> Self {
        let rendered = values.iter().map(VarValue::render).collect();
        Self {
            name,
            values,
            rendered,
            weights,
            cursor: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn rendered(&self, index: usize) -> &str {
        &self.rendered[index]
    }

    pub fn rendered_values(&self) -> &[String] {
        &self.rendered
    }

    fn pick(&self, strategy: Strategy, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        match strategy {
            Strategy::RoundRobin => self.pick_round_robin(candidates),
            Strategy::Random => {
                let i = rand::thread_rng().gen_range(0..candidates.len());
                Some(candidates[i].index)
            }
            Strategy::LeastRequests => Some(Self::pick_least_requests(candidates)),
            Strategy::FastestResponse => Some(self.pick_fastest(candidates)),
            Strategy::Weighted => match &self.weights {
                Some(weights) => self.pick_weighted(candidates, weights),
                // Without a weights vector the strategy degrades to
                // round_robin.
                None => self.pick_round_robin(candidates),
            },
        }
    }

    fn pick_round_robin(&self, candidates: &[Candidate]) -> Option<usize> {
        let n = self.values.len();
        let base = (self.cursor.fetch_add(1, Ordering::Relaxed) as usize) % n;
        (0..n)
            .map(|off| (base + off) % n)
            .find(|i| candidates.iter().any(|c| c.index == *i))
    }

    fn pick_least_requests(candidates: &[Candidate]) -> usize {
        candidates
            .iter()
            .min_by_key(|c| (c.in_flight, c.last_used_ns))
            .map(|c| c.index)
            .unwrap()
    }

    fn pick_fastest(&self, candidates: &[Candidate]) -> usize {
        let unmeasured: Vec<&Candidate> =
            candidates.iter().filter(|c| c.ewma_us.is_none()).collect();
        if !unmeasured.is_empty() {
            // Unknown entries fall back to least_requests so new keys get
            // measured instead of starving.
            return unmeasured
                .iter()
                .min_by_key(|c| (c.in_flight, c.last_used_ns))
                .map(|c| c.index)
                .unwrap();
        }
        candidates
            .iter()
            .min_by_key(|c| c.ewma_us.unwrap_or(u64::MAX))
            .map(|c| c.index)
            .unwrap()
    }

    fn pick_weighted(&self, candidates: &[Candidate], weights: &[u32]) -> Option<usize> {
        let total: u64 = candidates
            .iter()
            .map(|c| weights.get(c.index).copied().unwrap_or(1).max(1) as u64)
            .sum();
        if total == 0 {
            return None;
        }
        let mut target = rand::thread_rng().gen_range(0..total);
        for c in candidates {
            let w = weights.get(c.index).copied().unwrap_or(1).max(1) as u64;
            if target < w {
                return Some(c.index);
            }
            target -= w;
        }
        Some(candidates[candidates.len() - 1].index)
    }
}

/// All pools of one upstream plus the shared key state.
pub struct PoolSet {
    pools: HashMap<String, VariablePool>,
    strategy: Strategy,
    key_variable: String,
    key_concurrency: bool,
    key_states: DashMap<String, Arc<KeyState>>,
}

impl PoolSet {
    pub fn new(
        variables: &std::collections::BTreeMap<String, Vec<VarValue>>,
        weights: &std::collections::BTreeMap<String, Vec<u32>>,
        strategy: Strategy,
        key_variable: &str,
        key_concurrency: bool,
    ) -> Self {
        let pools = variables
            .iter()
            .map(|(name, values)| {
                (
                    name.clone(),
                    VariablePool::new(name.clone(), values.clone(), weights.get(name).cloned()),
                )
            })
            .collect();
        Self {
            pools,
            strategy,
            key_variable: key_variable.to_string(),
            key_concurrency,
            key_states: DashMap::new(),
        }
    }

    pub fn key_variable(&self) -> &str {
        &self.key_variable
    }

    /// Carry key state over from the previous generation for values that
    /// survive the reload; values no longer listed are dropped with the old
    /// generation.
    pub fn adopt_states(&self, old: &PoolSet) {
        if let Some(pool) = self.pools.get(&self.key_variable) {
            for value in pool.rendered_values() {
                if let Some(state) = old.key_states.get(value) {
                    self.key_states.insert(value.clone(), state.clone());
                }
            }
        }
    }

    pub fn key_state(&self, value: &str) -> Arc<KeyState> {
        self.key_states
            .entry(value.to_string())
            .or_default()
            .clone()
    }

    /// (rendered value, state) pairs for the key pool, in pool order.
    pub fn key_states_snapshot(&self) -> Vec<(String, Arc<KeyState>)> {
        match self.pools.get(&self.key_variable) {
            Some(pool) => pool
                .rendered_values()
                .iter()
                .map(|v| (v.clone(), self.key_state(v)))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Bind one value for each non-key variable in `names`. Strategies that
    /// depend on per-key state degrade to round_robin here; non-key pools
    /// carry no eligibility predicate.
    pub fn bind_plain(&self, names: &[String]) -> HashMap<String, String> {
        let effective = match self.strategy {
            Strategy::LeastRequests | Strategy::FastestResponse => Strategy::RoundRobin,
            other => other,
        };
        let mut bindings = HashMap::with_capacity(names.len());
        for name in names {
            if name == &self.key_variable {
                continue;
            }
            if let Some(pool) = self.pools.get(name) {
                let candidates: Vec<Candidate> = (0..pool.len())
                    .map(|index| Candidate {
                        index,
                        in_flight: 0,
                        last_used_ns: 0,
                        ewma_us: None,
                    })
                    .collect();
                if let Some(idx) = pool.pick(effective, &candidates) {
                    bindings.insert(name.clone(), pool.rendered(idx).to_string());
                }
            }
        }
        bindings
    }

    /// Select one eligible key and commit its in-flight slot and key-scope
    /// window sample. `exclude` drops one value from consideration (used by
    /// key rotation to force a different key).
    pub fn select_key(&self, limiter: &RateLimiter, exclude: Option<&str>) -> KeySelection {
        let pool = match self.pools.get(&self.key_variable) {
            Some(p) if !p.is_empty() => p,
            // Unreachable after validation; deferred keeps the proxy stable.
            _ => return KeySelection::Deferred { retry_at: None },
        };

        let now = Instant::now();
        let mut earliest: Option<Instant> = None;
        let mut note = |at: Option<Instant>| {
            if let Some(at) = at {
                earliest = Some(match earliest {
                    Some(cur) if cur <= at => cur,
                    _ => at,
                });
            }
        };

        let mut eligible: Vec<Candidate> = Vec::with_capacity(pool.len());
        for index in 0..pool.len() {
            let value = pool.rendered(index);
            if exclude == Some(value) {
                continue;
            }
            let state = self.key_state(value);
            if let Some(rem) = state.cooldown_remaining() {
                note(Some(now + rem));
                continue;
            }
            if !self.key_concurrency && state.in_flight() > 0 {
                // Becomes eligible whenever the in-flight request finishes;
                // no instant to predict.
                continue;
            }
            if let Some(w) = limiter.key_window(value) {
                if !w.would_admit() {
                    note(w.earliest_admit());
                    continue;
                }
            }
            eligible.push(Candidate {
                index,
                in_flight: state.in_flight(),
                last_used_ns: state.last_used_ns(),
                ewma_us: state.smoothed_response_time().map(|d| d.as_micros() as u64),
            });
        }

        while !eligible.is_empty() {
            let chosen = match pool.pick(self.strategy, &eligible) {
                Some(idx) => idx,
                None => break,
            };
            let value = pool.rendered(chosen).to_string();
            let state = self.key_state(&value);

            let acquired = if self.key_concurrency {
                state.in_flight.fetch_add(1, Ordering::AcqRel);
                true
            } else {
                state
                    .in_flight
                    .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            };
            if !acquired {
                eligible.retain(|c| c.index != chosen);
                continue;
            }

            if let Some(w) = limiter.key_window(&value) {
                if !w.try_acquire() {
                    state.in_flight.fetch_sub(1, Ordering::AcqRel);
                    note(w.earliest_admit());
                    eligible.retain(|c| c.index != chosen);
                    continue;
                }
            }

            state.touch();
            return KeySelection::Selected(KeyLease { value, state });
        }

        KeySelection::Deferred {
            retry_at: earliest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::compile::{RatePathMatcher, RateTuning};
    use std::collections::BTreeMap;

    fn pool_set(values: &[&str], strategy: Strategy, key_concurrency: bool) -> PoolSet {
        let mut variables = BTreeMap::new();
        variables.insert(
            "key".to_string(),
            values
                .iter()
                .map(|v| VarValue::Str(v.to_string()))
                .collect(),
        );
        PoolSet::new(&variables, &BTreeMap::new(), strategy, "key", key_concurrency)
    }

    fn unlimited() -> RateLimiter {
        RateLimiter::new(RateTuning {
            endpoint: None,
            ip: None,
            user: None,
            key: None,
            paths: RatePathMatcher::match_all(),
        })
    }

    fn key_limited(quota: &str) -> RateLimiter {
        RateLimiter::new(RateTuning {
            endpoint: None,
            ip: None,
            user: None,
            key: quota.parse::<crate::config::quota::RateQuota>().unwrap().enabled(),
            paths: RatePathMatcher::match_all(),
        })
    }

    fn select_value(set: &PoolSet, limiter: &RateLimiter) -> String {
        match set.select_key(limiter, None) {
            KeySelection::Selected(lease) => lease.value.clone(),
            KeySelection::Deferred { .. } => panic!("expected a key"),
        }
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let set = pool_set(&["A", "B", "C"], Strategy::RoundRobin, true);
        let limiter = unlimited();
        let seq: Vec<String> = (0..6).map(|_| select_value(&set, &limiter)).collect();
        assert_eq!(seq, ["A", "B", "C", "A", "B", "C"]);
    }

    #[test]
    fn round_robin_skips_cooled_down_keys() {
        let set = pool_set(&["A", "B"], Strategy::RoundRobin, true);
        let limiter = unlimited();
        set.key_state("A").start_cooldown(Duration::from_secs(60));
        for _ in 0..3 {
            assert_eq!(select_value(&set, &limiter), "B");
        }
    }

    #[test]
    fn non_concurrent_key_is_never_double_bound() {
        let set = pool_set(&["A"], Strategy::RoundRobin, false);
        let limiter = unlimited();
        let lease = match set.select_key(&limiter, None) {
            KeySelection::Selected(l) => l,
            _ => panic!("expected a key"),
        };
        assert!(matches!(
            set.select_key(&limiter, None),
            KeySelection::Deferred { retry_at: None }
        ));
        drop(lease);
        assert_eq!(select_value(&set, &limiter), "A");
    }

    #[test]
    fn key_window_exhaustion_defers_with_retry_at() {
        let set = pool_set(&["A"], Strategy::RoundRobin, true);
        let limiter = key_limited("1/h");
        let _lease = select_value(&set, &limiter);
        match set.select_key(&limiter, None) {
            KeySelection::Deferred { retry_at } => assert!(retry_at.is_some()),
            _ => panic!("expected deferral"),
        }
    }

    #[test]
    fn exclude_forces_a_different_key() {
        let set = pool_set(&["A", "B"], Strategy::RoundRobin, true);
        let limiter = unlimited();
        for _ in 0..4 {
            match set.select_key(&limiter, Some("A")) {
                KeySelection::Selected(l) => assert_eq!(l.value, "B"),
                _ => panic!("expected B"),
            }
        }
    }

    #[test]
    fn least_requests_prefers_idle_key() {
        let set = pool_set(&["A", "B"], Strategy::LeastRequests, true);
        let limiter = unlimited();
        let busy = set.key_state("A");
        busy.in_flight.fetch_add(5, Ordering::Relaxed);
        for _ in 0..3 {
            assert_eq!(select_value(&set, &limiter), "B");
        }
    }

    #[test]
    fn fastest_response_prefers_measured_minimum() {
        let set = pool_set(&["A", "B"], Strategy::FastestResponse, true);
        let limiter = unlimited();
        set.key_state("A")
            .record_response_time(Duration::from_millis(500));
        set.key_state("B")
            .record_response_time(Duration::from_millis(20));
        assert_eq!(select_value(&set, &limiter), "B");
    }

    #[test]
    fn fastest_response_explores_unmeasured_first() {
        let set = pool_set(&["A", "B"], Strategy::FastestResponse, true);
        let limiter = unlimited();
        set.key_state("A")
            .record_response_time(Duration::from_millis(5));
        // B has no measurement yet, so it is tried before committing to A.
        assert_eq!(select_value(&set, &limiter), "B");
    }

    #[test]
    fn weighted_respects_weight_vector() {
        let mut variables = BTreeMap::new();
        variables.insert(
            "key".to_string(),
            vec![VarValue::Str("A".into()), VarValue::Str("B".into())],
        );
        let mut weights = BTreeMap::new();
        weights.insert("key".to_string(), vec![0, 10]);
        let set = PoolSet::new(&variables, &weights, Strategy::Weighted, "key", true);
        let limiter = unlimited();
        // Weight 0 is clamped to 1, so A stays rare but possible; B dominates.
        let mut b = 0;
        for _ in 0..200 {
            if select_value(&set, &limiter) == "B" {
                b += 1;
            }
        }
        assert!(b > 150, "expected B to dominate, got {}", b);
    }

    #[test]
    fn ewma_converges_toward_samples() {
        let state = KeyState::default();
        assert!(state.smoothed_response_time().is_none());
        for _ in 0..20 {
            state.record_response_time(Duration::from_millis(100));
        }
        let est = state.smoothed_response_time().unwrap();
        assert!(est > Duration::from_millis(90) && est < Duration::from_millis(110));
    }

    #[test]
    fn adopt_states_carries_surviving_values() {
        let old = pool_set(&["A", "B"], Strategy::RoundRobin, true);
        old.key_state("A")
            .record_response_time(Duration::from_millis(42));
        let new = pool_set(&["A", "C"], Strategy::RoundRobin, true);
        new.adopt_states(&old);
        assert!(new.key_state("A").smoothed_response_time().is_some());
        assert!(new.key_state("C").smoothed_response_time().is_none());
        assert!(!new.key_states.contains_key("B"));
    }

    #[test]
    fn bind_plain_covers_non_key_variables() {
        let mut variables = BTreeMap::new();
        variables.insert("key".to_string(), vec![VarValue::Str("K".into())]);
        variables.insert(
            "region".to_string(),
            vec![VarValue::Str("us".into()), VarValue::Str("eu".into())],
        );
        variables.insert(
            "version".to_string(),
            vec![VarValue::Num(serde_json::Number::from(2))],
        );
        let set = PoolSet::new(
            &variables,
            &BTreeMap::new(),
            Strategy::RoundRobin,
            "key",
            true,
        );
        let bound = set.bind_plain(&[
            "key".to_string(),
            "region".to_string(),
            "version".to_string(),
        ]);
        // The key variable is bound separately, through select_key.
        assert!(!bound.contains_key("key"));
        assert!(["us", "eu"].contains(&bound["region"].as_str()));
        assert_eq!(bound["version"], "2");
    }
}
