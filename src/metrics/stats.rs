//! In-process request accounting backing the admin `/stats` endpoint.
//! Hot-path updates are atomics and dashmap entries; snapshots serialize to
//! JSON on demand. The Prometheus recorder (`registry.rs`) mirrors the same
//! events for scrape-based monitoring.

use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Counters and timings for one upstream. Persists across config reloads —
/// identity is the upstream id, not the generation.
#[derive(Debug)]
pub struct UpstreamStats {
    requests: AtomicU64,
    errors: AtomicU64,
    rate_limit_hits: AtomicU64,
    queue_hits: AtomicU64,
    retries: AtomicU64,
    responses_by_status: DashMap<u16, u64>,
    /// Masked key id → dispatch count. Only paths matching the upstream's
    /// `rate_limit_paths` accumulate here.
    key_usage: DashMap<String, u64>,
    resp_min_us: AtomicU64,
    resp_max_us: AtomicU64,
    resp_sum_us: AtomicU64,
    resp_count: AtomicU64,
}

impl Default for UpstreamStats {
    fn default() -> Self {
        Self {
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            rate_limit_hits: AtomicU64::new(0),
            queue_hits: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            responses_by_status: DashMap::new(),
            key_usage: DashMap::new(),
            resp_min_us: AtomicU64::new(u64::MAX),
            resp_max_us: AtomicU64::new(0),
            resp_sum_us: AtomicU64::new(0),
            resp_count: AtomicU64::new(0),
        }
    }
}

impl UpstreamStats {
    pub fn record_outcome(&self, status: u16) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if status >= 400 {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        *self.responses_by_status.entry(status).or_insert(0) += 1;
    }

    pub fn record_rate_limit_hit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_hit(&self) {
        self.queue_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_key_use(&self, masked_key: &str) {
        *self.key_usage.entry(masked_key.to_string()).or_insert(0) += 1;
    }

    pub fn record_upstream_response_time(&self, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        self.resp_min_us.fetch_min(us, Ordering::Relaxed);
        self.resp_max_us.fetch_max(us, Ordering::Relaxed);
        self.resp_sum_us.fetch_add(us, Ordering::Relaxed);
        self.resp_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn key_usage_snapshot(&self) -> Vec<(String, u64)> {
        let mut usage: Vec<(String, u64)> = self
            .key_usage
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        usage.sort_by(|a, b| a.0.cmp(&b.0));
        usage
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let count = self.resp_count.load(Ordering::Relaxed);
        let (min_ms, avg_ms, max_ms) = if count == 0 {
            (None, None, None)
        } else {
            (
                Some(self.resp_min_us.load(Ordering::Relaxed) as f64 / 1_000.0),
                Some(
                    self.resp_sum_us.load(Ordering::Relaxed) as f64
                        / count as f64
                        / 1_000.0,
                ),
                Some(self.resp_max_us.load(Ordering::Relaxed) as f64 / 1_000.0),
            )
        };
        let mut by_status: Vec<(u16, u64)> = self
            .responses_by_status
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        by_status.sort_by_key(|(s, _)| *s);
        let by_status: serde_json::Map<String, serde_json::Value> = by_status
            .into_iter()
            .map(|(s, n)| (s.to_string(), json!(n)))
            .collect();

        json!({
            "requests": self.requests(),
            "errors": self.errors(),
            "rate_limit_hits": self.rate_limit_hits.load(Ordering::Relaxed),
            "queue_hits": self.queue_hits.load(Ordering::Relaxed),
            "retries": self.retries(),
            "responses_by_status": by_status,
            "response_time_ms": {
                "min": min_ms,
                "avg": avg_ms,
                "max": max_ms,
            },
            "key_usage": self
                .key_usage_snapshot()
                .into_iter()
                .collect::<std::collections::BTreeMap<String, u64>>(),
        })
    }
}

/// Process-wide stats: global totals plus the per-upstream map.
pub struct StatsRegistry {
    upstreams: DashMap<String, Arc<UpstreamStats>>,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    total_rate_limit_hits: AtomicU64,
    started_at: Instant,
    start_unix: u64,
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self {
            upstreams: DashMap::new(),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            total_rate_limit_hits: AtomicU64::new(0),
            started_at: Instant::now(),
            start_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upstream(&self, id: &str) -> Arc<UpstreamStats> {
        self.upstreams.entry(id.to_string()).or_default().clone()
    }

    /// Final accounting for one client request: global totals plus the
    /// per-upstream counters when the request resolved to an upstream.
    pub fn record_outcome(&self, upstream: Option<&UpstreamStats>, status: u16) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if status >= 400 {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(up) = upstream {
            up.record_outcome(status);
        }
    }

    pub fn record_rate_limit_hit(&self, upstream: &UpstreamStats) {
        self.total_rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        upstream.record_rate_limit_hit();
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let mut per_upstream = serde_json::Map::new();
        let mut ids: Vec<String> = self.upstreams.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        for id in ids {
            if let Some(stats) = self.upstreams.get(&id) {
                per_upstream.insert(id, stats.snapshot());
            }
        }
        json!({
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "total_errors": self.total_errors.load(Ordering::Relaxed),
            "total_rate_limit_hits": self.total_rate_limit_hits.load(Ordering::Relaxed),
            "uptime_seconds": self.uptime_seconds(),
            "start_time": self.start_unix,
            "upstreams": per_upstream,
        })
    }
}
