use anyhow::Result;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::compile::CompiledConfig;
use crate::config::{CompiledUpstream, CorsConfig, ServerConfig};
use crate::limit::RateLimiter;
use crate::metrics::{HistoryRing, Metrics, StatsRegistry, UpstreamStats};
use crate::pool::PoolSet;
use crate::proxy::worker;
use crate::queue::AdmissionQueue;
use crate::routing::RouteTable;

/// Entries kept in the recent-traffic ring.
const HISTORY_CAPACITY: usize = 1_000;

/// How often each upstream prunes drained ip/user/key windows.
const LIMITER_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Live per-upstream machinery for one config generation: pools and key
/// state, rate windows, the admission queue with its drain task, the worker
/// semaphore, and the outbound HTTP client.
pub struct UpstreamRuntime {
    pub config: Arc<CompiledUpstream>,
    pub pools: PoolSet,
    pub limiter: RateLimiter,
    pub queue: AdmissionQueue,
    pub workers: Arc<Semaphore>,
    pub client: reqwest::Client,
    /// Canceled when this generation is replaced or the process shuts
    /// down. The drain task finishes the queue, then exits.
    pub generation: CancellationToken,
    pub stats: Arc<UpstreamStats>,
    pub registry: Arc<StatsRegistry>,
    pub history: Arc<HistoryRing>,
}

/// One immutable config generation as seen by the request path. Replaced
/// wholesale via `ArcSwap`; in-flight requests finish against the snapshot
/// they started with.
pub struct Snapshot {
    pub routes: RouteTable,
    pub upstreams: HashMap<String, Arc<UpstreamRuntime>>,
    /// Inbound bearer credentials; index 0 is the master. Empty disables
    /// inbound auth.
    pub auth_keys: Vec<String>,
    pub cors: CorsConfig,
}

/// Shared proxy state, cheaply cloneable. Mutations (reload, shutdown) are
/// serialized through `config_mu`; request-path reads are lock-free.
#[derive(Clone)]
pub struct AppState {
    pub snapshot: Arc<ArcSwap<Snapshot>>,
    pub stats: Arc<StatsRegistry>,
    pub history: Arc<HistoryRing>,
    pub metrics: Metrics,
    config_mu: Arc<tokio::sync::Mutex<()>>,
}

impl AppState {
    /// Build the initial generation. Must run inside the tokio runtime —
    /// drain tasks are spawned here.
    pub fn new(compiled: CompiledConfig) -> Result<Self> {
        let metrics = Metrics::install();
        let stats = Arc::new(StatsRegistry::new());
        let history = Arc::new(HistoryRing::new(HISTORY_CAPACITY));

        let snapshot = build_snapshot(&compiled, &stats, &history, None)?;
        metrics::gauge!("proxy_config_upstreams_total").set(snapshot.upstreams.len() as f64);

        Ok(Self {
            snapshot: Arc::new(ArcSwap::new(Arc::new(snapshot))),
            stats,
            history,
            metrics,
            config_mu: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Install a validated snapshot atomically. The old generation keeps
    /// serving its in-flight and queued requests, then its workers exit.
    pub async fn reload(&self, compiled: CompiledConfig) -> Result<()> {
        let _guard = self.config_mu.lock().await;
        let old = self.snapshot.load_full();
        let snapshot = build_snapshot(&compiled, &self.stats, &self.history, Some(&old))?;
        let upstream_count = snapshot.upstreams.len();
        self.snapshot.store(Arc::new(snapshot));

        for rt in old.upstreams.values() {
            rt.generation.cancel();
            rt.queue.poke();
        }

        metrics::counter!("proxy_config_reloads_total").increment(1);
        metrics::gauge!("proxy_config_upstreams_total").set(upstream_count as f64);
        info!("config: generation installed, upstreams={}", upstream_count);
        Ok(())
    }

    /// Cancel queued entries and retire every generation. Called once on
    /// graceful shutdown, before the listener drains connections.
    pub async fn shutdown(&self) {
        let _guard = self.config_mu.lock().await;
        let snapshot = self.snapshot.load_full();
        for rt in snapshot.upstreams.values() {
            let canceled = rt.queue.drain().len();
            if canceled > 0 {
                info!(
                    "server: canceled {} queued requests, upstream={}",
                    canceled, rt.config.id
                );
            }
            rt.generation.cancel();
            rt.queue.poke();
        }
    }

    /// Admin "clear" hook: cancel everything currently queued for one
    /// upstream and report how many entries died. New entries are accepted
    /// immediately afterwards.
    pub fn clear_queue(&self, upstream_id: &str) -> Option<usize> {
        let snapshot = self.snapshot.load_full();
        let rt = snapshot.upstreams.get(upstream_id)?;
        let canceled = rt.queue.drain().len();
        info!(
            "queue: cleared, upstream={}, canceled={}",
            upstream_id, canceled
        );
        Some(canceled)
    }
}

fn build_snapshot(
    compiled: &CompiledConfig,
    stats: &Arc<StatsRegistry>,
    history: &Arc<HistoryRing>,
    old: Option<&Snapshot>,
) -> Result<Snapshot> {
    let mut upstreams = HashMap::with_capacity(compiled.upstreams.len());
    for cfg in &compiled.upstreams {
        let pools = PoolSet::new(
            &cfg.variables,
            &cfg.variable_weights,
            cfg.strategy,
            &cfg.key_variable,
            cfg.key_concurrency,
        );
        // Key state survives a reload for values both generations list.
        if let Some(old_rt) = old.and_then(|s| s.upstreams.get(&cfg.id)) {
            pools.adopt_states(&old_rt.pools);
        }

        let rt = Arc::new(UpstreamRuntime {
            pools,
            limiter: RateLimiter::new(cfg.rate.clone()),
            queue: AdmissionQueue::new(cfg.queue.max_size),
            workers: Arc::new(Semaphore::new(cfg.queue.max_workers)),
            client: build_client(&compiled.server, cfg)?,
            generation: CancellationToken::new(),
            stats: stats.upstream(&cfg.id),
            registry: stats.clone(),
            history: history.clone(),
            config: cfg.clone(),
        });

        tokio::spawn(worker::run(rt.clone()));
        spawn_limiter_pruner(&rt);

        upstreams.insert(cfg.id.clone(), rt);
    }

    Ok(Snapshot {
        routes: RouteTable::build(&compiled.upstreams),
        upstreams,
        auth_keys: compiled.server.proxy_auth_keys.clone(),
        cors: compiled.server.cors.clone(),
    })
}

fn spawn_limiter_pruner(rt: &Arc<UpstreamRuntime>) {
    let rt = rt.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LIMITER_PRUNE_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => rt.limiter.prune_idle(),
                _ = rt.generation.cancelled() => return,
            }
        }
    });
}

/// Per-upstream outbound client: connect timeout below the overall request
/// timeout, redirects forwarded verbatim, optional outbound HTTP/SOCKS5
/// proxy, and no transparent response decompression.
fn build_client(server: &ServerConfig, cfg: &CompiledUpstream) -> Result<reqwest::Client> {
    let connect_timeout = cfg.request_timeout.min(Duration::from_secs(10));
    let mut builder = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .redirect(reqwest::redirect::Policy::none());
    if let Some(proxy_uri) = &server.outbound_proxy {
        let proxy = reqwest::Proxy::all(proxy_uri.as_str())
            .map_err(|e| anyhow::anyhow!("invalid outbound_proxy '{}': {}", proxy_uri, e))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| anyhow::anyhow!("cannot build upstream client: {}", e))
}
