use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the admin `/metrics`
/// endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. The first caller installs; later calls (config
    /// generations, tests) reuse the existing recorder.
    pub fn install() -> Self {
        static GLOBAL: std::sync::OnceLock<Metrics> = std::sync::OnceLock::new();
        GLOBAL.get_or_init(Self::install_inner).clone()
    }

    fn install_inner() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        // request path
        describe_counter!(
            "proxy_http_requests_total",
            Unit::Count,
            "Total client requests processed"
        );
        describe_histogram!(
            "proxy_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from the client perspective"
        );
        describe_histogram!(
            "proxy_upstream_request_duration_seconds",
            Unit::Seconds,
            "Upstream request duration (dispatch to response headers)"
        );
        describe_gauge!(
            "proxy_http_requests_in_flight",
            Unit::Count,
            "Requests currently being processed"
        );

        // rate limiting and queueing
        describe_counter!(
            "proxy_rate_limit_hits_total",
            Unit::Count,
            "Requests blocked by a rate-limit window"
        );
        describe_counter!(
            "proxy_queue_enqueued_total",
            Unit::Count,
            "Requests placed on an admission queue"
        );
        describe_counter!(
            "proxy_queue_rejected_total",
            Unit::Count,
            "Requests rejected because an admission queue was full"
        );
        describe_counter!(
            "proxy_queue_expired_total",
            Unit::Count,
            "Queued requests dropped past their deadline"
        );
        describe_gauge!(
            "proxy_queue_depth",
            Unit::Count,
            "Current admission queue depth"
        );

        // retries and keys
        describe_counter!(
            "proxy_upstream_retries_total",
            Unit::Count,
            "Upstream retry attempts"
        );
        describe_counter!(
            "proxy_key_cooldowns_total",
            Unit::Count,
            "Keys placed in failure cooldown"
        );

        // connections
        describe_gauge!(
            "proxy_connections_active",
            Unit::Count,
            "Active downstream connections"
        );
        describe_counter!(
            "proxy_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        // config
        describe_gauge!(
            "proxy_config_upstreams_total",
            Unit::Count,
            "Upstreams in the active configuration generation"
        );
        describe_counter!(
            "proxy_config_reloads_total",
            Unit::Count,
            "Config reload events"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
