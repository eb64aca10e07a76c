use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use std::sync::Arc;
use std::time::Instant;

use crate::error::ProxyError;
use crate::metrics::UpstreamStats;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
/// Unsync because the upstream response stream is only `Send`; hyper's
/// server side never needs `Sync` bodies.
pub type BoxBody = http_body_util::combinators::UnsyncBoxBody<Bytes, BoxError>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// JSON error response for a pipeline fault, shaped
/// `{"error": "<kind>", "message": "<detail>"}`.
pub fn error_response(err: &ProxyError) -> hyper::Response<BoxBody> {
    let body = format!(r#"{{"error":"{}","message":"{}"}}"#, err.kind(), err);
    hyper::Response::builder()
        .status(err.status())
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap_or_else(|_| hyper::Response::new(empty_body()))
}

/// Per-request context that flows through the pipeline phases and
/// accumulates the labels used for final accounting.
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub upstream_id: String,
    pub client_ip: String,
    pub user: Option<String>,
    pub start: Instant,
    /// Per-upstream stats handle, set once the route resolves.
    pub stats: Option<Arc<UpstreamStats>>,
}

impl RequestContext {
    pub fn new(method: String, path: String) -> Self {
        Self {
            method,
            path,
            upstream_id: String::new(),
            client_ip: String::new(),
            user: None,
            start: Instant::now(),
            stats: None,
        }
    }

    /// Final per-request accounting: Prometheus counters and the request
    /// duration histogram. Called exactly once per request.
    pub fn finalize_metrics(&self, status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status);

        metrics::counter!(
            "proxy_http_requests_total",
            "upstream" => self.upstream_id.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "proxy_http_request_duration_seconds",
            "upstream" => self.upstream_id.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
