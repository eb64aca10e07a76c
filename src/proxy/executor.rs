//! Upstream executor: builds the outbound request, streams bodies both
//! ways, and runs the retry / key-rotation loop around upstream failure.
//!
//! All attempts of one dispatch share a single wall-clock budget
//! (`request_timeout_seconds`), covering dispatch to last response byte.
//! The worker-slot permit and the key lease ride inside the response body
//! so they release only when the client has consumed the stream.

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::CONTENT_ENCODING;
use http::StatusCode;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::Response;
use rand::Rng;
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::compile::RetryMode;
use crate::error::ProxyError;
use crate::metrics::{mask_key, HistoryEntry};
use crate::pool::{KeyLease, KeySelection};
use crate::proxy::context::{BoxBody, BoxError};
use crate::queue::{BodySource, CapturedRequest};
use crate::server::state::UpstreamRuntime;

/// Poll interval while waiting for a key whose next-eligible instant is
/// unknown (busy non-concurrent keys).
const DEFER_POLL: Duration = Duration::from_millis(50);

/// Execute one admitted request against the upstream. `lease` is the key
/// selected at admission; rotation may swap it mid-flight.
pub async fn dispatch(
    rt: &UpstreamRuntime,
    request: CapturedRequest,
    body: BodySource,
    lease: KeyLease,
    cancel: &CancellationToken,
    permit: OwnedSemaphorePermit,
) -> Result<Response<BoxBody>, ProxyError> {
    let cfg = &rt.config;
    let mut lease = lease;
    let mut request = request;

    let mut bindings = rt.pools.bind_plain(&cfg.referenced_variables);
    bindings.insert(cfg.key_variable.clone(), lease.value.clone());

    let count_key_usage = rt.limiter.path_is_limited(&request.suffix);
    let body = prepare_body(cfg, &mut request, body).await?;

    // Pre-send jitter: uniform in [0, randomness] seconds.
    if cfg.randomness > 0.0 {
        let jitter = Duration::from_secs_f64(
            rand::thread_rng().gen_range(0.0..=cfg.randomness),
        );
        tokio::select! {
            _ = tokio::time::sleep(jitter) => {}
            _ = cancel.cancelled() => return Err(ProxyError::Canceled),
        }
    }

    let url = match &request.query {
        Some(q) => format!("{}{}?{}", cfg.base_url, request.suffix, q),
        None => format!("{}{}", cfg.base_url, request.suffix),
    };

    let deadline = Instant::now() + cfg.request_timeout;
    let replayable = body.is_replayable();
    let mut body = Some(body);
    let mut attempt: u32 = 0;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProxyError::UpstreamTimeout);
        }

        let mut headers = request.headers.clone();
        for template in &cfg.header_templates {
            let value = template
                .render(&bindings)
                .map_err(ProxyError::Configuration)?;
            headers.insert(template.name.clone(), value);
        }

        let mut builder = rt
            .client
            .request(request.method.clone(), &url)
            .headers(headers)
            .timeout(remaining);
        builder = match body.take() {
            None | Some(BodySource::Empty) => {
                body = Some(BodySource::Empty);
                builder
            }
            Some(BodySource::Buffered(bytes)) => {
                let b = builder.body(bytes.clone());
                body = Some(BodySource::Buffered(bytes));
                b
            }
            // One-shot: the stream handle is consumed by this attempt.
            Some(BodySource::Streaming(incoming)) => builder.body(reqwest::Body::wrap_stream(
                http_body_util::BodyDataStream::new(incoming),
            )),
        };

        let masked = mask_key(&lease.value);
        rt.history.push(HistoryEntry::request(&cfg.id, &masked));
        if count_key_usage {
            rt.stats.record_key_use(&masked);
        }

        let started = Instant::now();
        let result = tokio::select! {
            r = builder.send() => r,
            _ = cancel.cancelled() => return Err(ProxyError::Canceled),
        };

        match result {
            Ok(resp) => {
                let elapsed = started.elapsed();
                lease.state.record_response_time(elapsed);
                rt.stats.record_upstream_response_time(elapsed);
                metrics::histogram!(
                    "proxy_upstream_request_duration_seconds",
                    "upstream" => cfg.id.clone(),
                )
                .record(elapsed.as_secs_f64());

                let status = resp.status().as_u16();
                rt.history.push(HistoryEntry::response(
                    &cfg.id,
                    &masked,
                    status,
                    elapsed.as_millis() as u64,
                ));

                let can_retry = attempt < cfg.retry.attempts
                    && replayable
                    && cfg.retry.status_retryable(&request.method, status);
                if can_retry {
                    debug!(
                        "executor: retryable status {}, upstream={}, attempt={}/{}",
                        status,
                        cfg.id,
                        attempt + 1,
                        cfg.retry.attempts
                    );
                    lease = handle_retry(rt, lease, attempt, deadline, cancel).await?;
                    bindings.insert(cfg.key_variable.clone(), lease.value.clone());
                    attempt += 1;
                    continue;
                }

                return Ok(build_response(resp, lease, permit));
            }
            Err(e) if e.is_timeout() => {
                // The per-attempt timeout equals the remaining budget, so a
                // timeout here means the overall deadline is spent.
                warn!("executor: upstream timeout, upstream={}, url={}", cfg.id, url);
                return Err(ProxyError::UpstreamTimeout);
            }
            Err(e) => {
                // Connection / TLS / read failure with no status: retryable
                // unconditionally by method, as long as the body can be
                // replayed.
                let can_retry = attempt < cfg.retry.attempts
                    && replayable
                    && cfg.retry.method_retryable(&request.method);
                if can_retry {
                    debug!(
                        "executor: network error (retrying), upstream={}, attempt={}/{}, error={}",
                        cfg.id,
                        attempt + 1,
                        cfg.retry.attempts,
                        e
                    );
                    lease = handle_retry(rt, lease, attempt, deadline, cancel).await?;
                    bindings.insert(cfg.key_variable.clone(), lease.value.clone());
                    attempt += 1;
                    continue;
                }
                warn!(
                    "executor: upstream network error, upstream={}, url={}, error={}",
                    cfg.id, url, e
                );
                return Err(ProxyError::Network(e.to_string()));
            }
        }
    }
}

/// Between-attempt policy: sleep per the retry mode, rotating the key when
/// the mode asks for it. Returns the lease to use for the next attempt.
async fn handle_retry(
    rt: &UpstreamRuntime,
    lease: KeyLease,
    attempt: u32,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<KeyLease, ProxyError> {
    let cfg = &rt.config;
    rt.stats.record_retry();
    metrics::counter!(
        "proxy_upstream_retries_total",
        "upstream" => cfg.id.clone(),
    )
    .increment(1);

    match cfg.retry.mode {
        RetryMode::KeyRotation => {
            lease.state.start_cooldown(cfg.retry.retry_after);
            metrics::counter!(
                "proxy_key_cooldowns_total",
                "upstream" => cfg.id.clone(),
            )
            .increment(1);
            let failed = lease.value.clone();
            debug!(
                "executor: rotating away from key {}, upstream={}",
                mask_key(&failed),
                cfg.id
            );
            // The failed key's in-flight slot releases here, before another
            // key is chosen.
            drop(lease);
            select_with_defer(rt, Some(&failed), deadline, cancel).await
        }
        _ => {
            let delay = cfg
                .retry
                .delay(attempt)
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(ProxyError::Canceled),
            }
            Ok(lease)
        }
    }
}

/// Select an eligible key, sleeping through deferrals until `deadline`.
/// Used for rotation (with an excluded key) and by workers re-evaluating a
/// deferred head-of-queue entry.
pub async fn select_with_defer(
    rt: &UpstreamRuntime,
    exclude: Option<&str>,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<KeyLease, ProxyError> {
    loop {
        match rt.pools.select_key(&rt.limiter, exclude) {
            KeySelection::Selected(lease) => return Ok(lease),
            KeySelection::Deferred { retry_at } => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(ProxyError::RateLimited);
                }
                let wake = retry_at
                    .unwrap_or(now + DEFER_POLL)
                    .min(deadline)
                    .max(now);
                tokio::select! {
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {}
                    _ = cancel.cancelled() => return Err(ProxyError::Canceled),
                }
            }
        }
    }
}

/// Buffer-side body handling: when the rewriter engages (enabled, JSON
/// content type, buffered body), apply the rule list and fix up framing.
/// A gzip-compressed body is decompressed first; if a rule fires, the
/// rewritten body is sent identity-encoded. When no rule fires the original
/// bytes (and their encoding) are forwarded untouched.
async fn prepare_body(
    cfg: &crate::config::CompiledUpstream,
    request: &mut CapturedRequest,
    body: BodySource,
) -> Result<BodySource, ProxyError> {
    let Some(rules) = &cfg.rewrite else {
        return Ok(body);
    };
    if rules.is_empty() {
        return Ok(body);
    }
    let is_json = request
        .headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false);
    if !is_json {
        return Ok(body);
    }
    let original = match body {
        BodySource::Buffered(bytes) => bytes,
        other => return Ok(other),
    };

    let encoding = request
        .headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase());

    let decoded: Bytes = match encoding.as_deref() {
        None | Some("identity") => original.clone(),
        Some("gzip") => match gunzip(&original).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Err(ProxyError::Configuration(format!(
                    "cannot decompress request body for rewriting: {}",
                    e
                )))
            }
        },
        Some(other) => {
            // An encoding the rewriter cannot undo: leave the body alone
            // rather than corrupt it.
            debug!(
                "executor: skipping body rewrite, unsupported content-encoding '{}'",
                other
            );
            return Ok(BodySource::Buffered(original));
        }
    };

    match rules.apply(&decoded) {
        Some(rewritten) => {
            request.headers.remove(CONTENT_ENCODING);
            Ok(BodySource::Buffered(Bytes::from(rewritten)))
        }
        None => Ok(BodySource::Buffered(original)),
    }
}

/// In-memory gzip decode via the tokio decoder; the input is already fully
/// buffered, so this completes without touching I/O.
async fn gunzip(input: &[u8]) -> std::io::Result<Bytes> {
    use async_compression::tokio::bufread::GzipDecoder;
    use tokio::io::AsyncReadExt;

    let mut decoder = GzipDecoder::new(input);
    let mut out = Vec::with_capacity(input.len() * 2);
    decoder.read_to_end(&mut out).await?;
    Ok(Bytes::from(out))
}

/// Convert the upstream response into the downstream one: status and
/// headers minus hop-by-hop, body streamed as-is (content-encoding
/// preserved). The key lease and worker permit travel inside the body and
/// release when the stream is dropped or finishes.
fn build_response(
    resp: reqwest::Response,
    lease: KeyLease,
    permit: OwnedSemaphorePermit,
) -> Response<BoxBody> {
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = resp.headers().clone();
    super::headers::strip_response_headers(&mut headers);

    let stream = resp
        .bytes_stream()
        .map_ok(Frame::data)
        .map_err(|e| -> BoxError { Box::new(e) });
    let inner: BoxBody = BodyExt::boxed_unsync(StreamBody::new(stream));
    let guarded = GuardedBody {
        inner,
        _lease: lease,
        _permit: permit,
    };

    let builder = Response::builder().status(status);
    let mut response = builder
        .body(BodyExt::boxed_unsync(guarded))
        .unwrap_or_else(|_| Response::new(crate::proxy::context::empty_body()));
    *response.headers_mut() = headers;
    response
}

/// Response body wrapper owning the resources that must live until the
/// client has consumed the stream.
struct GuardedBody {
    inner: BoxBody,
    _lease: KeyLease,
    _permit: OwnedSemaphorePermit,
}

impl hyper::body::Body for GuardedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        std::pin::Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        self.inner.size_hint()
    }
}
