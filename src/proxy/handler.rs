//! Inbound request pipeline:
//!
//! 1. ROUTE      — longest-prefix match to one upstream
//! 2. PREFLIGHT  — OPTIONS short-circuit when CORS is enabled
//! 3. FILTERS    — method allowlist, path filter, proxy-user auth
//! 4. CAPTURE    — client-IP resolution, header sanitizing, body capture
//! 5. ADMIT      — rate-limit fast path, or the upstream admission queue
//! 6. RESPOND    — stream back, then one accounting + access-log step

use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::{Body as _, Incoming};
use hyper::{Request, Response};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProxyError;
use crate::limit::Admission;
use crate::pool::KeySelection;
use crate::proxy::context::{self, empty_body, BoxBody, RequestContext};
use crate::proxy::{executor, headers};
use crate::queue::{BodySource, CapturedRequest, QueuedRequest};
use crate::server::state::{AppState, Snapshot};

pub async fn handle_request(
    req: Request<Incoming>,
    state: AppState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, Infallible> {
    let snapshot = state.snapshot.load_full();
    let mut ctx = RequestContext::new(
        req.method().as_str().to_string(),
        req.uri().path().to_string(),
    );

    metrics::gauge!("proxy_http_requests_in_flight").increment(1.0);

    let mut response = match serve(req, &snapshot, &mut ctx, peer_addr).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!(
                "proxy: request failed, upstream={}, path={}, kind={}",
                ctx.upstream_id,
                ctx.path,
                e.kind()
            );
            context::error_response(&e)
        }
    };

    if snapshot.cors.enabled {
        headers::apply_cors(response.headers_mut(), &snapshot.cors);
    }

    let status = response.status().as_u16();
    state.stats.record_outcome(ctx.stats.as_deref(), status);
    ctx.finalize_metrics(status);
    metrics::gauge!("proxy_http_requests_in_flight").decrement(1.0);

    // Structured access log — one line per request at info level.
    tracing::info!(
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        path = %ctx.path,
        status = status,
        upstream = %ctx.upstream_id,
        latency_ms = %ctx.start.elapsed().as_millis(),
        "access"
    );

    Ok(response)
}

async fn serve(
    req: Request<Incoming>,
    snapshot: &Snapshot,
    ctx: &mut RequestContext,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, ProxyError> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());

    let (upstream, suffix) = {
        let (u, s) = snapshot.routes.resolve(&path).ok_or(ProxyError::NotFound)?;
        (u, s.to_string())
    };
    ctx.upstream_id = upstream.id.clone();

    let rt = snapshot
        .upstreams
        .get(&upstream.id)
        .ok_or_else(|| ProxyError::Configuration("missing upstream runtime".to_string()))?
        .clone();
    ctx.stats = Some(rt.stats.clone());

    // CORS preflight answered directly; without CORS, OPTIONS proxies as
    // any other method.
    if method == Method::OPTIONS && snapshot.cors.enabled {
        return Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(empty_body())
            .map_err(|e| ProxyError::Configuration(e.to_string()));
    }

    if !upstream.method_allowed(&method) {
        return Err(ProxyError::MethodNotAllowed(method.to_string()));
    }

    if let Some(filter) = &upstream.path_filter {
        if !filter.allows(&suffix) {
            return Err(ProxyError::PathForbidden);
        }
    }

    let user = if snapshot.auth_keys.is_empty() {
        None
    } else {
        let token = headers::bearer_token(req.headers()).ok_or(ProxyError::Unauthorized)?;
        if !snapshot.auth_keys.iter().any(|k| k == token) {
            return Err(ProxyError::Unauthorized);
        }
        Some(token.to_string())
    };
    ctx.user = user.clone();

    let client_ip = headers::client_ip(req.headers(), peer_addr);
    ctx.client_ip = client_ip.clone();

    let sanitized = headers::sanitize_client_headers(req.headers(), upstream.sets_authorization());

    // Buffer the body whenever it may need replay (retries) or inspection
    // (rewriter + JSON); otherwise keep the one-shot stream handle and
    // forward with backpressure.
    let content_type_json = req
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false);
    let must_buffer =
        upstream.retry.attempts > 0 || (upstream.rewrite.is_some() && content_type_json);

    let body = req.into_body();
    let body_source = if must_buffer {
        let collected = body
            .collect()
            .await
            .map_err(|_| ProxyError::Canceled)?
            .to_bytes();
        if collected.is_empty() {
            BodySource::Empty
        } else {
            BodySource::Buffered(collected)
        }
    } else if body.is_end_stream() {
        BodySource::Empty
    } else {
        BodySource::Streaming(body)
    };

    let captured = CapturedRequest {
        method,
        suffix,
        query,
        headers: sanitized,
        client_ip,
        user,
    };

    // Cancellation: dropping this handler future (client disconnect, or
    // hyper tearing the connection down) cancels the token and with it the
    // queue entry / in-flight dispatch.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    // Fast path: nothing queued, a worker slot free, every window with
    // headroom, and an eligible key — dispatch without touching the queue.
    if rt.queue.is_empty() {
        if let Ok(permit) = rt.workers.clone().try_acquire_owned() {
            let admitted = matches!(
                rt.limiter.admit(
                    &captured.suffix,
                    &captured.client_ip,
                    captured.user.as_deref()
                ),
                Admission::Admitted
            );
            if admitted {
                if let KeySelection::Selected(lease) = rt.pools.select_key(&rt.limiter, None) {
                    let resp =
                        executor::dispatch(&rt, captured, body_source, lease, &cancel, permit)
                            .await?;
                    guard.disarm();
                    return Ok(resp);
                }
            }
            // Blocked or key-deferred: fall through to the queue. A sample
            // consumed by an admit that then deferred is not rolled back —
            // the limiter only ever errs toward admitting less.
        }
    }

    // Queued path: bounded FIFO admission with deadline.
    let now = Instant::now();
    let (respond, rx) = oneshot::channel();
    let entry = QueuedRequest {
        request: captured,
        body: body_source,
        enqueued_at: now,
        deadline: now + upstream.queue.expiry,
        cancel: cancel.clone(),
        respond,
    };
    if rt.queue.try_push(entry).is_err() {
        metrics::counter!(
            "proxy_queue_rejected_total",
            "upstream" => upstream.id.clone(),
        )
        .increment(1);
        return Err(ProxyError::QueueFull);
    }
    rt.stats.record_queue_hit();
    metrics::counter!(
        "proxy_queue_enqueued_total",
        "upstream" => upstream.id.clone(),
    )
    .increment(1);
    metrics::gauge!(
        "proxy_queue_depth",
        "upstream" => upstream.id.clone(),
    )
    .set(rt.queue.depth() as f64);

    match rx.await {
        Ok(response) => {
            guard.disarm();
            Ok(response)
        }
        // The entry died without a response: queue cleared, or the worker
        // observed our cancellation.
        Err(_) => Err(ProxyError::Canceled),
    }
}
