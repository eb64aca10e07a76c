//! Per-upstream drain task.
//!
//! One task per upstream pops the admission queue strictly in FIFO order.
//! A popped entry whose scopes are rate-limited is held at the head (it
//! never rotates to the back) and re-evaluated when the earliest blocking
//! window can admit again. Execution parallelism is bounded by the worker
//! semaphore; the drain task hands admitted entries to spawned dispatch
//! tasks carrying the slot permit.

use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::error::ProxyError;
use crate::limit::Admission;
use crate::proxy::context::error_response;
use crate::proxy::executor;
use crate::queue::QueuedRequest;
use crate::server::state::UpstreamRuntime;

pub async fn run(rt: Arc<UpstreamRuntime>) {
    loop {
        let entry = loop {
            if let Some(entry) = rt.queue.pop() {
                break entry;
            }
            if rt.generation.is_cancelled() {
                debug!("worker: generation drained, upstream={}", rt.config.id);
                return;
            }
            tokio::select! {
                _ = rt.queue.wait() => {}
                _ = rt.generation.cancelled() => {}
            }
        };
        metrics::gauge!(
            "proxy_queue_depth",
            "upstream" => rt.config.id.clone(),
        )
        .set(rt.queue.depth() as f64);

        // Canceled entries are dropped without contacting the upstream; the
        // client connection is already gone.
        if entry.canceled() {
            continue;
        }
        if entry.expired(Instant::now()) {
            expire(&rt, entry);
            continue;
        }

        // Bound execution parallelism before admitting. The entry stays in
        // hand (head position) while waiting for a slot.
        let permit = tokio::select! {
            permit = rt.workers.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
            _ = entry.cancel.cancelled() => continue,
        };
        if entry.expired(Instant::now()) {
            expire(&rt, entry);
            continue;
        }

        serve_entry(&rt, entry, permit).await;
    }
}

/// Admission loop for one head-of-queue entry: wait out endpoint/ip/user
/// windows and key-selection deferrals, honoring the entry deadline, then
/// hand off to a dispatch task.
async fn serve_entry(
    rt: &Arc<UpstreamRuntime>,
    entry: QueuedRequest,
    permit: tokio::sync::OwnedSemaphorePermit,
) {
    let mut blocked_once = false;
    loop {
        if entry.canceled() {
            return;
        }
        let now = Instant::now();
        if entry.expired(now) {
            expire(rt, entry);
            return;
        }

        match rt.limiter.admit(
            &entry.request.suffix,
            &entry.request.client_ip,
            entry.request.user.as_deref(),
        ) {
            Admission::Admitted => {
                let lease = match executor::select_with_defer(
                    rt,
                    None,
                    entry.deadline,
                    &entry.cancel,
                )
                .await
                {
                    Ok(lease) => lease,
                    Err(ProxyError::Canceled) => return,
                    Err(_) => {
                        // Deadline spent waiting for key headroom: a window
                        // with no headroom within the queue expiry is a 429.
                        let _ = entry
                            .respond
                            .send(error_response(&ProxyError::RateLimited));
                        return;
                    }
                };

                let rt = rt.clone();
                tokio::spawn(async move {
                    let QueuedRequest {
                        request,
                        body,
                        cancel,
                        respond,
                        ..
                    } = entry;
                    match executor::dispatch(&rt, request, body, lease, &cancel, permit).await {
                        Ok(response) => {
                            let _ = respond.send(response);
                        }
                        // Client is gone; nothing to deliver.
                        Err(ProxyError::Canceled) => {}
                        Err(e) => {
                            let _ = respond.send(error_response(&e));
                        }
                    }
                });
                return;
            }
            Admission::Blocked { retry_at } => {
                if !blocked_once {
                    blocked_once = true;
                    rt.registry.record_rate_limit_hit(&rt.stats);
                    metrics::counter!(
                        "proxy_rate_limit_hits_total",
                        "upstream" => rt.config.id.clone(),
                        "scope" => "request",
                    )
                    .increment(1);
                }
                let wake = retry_at
                    .unwrap_or_else(|| now + std::time::Duration::from_millis(50))
                    .min(entry.deadline)
                    .max(now);
                tokio::select! {
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {}
                    _ = entry.cancel.cancelled() => return,
                }
                // The deadline check at the top of the loop turns an entry
                // that never saw headroom into a queue_expired 504.
            }
        }
    }
}

fn expire(rt: &UpstreamRuntime, entry: QueuedRequest) {
    metrics::counter!(
        "proxy_queue_expired_total",
        "upstream" => rt.config.id.clone(),
    )
    .increment(1);
    let _ = entry.respond.send(error_response(&ProxyError::QueueExpired));
}
