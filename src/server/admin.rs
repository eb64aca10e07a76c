use http::{Method, StatusCode};
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde_json::json;
use std::convert::Infallible;

use super::state::AppState;
use crate::metrics::mask_key;
use crate::proxy::context::{full_body, BoxBody};
use crate::proxy::headers::bearer_token;

/// Read-only metrics/stats surface plus the queue "clear" control hook.
/// When inbound auth is configured, only the master credential (first entry
/// of the proxy-auth list) is accepted here.
pub fn handle_admin(
    req: Request<Incoming>,
    state: AppState,
) -> Result<Response<BoxBody>, Infallible> {
    let snapshot = state.snapshot.load_full();

    if let Some(master) = snapshot.auth_keys.first() {
        match bearer_token(req.headers()) {
            Some(token) if token == master => {}
            _ => {
                return Ok(json_response(
                    StatusCode::UNAUTHORIZED,
                    json!({"error": "unauthorized"}),
                ))
            }
        }
    }

    let path = req.uri().path();

    if req.method() == &Method::POST {
        if let Some(id) = path
            .strip_prefix("/queues/")
            .and_then(|rest| rest.strip_suffix("/clear"))
        {
            return Ok(match state.clear_queue(id) {
                Some(canceled) => json_response(
                    StatusCode::OK,
                    json!({"upstream": id, "canceled": canceled}),
                ),
                None => json_response(
                    StatusCode::NOT_FOUND,
                    json!({"error": "unknown upstream"}),
                ),
            });
        }
        return Ok(json_response(
            StatusCode::NOT_FOUND,
            json!({"error": "not found"}),
        ));
    }

    let response = match path {
        "/health" | "/healthz" => json_response(StatusCode::OK, json!({"status": "ok"})),

        "/ready" | "/readyz" => json_response(
            StatusCode::OK,
            json!({
                "status": "ready",
                "upstreams": snapshot.upstreams.len(),
                "routes": snapshot.routes.len(),
            }),
        ),

        "/metrics" => {
            let body = state.metrics.render();
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap_or_else(|_| Response::new(full_body("")))
        }

        "/stats" => {
            let mut stats = state.stats.snapshot();
            // Enrich with live queue depth and per-key runtime state.
            if let Some(upstreams) = stats.get_mut("upstreams").and_then(|v| v.as_object_mut())
            {
                for (id, entry) in upstreams.iter_mut() {
                    if let Some(rt) = snapshot.upstreams.get(id) {
                        entry["queue_depth"] = json!(rt.queue.depth());
                        entry["queue_max_size"] = json!(rt.queue.max_size());
                        let keys: Vec<serde_json::Value> = rt
                            .pools
                            .key_states_snapshot()
                            .into_iter()
                            .map(|(value, st)| {
                                json!({
                                    "key": mask_key(&value),
                                    "in_flight": st.in_flight(),
                                    "requests": st.requests(),
                                    "smoothed_response_ms": st
                                        .smoothed_response_time()
                                        .map(|d| d.as_millis() as u64),
                                    "cooldown_remaining": st.cooldown_remaining().map(|d| {
                                        let rounded =
                                            std::time::Duration::from_millis(d.as_millis() as u64);
                                        humantime::format_duration(rounded).to_string()
                                    }),
                                })
                            })
                            .collect();
                        entry["keys"] = json!(keys);
                    }
                }
            }
            json_response(StatusCode::OK, stats)
        }

        "/history" => {
            let entries = state.history.snapshot();
            json_response(StatusCode::OK, json!({ "entries": entries }))
        }

        _ => json_response(StatusCode::NOT_FOUND, json!({"error": "not found"})),
    };

    Ok(response)
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<BoxBody> {
    let body = serde_json::to_string_pretty(&value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap_or_else(|_| Response::new(full_body("")))
}
