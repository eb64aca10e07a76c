//! End-to-end tests: a real listener in front of a mock upstream.

use std::time::{Duration, Instant};

use apimux::config::compile::compile;
use apimux::config::ProxyConfig;
use apimux::server::{serve_proxy, AppState};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{any, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn start_proxy(toml_doc: &str) -> (AppState, String) {
    let raw: ProxyConfig = toml::from_str(toml_doc).expect("config parses");
    let compiled = compile(&raw).expect("config compiles");
    let state = AppState::new(compiled).expect("state builds");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(serve_proxy(listener, state.clone(), CancellationToken::new()));

    (state, format!("http://{}", addr))
}

fn three_key_config(endpoint: &str, extra: &str) -> String {
    format!(
        r#"
[apis.test]
endpoint = "{endpoint}"
key_variable = "key"
{extra}
[apis.test.headers]
x-test-key = "${{{{key}}}}"
[apis.test.variables]
key = ["alpha-key-111", "beta-key-2222", "gamma-key-333"]
"#
    )
}

#[tokio::test]
async fn round_robin_rotates_keys_in_order() {
    let upstream = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&upstream)
        .await;

    let (_state, base) = start_proxy(&three_key_config(&upstream.uri(), "")).await;
    let client = reqwest::Client::new();

    for _ in 0..6 {
        let resp = client
            .get(format!("{}/api/test/v1/ping", base))
            .send()
            .await
            .expect("proxy reachable");
        assert_eq!(resp.status(), 200);
    }

    let seen: Vec<String> = upstream
        .received_requests()
        .await
        .expect("requests recorded")
        .iter()
        .map(|r| {
            r.headers
                .get("x-test-key")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        })
        .collect();
    assert_eq!(
        seen,
        [
            "alpha-key-111",
            "beta-key-2222",
            "gamma-key-333",
            "alpha-key-111",
            "beta-key-2222",
            "gamma-key-333"
        ]
    );
}

#[tokio::test]
async fn key_rotation_retries_429_on_a_different_key() {
    let upstream = MockServer::start().await;
    Mock::given(header("x-test-key", "alpha-key-111"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&upstream)
        .await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200).set_body_string("rotated"))
        .mount(&upstream)
        .await;

    let config = format!(
        r#"
[apis.test]
endpoint = "{}"
key_variable = "key"
[apis.test.headers]
x-test-key = "${{{{key}}}}"
[apis.test.variables]
key = ["alpha-key-111", "beta-key-2222"]
[apis.test.retry]
mode = "key_rotation"
attempts = 3
retry_after_seconds = 0.2
retry_status_codes = [429]
"#,
        upstream.uri()
    );
    let (state, base) = start_proxy(&config).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/test/v1/chat", base))
        .body("{}")
        .send()
        .await
        .expect("proxy reachable");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "rotated");

    // One client request, one retry, zero client-visible errors, both keys
    // used once.
    let stats = state.stats.upstream("test");
    assert_eq!(stats.requests(), 1);
    assert_eq!(stats.errors(), 0);
    assert_eq!(stats.retries(), 1);
    let usage = stats.key_usage_snapshot();
    assert_eq!(usage.len(), 2);
    assert!(usage.iter().all(|(_, count)| *count == 1));
}

#[tokio::test]
async fn body_rule_fills_default_model() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let extra = r#"
[apis.test.request_body_substitution]
enabled = true
[[apis.test.request_body_substitution.rules]]
name = "default-model"
operation = "set"
path = "model"
value = "gpt-4"
[[apis.test.request_body_substitution.rules.conditions]]
field = "model"
operator = "nexists"
"#;
    let (_state, base) = start_proxy(&three_key_config(&upstream.uri(), extra)).await;
    let client = reqwest::Client::new();

    // Missing model → filled in.
    client
        .post(format!("{}/api/test/v1/chat", base))
        .header("content-type", "application/json")
        .body(r#"{"messages":[]}"#)
        .send()
        .await
        .expect("proxy reachable");

    // Present model → byte-identical pass-through.
    let original = r#"{"model":"x","messages":[]}"#;
    client
        .post(format!("{}/api/test/v1/chat", base))
        .header("content-type", "application/json")
        .body(original)
        .send()
        .await
        .expect("proxy reachable");

    let bodies: Vec<Vec<u8>> = upstream
        .received_requests()
        .await
        .expect("requests recorded")
        .iter()
        .map(|r| r.body.clone())
        .collect();
    assert_eq!(bodies.len(), 2);
    let first: serde_json::Value = serde_json::from_slice(&bodies[0]).unwrap();
    assert_eq!(first["model"], "gpt-4");
    assert_eq!(bodies[1], original.as_bytes());
}

#[tokio::test]
async fn body_rule_removes_disallowed_field() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let extra = r#"
[apis.test.request_body_substitution]
enabled = true
[[apis.test.request_body_substitution.rules]]
name = "strip-frequency-penalty"
operation = "remove"
path = "frequency_penalty"
[[apis.test.request_body_substitution.rules.conditions]]
field = "frequency_penalty"
operator = "exists"
"#;
    let (_state, base) = start_proxy(&three_key_config(&upstream.uri(), extra)).await;

    reqwest::Client::new()
        .post(format!("{}/api/test/v1/chat", base))
        .header("content-type", "application/json")
        .body(r#"{"frequency_penalty":0.5,"model":"x"}"#)
        .send()
        .await
        .expect("proxy reachable");

    let requests = upstream.received_requests().await.expect("recorded");
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body, serde_json::json!({"model": "x"}));
}

#[tokio::test]
async fn auth_gate_blocks_requests_without_a_known_bearer() {
    let upstream = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let config = format!(
        r#"
[server]
proxy_auth_keys = ["master-secret-1", "proxy-user-2"]
{}"#,
        three_key_config(&upstream.uri(), "")
    );
    let (_state, base) = start_proxy(&config).await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/test/v1/ping", base);

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client.get(&url).bearer_auth("wrong").send().await.unwrap();
    assert_eq!(resp.status(), 401);

    // Master and proxy-only credentials are equivalent on the proxy path.
    for token in ["master-secret-1", "proxy-user-2"] {
        let resp = client.get(&url).bearer_auth(token).send().await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    // Nothing reached the upstream unauthenticated.
    assert_eq!(upstream.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn router_rejects_unknown_method_and_path() {
    let upstream = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let extra = r#"
allowed_methods = ["POST"]
[apis.test.path_filter]
mode = "blacklist"
patterns = ["^/internal/"]
"#;
    let (_state, base) = start_proxy(&three_key_config(&upstream.uri(), extra)).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/api/unknown/v1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .get(format!("{}/api/test/v1/ping", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 405);

    let resp = client
        .post(format!("{}/api/test/internal/keys", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = client
        .post(format!("{}/api/test/v1/ping", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn endpoint_rate_limit_queues_overflow_until_the_window_slides() {
    let upstream = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let extra = r#"
[apis.test.rate_limit]
endpoint_rate_limit = "2/s"
[apis.test.queue]
max_size = 10
max_workers = 4
expiry_seconds = 10.0
"#;
    let (_state, base) = start_proxy(&three_key_config(&upstream.uri(), extra)).await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/test/v1/ping", base);

    let started = Instant::now();
    let (a, b, c) = tokio::join!(
        client.get(&url).send(),
        client.get(&url).send(),
        client.get(&url).send(),
    );
    let total = started.elapsed();

    for resp in [a.unwrap(), b.unwrap(), c.unwrap()] {
        assert_eq!(resp.status(), 200);
    }
    // Two requests fit the window; the third waits for the slide.
    assert!(
        total >= Duration::from_millis(900),
        "third request should have waited, total={:?}",
        total
    );
}

#[tokio::test]
async fn queued_request_expires_as_504_when_the_window_never_slides() {
    let upstream = MockServer::start().await;
    Mock::given(path("/v1/ping"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let extra = r#"
[apis.test.rate_limit]
endpoint_rate_limit = "1/h"
[apis.test.queue]
expiry_seconds = 1.0
"#;
    let (state, base) = start_proxy(&three_key_config(&upstream.uri(), extra)).await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/test/v1/ping", base);

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let started = Instant::now();
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 504);
    assert!(started.elapsed() >= Duration::from_millis(900));
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "queue_expired");

    let stats = state.stats.upstream("test");
    assert_eq!(stats.requests(), 2);
    assert_eq!(stats.errors(), 1);
}

#[tokio::test]
async fn queue_full_rejects_immediately_with_429() {
    let upstream = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let extra = r#"
[apis.test.rate_limit]
endpoint_rate_limit = "1/h"
[apis.test.queue]
max_size = 1
expiry_seconds = 5.0
"#;
    let (_state, base) = start_proxy(&three_key_config(&upstream.uri(), extra)).await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/test/v1/ping", base);

    // First consumes the window. The second is popped by the drain task and
    // held at the head waiting for headroom; the third fills the queue.
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let mut pending = Vec::new();
    for _ in 0..2 {
        pending.push(tokio::spawn({
            let client = client.clone();
            let url = url.clone();
            async move { client.get(&url).send().await }
        }));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 429);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "queue_full");

    for task in pending {
        task.abort();
    }
}

#[tokio::test]
async fn upstream_status_passes_through_verbatim_after_retries() {
    let upstream = MockServer::start().await;
    Mock::given(any())
        .respond_with(
            ResponseTemplate::new(418).set_body_string(r#"{"detail":"teapot"}"#),
        )
        .mount(&upstream)
        .await;

    let (_state, base) = start_proxy(&three_key_config(&upstream.uri(), "")).await;
    let resp = reqwest::Client::new()
        .get(format!("{}/api/test/v1/brew", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 418);
    assert_eq!(resp.text().await.unwrap(), r#"{"detail":"teapot"}"#);
}
