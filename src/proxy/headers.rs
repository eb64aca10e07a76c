//! Outbound header construction: `${{var}}` template rendering plus the
//! suppression rules for hop-by-hop, CDN-injected, and credential headers.

use http::header::{AUTHORIZATION, CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::config::types::CorsConfig;

/// One configured header whose value may contain `${{name}}` tokens.
/// Compiled at config validation; rendering never sees an unknown token.
pub struct HeaderTemplate {
    pub name: HeaderName,
    segments: Vec<Segment>,
}

enum Segment {
    Lit(String),
    Var(String),
}

impl HeaderTemplate {
    pub fn compile(name: &str, value: &str) -> Result<Self, String> {
        let name: HeaderName = name
            .parse()
            .map_err(|_| format!("invalid header name '{}'", name))?;

        let mut segments = Vec::new();
        let mut rest = value;
        while let Some(start) = rest.find("${{") {
            let Some(end) = rest[start..].find("}}") else {
                return Err(format!(
                    "header '{}': unterminated ${{{{…}}}} token",
                    name
                ));
            };
            if start > 0 {
                segments.push(Segment::Lit(rest[..start].to_string()));
            }
            let var = rest[start + 3..start + end].trim();
            if var.is_empty() {
                return Err(format!("header '{}': empty ${{{{…}}}} token", name));
            }
            segments.push(Segment::Var(var.to_string()));
            rest = &rest[start + end + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Lit(rest.to_string()));
        }

        Ok(Self { name, segments })
    }

    /// Variable names this template references.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Var(v) => Some(v.as_str()),
            Segment::Lit(_) => None,
        })
    }

    /// Render with the per-request bindings. A missing binding is a runtime
    /// configuration fault — validation guarantees it cannot happen for a
    /// correctly installed snapshot.
    pub fn render(&self, bindings: &HashMap<String, String>) -> Result<HeaderValue, String> {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Lit(s) => out.push_str(s),
                Segment::Var(name) => match bindings.get(name) {
                    Some(v) => out.push_str(v),
                    None => {
                        return Err(format!(
                            "header '{}': unresolved variable '{}'",
                            self.name, name
                        ))
                    }
                },
            }
        }
        HeaderValue::from_str(&out)
            .map_err(|_| format!("header '{}': rendered value is not a valid header", self.name))
    }
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Cloudflare-injected client headers that must not leak to the upstream.
fn is_cdn_injected(name: &HeaderName) -> bool {
    let n = name.as_str();
    n.starts_with("cf-") || n == "cdn-loop" || n == "true-client-ip"
}

/// Copy client headers, dropping everything the proxy must not forward:
/// hop-by-hop headers, CDN client headers, `Host` (the client builds a new
/// one for the upstream), and the inbound `Authorization` when the upstream
/// defines its own. `Content-Length` is dropped too — the executor's body
/// handling (buffer vs. stream, rewrite) re-establishes framing.
pub fn sanitize_client_headers(
    headers: &HeaderMap,
    upstream_sets_authorization: bool,
) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || is_cdn_injected(name) {
            continue;
        }
        if name == &HOST || name == &CONTENT_LENGTH {
            continue;
        }
        if upstream_sets_authorization && name == &AUTHORIZATION {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Strip hop-by-hop headers from an upstream response before it is streamed
/// back to the client. `Content-Encoding` is left untouched — the proxy
/// never transparently decompresses responses.
pub fn strip_response_headers(headers: &mut HeaderMap) {
    let names: Vec<HeaderName> = headers
        .keys()
        .filter(|n| is_hop_by_hop(n))
        .cloned()
        .collect();
    for name in names {
        headers.remove(name);
    }
}

/// Resolve the client IP: `X-Real-IP` first, else the first entry of
/// `X-Forwarded-For`, else the socket peer address.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return ip.to_string();
    }
    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return ip.to_string();
    }
    peer.ip().to_string()
}

/// Extract the bearer credential from an inbound `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Append the configured CORS headers to a response.
pub fn apply_cors(headers: &mut HeaderMap, cors: &CorsConfig) {
    let mut set = |name: &'static str, value: &str| {
        if let Ok(v) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), v);
        }
    };
    set("access-control-allow-origin", &cors.allow_origin);
    set("access-control-allow-methods", &cors.allow_methods);
    set("access-control-allow-headers", &cors.allow_headers);
    set("access-control-max-age", &cors.max_age_seconds.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn template_renders_tokens() {
        let t = HeaderTemplate::compile("authorization", "Bearer ${{key}}").unwrap();
        let v = t.render(&bindings(&[("key", "sk-123")])).unwrap();
        assert_eq!(v, "Bearer sk-123");
        assert_eq!(t.variables().collect::<Vec<_>>(), vec!["key"]);
    }

    #[test]
    fn template_multiple_tokens_and_literals() {
        let t = HeaderTemplate::compile("x-acct", "${{org}}/${{key}}/v1").unwrap();
        let v = t
            .render(&bindings(&[("org", "acme"), ("key", "k1")]))
            .unwrap();
        assert_eq!(v, "acme/k1/v1");
    }

    #[test]
    fn template_missing_binding_fails() {
        let t = HeaderTemplate::compile("authorization", "Bearer ${{key}}").unwrap();
        assert!(t.render(&bindings(&[])).is_err());
    }

    #[test]
    fn template_compile_rejects_malformed() {
        assert!(HeaderTemplate::compile("bad header", "x").is_err());
        assert!(HeaderTemplate::compile("x-a", "${{unterminated").is_err());
        assert!(HeaderTemplate::compile("x-a", "${{}}").is_err());
    }

    #[test]
    fn sanitize_strips_suppressed_headers() {
        let mut h = HeaderMap::new();
        h.insert("connection", "keep-alive".parse().unwrap());
        h.insert("te", "trailers".parse().unwrap());
        h.insert("host", "proxy.local".parse().unwrap());
        h.insert("cf-connecting-ip", "1.2.3.4".parse().unwrap());
        h.insert("cdn-loop", "cloudflare".parse().unwrap());
        h.insert("true-client-ip", "1.2.3.4".parse().unwrap());
        h.insert("content-length", "12".parse().unwrap());
        h.insert("accept", "application/json".parse().unwrap());
        h.insert("authorization", "Bearer client-token".parse().unwrap());

        let out = sanitize_client_headers(&h, true);
        assert_eq!(out.len(), 1);
        assert_eq!(out.get("accept").unwrap(), "application/json");

        // Without an upstream credential the client's Authorization passes.
        let out = sanitize_client_headers(&h, false);
        assert_eq!(out.get("authorization").unwrap(), "Bearer client-token");
    }

    #[test]
    fn client_ip_prefers_x_real_ip() {
        let peer: SocketAddr = "10.0.0.9:1234".parse().unwrap();
        let mut h = HeaderMap::new();
        assert_eq!(client_ip(&h, peer), "10.0.0.9");

        h.insert("x-forwarded-for", "7.7.7.7, 8.8.8.8".parse().unwrap());
        assert_eq!(client_ip(&h, peer), "7.7.7.7");

        h.insert("x-real-ip", "6.6.6.6".parse().unwrap());
        assert_eq!(client_ip(&h, peer), "6.6.6.6");
    }

    #[test]
    fn bearer_token_parsing() {
        let mut h = HeaderMap::new();
        assert!(bearer_token(&h).is_none());
        h.insert("authorization", "Bearer tok-1".parse().unwrap());
        assert_eq!(bearer_token(&h), Some("tok-1"));
        h.insert("authorization", "Basic dXNlcg==".parse().unwrap());
        assert!(bearer_token(&h).is_none());
    }
}
