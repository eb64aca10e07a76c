//! Config binding: validate a raw snapshot and build the immutable compiled
//! structures the request path runs against. Compilation happens before a
//! generation is installed; an error here leaves the previous generation
//! serving.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use http::Method;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::quota::RateQuota;
use super::types::{ProxyConfig, ServerConfig, UpstreamSettings, VarValue};
use crate::pool::strategy::Strategy;
use crate::proxy::headers::HeaderTemplate;
use crate::rewrite::RuleSet;

const METHODS: &[Method] = &[
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::OPTIONS,
    Method::HEAD,
];

pub struct CompiledConfig {
    pub server: ServerConfig,
    pub upstreams: Vec<Arc<CompiledUpstream>>,
}

impl CompiledConfig {
    /// The master credential — the first entry of the proxy-auth list.
    pub fn master_key(&self) -> Option<&str> {
        self.server.proxy_auth_keys.first().map(String::as_str)
    }
}

/// One upstream, fully resolved against `default_settings` and validated.
/// Immutable for the lifetime of a config generation.
pub struct CompiledUpstream {
    pub id: String,
    pub name: String,
    /// Base URL without a trailing slash.
    pub base_url: String,
    /// Normalized aliases (leading `/`, no trailing `/`).
    pub aliases: Vec<String>,
    pub header_templates: Vec<HeaderTemplate>,
    /// Variable names the header templates reference, in first-use order.
    pub referenced_variables: Vec<String>,
    pub variables: BTreeMap<String, Vec<VarValue>>,
    pub variable_weights: BTreeMap<String, Vec<u32>>,
    pub strategy: Strategy,
    pub key_variable: String,
    pub key_concurrency: bool,
    /// Upper bound of pre-send jitter, seconds.
    pub randomness: f64,
    pub allowed_methods: Option<Vec<Method>>,
    pub path_filter: Option<PathFilter>,
    pub queue: QueueTuning,
    pub rate: RateTuning,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub rewrite: Option<RuleSet>,
}

impl CompiledUpstream {
    pub fn method_allowed(&self, method: &Method) -> bool {
        match &self.allowed_methods {
            Some(list) => list.contains(method),
            None => true,
        }
    }

    /// Whether the upstream's own header templates set `Authorization`.
    pub fn sets_authorization(&self) -> bool {
        self.header_templates
            .iter()
            .any(|t| t.name == http::header::AUTHORIZATION)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Whitelist,
    Blacklist,
}

enum PathPattern {
    /// The bare `"*"` entry: match everything regardless of mode.
    MatchAll,
    Re(Regex),
}

pub struct PathFilter {
    mode: FilterMode,
    patterns: Vec<PathPattern>,
}

impl PathFilter {
    pub fn allows(&self, suffix: &str) -> bool {
        let any_match = self.patterns.iter().any(|p| match p {
            PathPattern::MatchAll => true,
            PathPattern::Re(re) => re.is_match(suffix),
        });
        match self.mode {
            FilterMode::Whitelist => any_match,
            FilterMode::Blacklist => {
                // "*" means match-everything in either mode; a blacklist
                // containing it would block every request, which validation
                // already normalized away.
                !self
                    .patterns
                    .iter()
                    .any(|p| matches!(p, PathPattern::Re(re) if re.is_match(suffix)))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueTuning {
    pub max_size: usize,
    pub expiry: Duration,
    pub max_workers: usize,
}

/// Quotas per scope; `None` means unlimited (no window allocated).
#[derive(Clone)]
pub struct RateTuning {
    pub endpoint: Option<RateQuota>,
    pub key: Option<RateQuota>,
    pub ip: Option<RateQuota>,
    pub user: Option<RateQuota>,
    pub paths: RatePathMatcher,
}

/// Glob matcher selecting the paths that count toward the endpoint quota
/// and key-usage accounting.
#[derive(Clone)]
pub struct RatePathMatcher {
    match_all: bool,
    set: Arc<GlobSet>,
}

impl RatePathMatcher {
    pub fn match_all() -> Self {
        Self {
            match_all: true,
            set: Arc::new(GlobSet::empty()),
        }
    }

    pub fn compile(patterns: &[String]) -> Result<Self, String> {
        if patterns.is_empty() || patterns.iter().any(|p| p == "*") {
            return Ok(Self::match_all());
        }
        let mut builder = GlobSetBuilder::new();
        for p in patterns {
            let glob =
                Glob::new(p).map_err(|e| format!("invalid rate-limit path '{}': {}", p, e))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| format!("invalid rate-limit path set: {}", e))?;
        Ok(Self {
            match_all: false,
            set: Arc::new(set),
        })
    }

    pub fn matches(&self, suffix: &str) -> bool {
        self.match_all || self.set.is_match(suffix.trim_start_matches('/'))
            || self.set.is_match(suffix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    Default,
    Backoff,
    KeyRotation,
}

#[derive(Clone)]
pub struct RetryPolicy {
    pub mode: RetryMode,
    pub attempts: u32,
    pub retry_after: Duration,
    pub status_codes: Vec<u16>,
    pub methods: Vec<Method>,
}

impl RetryPolicy {
    pub fn method_retryable(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    pub fn status_retryable(&self, method: &Method, status: u16) -> bool {
        self.method_retryable(method) && self.status_codes.contains(&status)
    }

    /// Sleep before attempt `attempt + 1` (zero-based attempt that just
    /// failed). `backoff` doubles per attempt, capped at 60s; `key_rotation`
    /// resends immediately on the new key (the cooldown lives on the old
    /// one).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.mode {
            RetryMode::Default => self.retry_after,
            RetryMode::Backoff => {
                let factor = 2u32.saturating_pow(attempt);
                (self.retry_after * factor).min(Duration::from_secs(60))
            }
            RetryMode::KeyRotation => Duration::ZERO,
        }
    }
}

pub fn compile(raw: &ProxyConfig) -> Result<CompiledConfig> {
    if raw.apis.is_empty() {
        bail!("no upstreams configured under [apis]");
    }

    let mut upstreams = Vec::with_capacity(raw.apis.len());
    let mut seen_prefixes: HashSet<String> = HashSet::new();

    for (id, settings) in &raw.apis {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!("upstream id '{}' must be alphanumeric with '-' or '_'", id);
        }
        let merged = settings.merged(&raw.default_settings);
        let upstream = compile_upstream(id, &merged)
            .with_context(|| format!("upstream '{}'", id))?;

        let prefixes = std::iter::once(format!("/api/{}", id)).chain(
            upstream
                .aliases
                .iter()
                .flat_map(|a| [a.clone(), format!("/api{}", a)]),
        );
        for prefix in prefixes {
            if !seen_prefixes.insert(prefix.clone()) {
                bail!("duplicate route prefix '{}' (upstream '{}')", prefix, id);
            }
        }
        upstreams.push(Arc::new(upstream));
    }

    Ok(CompiledConfig {
        server: raw.server.clone(),
        upstreams,
    })
}

fn compile_upstream(id: &str, s: &UpstreamSettings) -> Result<CompiledUpstream> {
    let base_url = match s.endpoint.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                bail!("endpoint '{}' must be an http(s) URL", url);
            }
            url.trim_end_matches('/').to_string()
        }
        _ => bail!("missing endpoint URL"),
    };

    let headers = match &s.headers {
        Some(h) if !h.is_empty() => h,
        _ => bail!("header map must be non-empty"),
    };

    let variables = match &s.variables {
        Some(v) if !v.is_empty() => v.clone(),
        _ => bail!("at least one variable is required"),
    };
    for (name, values) in &variables {
        if values.is_empty() {
            bail!("variable '{}' has an empty pool", name);
        }
    }

    let key_variable = match &s.key_variable {
        Some(k) if variables.contains_key(k) => k.clone(),
        Some(k) => bail!("key_variable '{}' does not refer to a variable", k),
        None => bail!("key_variable is required"),
    };

    let variable_weights = s.variable_weights.clone().unwrap_or_default();
    for (name, weights) in &variable_weights {
        let Some(values) = variables.get(name) else {
            bail!("weights given for unknown variable '{}'", name);
        };
        if weights.len() != values.len() {
            bail!(
                "variable '{}': {} weights for {} values",
                name,
                weights.len(),
                values.len()
            );
        }
    }

    let strategy = match s.load_balance.as_deref() {
        None => Strategy::RoundRobin,
        Some(name) => Strategy::parse(name)
            .ok_or_else(|| anyhow::anyhow!("unknown load_balance strategy '{}'", name))?,
    };

    let mut header_templates = Vec::with_capacity(headers.len());
    let mut referenced_variables: Vec<String> = Vec::new();
    for (name, value) in headers {
        let template =
            HeaderTemplate::compile(name, value).map_err(|e| anyhow::anyhow!(e))?;
        for var in template.variables() {
            if !variables.contains_key(var) {
                bail!(
                    "header '{}' references unknown variable '{}'",
                    name,
                    var
                );
            }
            if !referenced_variables.iter().any(|v| v == var) {
                referenced_variables.push(var.to_string());
            }
        }
        header_templates.push(template);
    }

    let aliases = s
        .aliases
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|a| normalize_alias(&a))
        .collect::<Result<Vec<_>>>()?;

    let allowed_methods = match &s.allowed_methods {
        None => None,
        Some(names) => {
            let mut methods = Vec::with_capacity(names.len());
            for name in names {
                let m = parse_method(name)?;
                if !methods.contains(&m) {
                    methods.push(m);
                }
            }
            if methods.is_empty() {
                bail!("allowed_methods must not be empty when set");
            }
            Some(methods)
        }
    };

    let path_filter = match &s.path_filter {
        Some(pf) if pf.enabled && !pf.patterns.is_empty() => {
            let mode = match pf.mode.as_str() {
                "whitelist" => FilterMode::Whitelist,
                "blacklist" => FilterMode::Blacklist,
                other => bail!("unknown path_filter mode '{}'", other),
            };
            let patterns = pf
                .patterns
                .iter()
                .map(|p| {
                    if p == "*" {
                        Ok(PathPattern::MatchAll)
                    } else {
                        Regex::new(p)
                            .map(PathPattern::Re)
                            .with_context(|| format!("invalid path filter pattern '{}'", p))
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            Some(PathFilter { mode, patterns })
        }
        _ => None,
    };

    let queue = {
        let q = s.queue.clone().unwrap_or_default();
        let expiry_seconds = q.expiry_seconds.unwrap_or(60.0);
        if expiry_seconds <= 0.0 {
            bail!("queue expiry_seconds must be positive");
        }
        QueueTuning {
            max_size: q.max_size.unwrap_or(100),
            expiry: Duration::from_secs_f64(expiry_seconds),
            max_workers: q.max_workers.unwrap_or(4).max(1),
        }
    };

    let rate = {
        let r = s.rate_limit.clone().unwrap_or_default();
        let paths = match &r.rate_limit_paths {
            None => RatePathMatcher::match_all(),
            Some(patterns) => {
                RatePathMatcher::compile(patterns).map_err(|e| anyhow::anyhow!(e))?
            }
        };
        RateTuning {
            endpoint: r.endpoint_rate_limit.and_then(RateQuota::enabled),
            key: r.key_rate_limit.and_then(RateQuota::enabled),
            ip: r.ip_rate_limit.and_then(RateQuota::enabled),
            user: r.user_rate_limit.and_then(RateQuota::enabled),
            paths,
        }
    };

    let retry = {
        let r = s.retry.clone().unwrap_or_default();
        let mode = match r.mode.as_deref() {
            None | Some("default") => RetryMode::Default,
            Some("backoff") => RetryMode::Backoff,
            Some("key_rotation") => RetryMode::KeyRotation,
            Some(other) => bail!("unknown retry mode '{}'", other),
        };
        let retry_after = r.retry_after_seconds.unwrap_or(1.0);
        if retry_after < 0.0 {
            bail!("retry_after_seconds must not be negative");
        }
        let methods = match &r.retry_request_methods {
            None => METHODS.to_vec(),
            Some(names) => names
                .iter()
                .map(|n| parse_method(n))
                .collect::<Result<Vec<_>>>()?,
        };
        RetryPolicy {
            mode,
            attempts: r.attempts.unwrap_or(0),
            retry_after: Duration::from_secs_f64(retry_after),
            status_codes: r
                .retry_status_codes
                .unwrap_or_else(|| vec![429, 500, 502, 503, 504]),
            methods,
        }
    };

    let randomness = s.randomness.unwrap_or(0.0);
    if randomness < 0.0 {
        bail!("randomness must not be negative");
    }

    let request_timeout_seconds = s.request_timeout_seconds.unwrap_or(30.0);
    if request_timeout_seconds <= 0.0 {
        bail!("request_timeout_seconds must be positive");
    }

    let rewrite = match &s.request_body_substitution {
        Some(b) if b.enabled => Some(RuleSet::compile(b).map_err(|e| anyhow::anyhow!(e))?),
        _ => None,
    };

    Ok(CompiledUpstream {
        id: id.to_string(),
        name: s.name.clone().unwrap_or_else(|| id.to_string()),
        base_url,
        aliases,
        header_templates,
        referenced_variables,
        variables,
        variable_weights,
        strategy,
        key_variable,
        key_concurrency: s.key_concurrency.unwrap_or(true),
        randomness,
        allowed_methods,
        path_filter,
        queue,
        rate,
        retry,
        request_timeout: Duration::from_secs_f64(request_timeout_seconds),
        rewrite,
    })
}

fn normalize_alias(alias: &str) -> Result<String> {
    let trimmed = alias.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "/" {
        bail!("alias '{}' is empty", alias);
    }
    let with_slash = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    };
    if with_slash == "/api" {
        bail!("alias '/api' would shadow the id namespace");
    }
    Ok(with_slash)
}

fn parse_method(name: &str) -> Result<Method> {
    let upper = name.to_ascii_uppercase();
    METHODS
        .iter()
        .find(|m| m.as_str() == upper)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("method '{}' is not in the allowed set", name))
}
