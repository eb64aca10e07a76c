use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use super::quota::RateQuota;

/// Deserialize a `T` that implements `Default` — treats `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level configuration document: `server`, `default_settings`,
/// `apis{<id>: …}`. Every upstream entry may override any default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub default_settings: UpstreamSettings,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub apis: BTreeMap<String, UpstreamSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Inbound bearer credentials. The first entry is the master credential
    /// (also authorized for the admin surface); the rest are proxy-only.
    /// An empty list disables inbound authentication entirely.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub proxy_auth_keys: Vec<String>,

    #[serde(default)]
    pub cors: CorsConfig,

    /// Outbound proxy URI (`http://…` or `socks5://…`) for all upstream
    /// connections.
    #[serde(default)]
    pub outbound_proxy: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            admin_port: default_admin_port(),
            proxy_auth_keys: Vec::new(),
            cors: CorsConfig::default(),
            outbound_proxy: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_admin_port() -> u16 {
    9091
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_cors_origin")]
    pub allow_origin: String,

    #[serde(default = "default_cors_methods")]
    pub allow_methods: String,

    #[serde(default = "default_cors_headers")]
    pub allow_headers: String,

    #[serde(default = "default_cors_max_age")]
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_origin: default_cors_origin(),
            allow_methods: default_cors_methods(),
            allow_headers: default_cors_headers(),
            max_age_seconds: default_cors_max_age(),
        }
    }
}

fn default_cors_origin() -> String {
    "*".to_string()
}

fn default_cors_methods() -> String {
    "GET, POST, PUT, DELETE, PATCH, OPTIONS, HEAD".to_string()
}

fn default_cors_headers() -> String {
    "Authorization, Content-Type".to_string()
}

fn default_cors_max_age() -> u64 {
    600
}

/// One pool value: a string or a number. Numbers render as decimal when
/// substituted into header templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarValue {
    Str(String),
    Num(serde_json::Number),
}

impl VarValue {
    pub fn render(&self) -> String {
        match self {
            VarValue::Str(s) => s.clone(),
            VarValue::Num(n) => n.to_string(),
        }
    }
}

/// Per-upstream settings. Every field is optional so that `default_settings`
/// can supply any subset; `merged()` resolves an api entry against the
/// defaults before compilation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// Target base URL. Required after merging.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Human-readable name; falls back to the api id.
    #[serde(default)]
    pub name: Option<String>,

    /// Path aliases, matched under `/api` and at the root.
    #[serde(default)]
    pub aliases: Option<Vec<String>>,

    /// Outbound header templates; values may contain `${{var}}` tokens.
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,

    /// Variable pools: name → ordered values.
    #[serde(default)]
    pub variables: Option<BTreeMap<String, Vec<VarValue>>>,

    /// Parallel weight vectors for the `weighted` strategy.
    #[serde(default)]
    pub variable_weights: Option<BTreeMap<String, Vec<u32>>>,

    /// "round_robin", "random", "least_requests", "fastest_response",
    /// "weighted".
    #[serde(default)]
    pub load_balance: Option<String>,

    /// Which variable is the rotated credential.
    #[serde(default)]
    pub key_variable: Option<String>,

    /// Whether one key may serve parallel requests.
    #[serde(default)]
    pub key_concurrency: Option<bool>,

    /// Upper bound of pre-send jitter in seconds.
    #[serde(default)]
    pub randomness: Option<f64>,

    /// Method allowlist. Absent means all methods.
    #[serde(default)]
    pub allowed_methods: Option<Vec<String>>,

    #[serde(default)]
    pub path_filter: Option<PathFilterSettings>,

    #[serde(default)]
    pub queue: Option<QueueSettings>,

    #[serde(default)]
    pub rate_limit: Option<RateLimitSettings>,

    #[serde(default)]
    pub retry: Option<RetrySettings>,

    /// Overall timeout from dispatch to last response byte.
    #[serde(default)]
    pub request_timeout_seconds: Option<f64>,

    #[serde(default)]
    pub request_body_substitution: Option<BodyRewriteSettings>,
}

impl UpstreamSettings {
    /// Resolve this entry against `defaults`, field by field. Collections are
    /// taken whole from the more specific side, not deep-merged.
    pub fn merged(&self, defaults: &UpstreamSettings) -> UpstreamSettings {
        UpstreamSettings {
            endpoint: self.endpoint.clone().or_else(|| defaults.endpoint.clone()),
            name: self.name.clone(),
            aliases: self.aliases.clone().or_else(|| defaults.aliases.clone()),
            headers: self.headers.clone().or_else(|| defaults.headers.clone()),
            variables: self
                .variables
                .clone()
                .or_else(|| defaults.variables.clone()),
            variable_weights: self
                .variable_weights
                .clone()
                .or_else(|| defaults.variable_weights.clone()),
            load_balance: self
                .load_balance
                .clone()
                .or_else(|| defaults.load_balance.clone()),
            key_variable: self
                .key_variable
                .clone()
                .or_else(|| defaults.key_variable.clone()),
            key_concurrency: self.key_concurrency.or(defaults.key_concurrency),
            randomness: self.randomness.or(defaults.randomness),
            allowed_methods: self
                .allowed_methods
                .clone()
                .or_else(|| defaults.allowed_methods.clone()),
            path_filter: self
                .path_filter
                .clone()
                .or_else(|| defaults.path_filter.clone()),
            queue: self.queue.clone().or_else(|| defaults.queue.clone()),
            rate_limit: self
                .rate_limit
                .clone()
                .or_else(|| defaults.rate_limit.clone()),
            retry: self.retry.clone().or_else(|| defaults.retry.clone()),
            request_timeout_seconds: self
                .request_timeout_seconds
                .or(defaults.request_timeout_seconds),
            request_body_substitution: self
                .request_body_substitution
                .clone()
                .or_else(|| defaults.request_body_substitution.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathFilterSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// "whitelist" (at least one pattern must match) or "blacklist"
    /// (no pattern may match).
    #[serde(default = "default_filter_mode")]
    pub mode: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub patterns: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_filter_mode() -> String {
    "whitelist".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default)]
    pub max_size: Option<usize>,

    #[serde(default)]
    pub expiry_seconds: Option<f64>,

    #[serde(default)]
    pub max_workers: Option<usize>,
}

/// Quota strings follow the `N/unit` grammar; `0/<unit>` disables a scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default)]
    pub endpoint_rate_limit: Option<RateQuota>,

    #[serde(default)]
    pub key_rate_limit: Option<RateQuota>,

    #[serde(default)]
    pub ip_rate_limit: Option<RateQuota>,

    #[serde(default)]
    pub user_rate_limit: Option<RateQuota>,

    /// Glob patterns selecting the paths the endpoint quota (and key-usage
    /// accounting) applies to. Default `["*"]`.
    #[serde(default)]
    pub rate_limit_paths: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrySettings {
    /// "default", "backoff", or "key_rotation".
    #[serde(default)]
    pub mode: Option<String>,

    #[serde(default)]
    pub attempts: Option<u32>,

    #[serde(default)]
    pub retry_after_seconds: Option<f64>,

    #[serde(default)]
    pub retry_status_codes: Option<Vec<u16>>,

    #[serde(default)]
    pub retry_request_methods: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BodyRewriteSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub rules: Vec<RuleSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSettings {
    pub name: String,

    /// "set" or "remove".
    pub operation: String,

    /// Path expression selecting the target node.
    pub path: String,

    /// Replacement value for `set`; may contain `${{path}}` tokens.
    #[serde(default)]
    pub value: Option<serde_json::Value>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub conditions: Vec<ConditionSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSettings {
    /// Path expression selecting the value the operator applies to.
    pub field: String,

    pub operator: String,

    #[serde(default)]
    pub value: Option<serde_json::Value>,
}
