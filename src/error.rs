use http::StatusCode;
use std::fmt;

/// Request-path error taxonomy. Every variant maps to a client-visible
/// status code and a stable `kind` string used in response bodies and
/// metric labels.
#[derive(Debug)]
pub enum ProxyError {
    /// Unknown upstream id or alias.
    NotFound,
    MethodNotAllowed(String),
    PathForbidden,
    /// Missing or invalid proxy bearer credential.
    Unauthorized,
    /// Window exceeded with no queue room or the deadline passed.
    RateLimited,
    /// Admission queue at capacity.
    QueueFull,
    /// Entry expired before a worker could dispatch it.
    QueueExpired,
    UpstreamTimeout,
    /// Connection / TLS / read failure with no upstream status.
    Network(String),
    /// Runtime-only configuration inconsistency (e.g. unresolved template).
    Configuration(String),
    /// Client connection is already gone; the response never leaves the proxy.
    Canceled,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NotFound => StatusCode::NOT_FOUND,
            ProxyError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::PathForbidden => StatusCode::FORBIDDEN,
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::RateLimited | ProxyError::QueueFull => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::QueueExpired | ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Network(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // nginx's "client closed request" — never actually written back.
            ProxyError::Canceled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_GATEWAY),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::NotFound => "not_found",
            ProxyError::MethodNotAllowed(_) => "method_not_allowed",
            ProxyError::PathForbidden => "path_forbidden",
            ProxyError::Unauthorized => "unauthorized",
            ProxyError::RateLimited => "rate_limited",
            ProxyError::QueueFull => "queue_full",
            ProxyError::QueueExpired => "queue_expired",
            ProxyError::UpstreamTimeout => "upstream_timeout",
            ProxyError::Network(_) => "network_error",
            ProxyError::Configuration(_) => "configuration",
            ProxyError::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::NotFound => write!(f, "no upstream matched"),
            ProxyError::MethodNotAllowed(m) => write!(f, "method not allowed: {}", m),
            ProxyError::PathForbidden => write!(f, "path forbidden"),
            ProxyError::Unauthorized => write!(f, "unauthorized"),
            ProxyError::RateLimited => write!(f, "rate limited"),
            ProxyError::QueueFull => write!(f, "admission queue full"),
            ProxyError::QueueExpired => write!(f, "queued request expired"),
            ProxyError::UpstreamTimeout => write!(f, "upstream timeout"),
            ProxyError::Network(msg) => write!(f, "network error: {}", msg),
            ProxyError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            ProxyError::Canceled => write!(f, "request canceled"),
        }
    }
}

impl std::error::Error for ProxyError {}
