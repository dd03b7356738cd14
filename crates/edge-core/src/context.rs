//! Per-request context.
//!
//! Everything in a `RequestContext` is intrinsically per-request: reading it
//! from inside a render unit makes that unit's output impossible to share
//! across requests. Render units never get the context directly; they reach
//! it through their render scope, which records the access.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Unique request identifier for tracing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    /// Generate a new request ID.
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .unsigned_abs();
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{:x}-{:x}", nanos, seq))
    }

    /// Create from an existing ID string.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request headers, keyed by lower-cased name.
pub type Headers = BTreeMap<String, String>;

/// Request cookies.
pub type Cookies = BTreeMap<String, String>;

/// Query string parameters.
pub type QueryParams = BTreeMap<String, String>;

/// Per-request inputs available to render units through dynamic access.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Unique request identifier.
    pub request_id: Option<RequestId>,
    /// Request path.
    pub path: String,
    /// Query string parameters.
    pub query: QueryParams,
    /// HTTP headers (lower-cased names).
    pub headers: Headers,
    /// Cookies.
    pub cookies: Cookies,
}

impl RequestContext {
    /// Create a new request context.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            request_id: Some(RequestId::generate()),
            path: path.into(),
            ..Default::default()
        }
    }

    /// A context with no request behind it.
    ///
    /// Used for background revalidation, which runs after the request that
    /// triggered it has been answered.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Add a cookie.
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    /// Add a query parameter.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Get a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    /// Get a cookie value by name.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(|s| s.as_str())
    }

    /// Get a query parameter by name.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(|s| s.as_str())
    }

    /// Whether this context belongs to a live request.
    pub fn is_detached(&self) -> bool {
        self.request_id.is_none()
    }
}
