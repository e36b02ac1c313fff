use axum::http::{HeaderMap, HeaderValue};
use uuid::Uuid;

/// Header used to correlate a request through logs, upstream calls, and the
/// final response.
pub const TRACE_HEADER: &str = "x-trace-id";

/// Per-request correlation identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceId(String);

impl TraceId {
    /// Reuse an inbound `X-Trace-ID` when the caller supplied one, otherwise
    /// generate a fresh id.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(TRACE_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| TraceId(v.to_string()))
            .unwrap_or_else(TraceId::generate)
    }

    pub fn generate() -> Self {
        TraceId(format!("tr-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Trace ids are generated or validated as header-safe strings; fall back
    /// to a fresh uuid if an inbound value is somehow unrepresentable.
    pub fn header_value(&self) -> HeaderValue {
        HeaderValue::from_str(&self.0)
            .unwrap_or_else(|_| HeaderValue::from_static("tr-invalid"))
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
