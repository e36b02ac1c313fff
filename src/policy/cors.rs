use axum::http::{header, HeaderMap, HeaderValue};

const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS, PATCH";
const ALLOW_HEADERS: &str =
    "Content-Type, Authorization, X-Requested-With, X-API-Key, X-Trace-ID";
const MAX_AGE: &str = "86400";

/// Origin allow-list evaluation. A rejected origin gets an empty header set;
/// the pipeline must never emit `Access-Control-*` headers for it.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allowed_origins: Vec<String>,
}

impl CorsPolicy {
    pub fn new(allowed_origins: Vec<String>) -> Self {
        Self { allowed_origins }
    }

    fn is_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == "*" || o == origin)
    }

    /// CORS headers for the given request origin. Allowed origins are echoed
    /// back rather than wildcarded so credentials stay usable.
    pub fn headers_for(&self, origin: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let Some(origin) = origin else {
            return headers;
        };
        if !self.is_allowed(origin) {
            return headers;
        }

        if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        } else {
            return headers;
        }
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOW_METHODS),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOW_HEADERS),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static(MAX_AGE),
        );
        headers
    }
}
