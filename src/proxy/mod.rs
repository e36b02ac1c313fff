pub mod client;
pub mod socket;
pub mod stream;

pub use client::{ForwardOutcome, OutboundRequest, ResilientClient};
pub use stream::StreamBridge;

use axum::http::HeaderName;

/// Outcome of a single forward attempt. Kept only for logging and the
/// backoff decision; not persisted beyond the request.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// Any HTTP status counts as success for retry purposes.
    Status(u16),
    /// Connection refused, timeout, DNS failure.
    TransportError(String),
}

#[derive(Debug, Clone)]
pub struct ProxyAttempt {
    pub attempt: u32,
    pub elapsed: std::time::Duration,
    pub outcome: AttemptOutcome,
}

/// Hop-by-hop headers are dropped when copying headers across the proxy
/// boundary; `host` is replaced with computed forwarding headers.
pub fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;

    #[test]
    fn hop_by_hop_headers_are_recognized() {
        assert!(is_hop_by_hop_header(&header::HOST));
        assert!(is_hop_by_hop_header(&header::CONNECTION));
        assert!(is_hop_by_hop_header(&header::TRANSFER_ENCODING));
        assert!(!is_hop_by_hop_header(&header::CONTENT_TYPE));
        assert!(!is_hop_by_hop_header(&header::AUTHORIZATION));
    }
}
