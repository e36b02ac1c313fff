use axum::http::{HeaderMap, HeaderValue};

/// Server-only credential header injected for protected routes.
pub const API_KEY_HEADER: &str = "x-api-key";
/// Client-side token that must never reach an upstream.
pub const CLIENT_TOKEN_HEADER: &str = "x-client-token";

const SECURITY_HEADERS: [(&str, &str); 6] = [
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("x-xss-protection", "1; mode=block"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("permissions-policy", "camera=(), microphone=(), geolocation=()"),
    ("strict-transport-security", "max-age=31536000; includeSubDomains"),
];

/// Append the fixed security header set to a response.
pub fn apply_security_headers(headers: &mut HeaderMap) {
    for (name, value) in SECURITY_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }
}

/// Strip client-supplied credentials and, on protected routes, inject the
/// server-held one. The server-only header name is always discarded from the
/// client side, whether or not a credential is configured.
pub fn sanitize_and_inject(headers: &mut HeaderMap, api_key: Option<&str>, protected: bool) {
    headers.remove(API_KEY_HEADER);

    if protected {
        headers.remove(CLIENT_TOKEN_HEADER);
        if let Some(key) = api_key {
            if let Ok(value) = HeaderValue::from_str(key) {
                headers.insert(API_KEY_HEADER, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_headers_are_applied() {
        let mut headers = HeaderMap::new();
        apply_security_headers(&mut headers);
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            headers.get("strict-transport-security").unwrap(),
            "max-age=31536000; includeSubDomains"
        );
        assert_eq!(headers.len(), 6);
    }

    #[test]
    fn client_supplied_credential_is_replaced_on_protected_routes() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("forged"));
        headers.insert(CLIENT_TOKEN_HEADER, HeaderValue::from_static("browser-token"));

        sanitize_and_inject(&mut headers, Some("server-secret"), true);

        assert_eq!(headers.get(API_KEY_HEADER).unwrap(), "server-secret");
        assert!(headers.get(CLIENT_TOKEN_HEADER).is_none());
    }

    #[test]
    fn forged_credential_is_dropped_even_without_configured_key() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("forged"));

        sanitize_and_inject(&mut headers, None, true);
        assert!(headers.get(API_KEY_HEADER).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("forged"));
        sanitize_and_inject(&mut headers, Some("server-secret"), false);
        assert!(headers.get(API_KEY_HEADER).is_none());
    }
}
