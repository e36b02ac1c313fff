use axum::http::Method;

use crate::config::{SecurityConfig, UpstreamConfig};

/// Exact-path rewrites, applied before any prefix rule.
const LITERAL_REWRITES: [(&str, &str); 1] = [("/api/larges/newone", "/api/test/large")];

/// Event-stream endpoint, relative to the protected prefix.
const STREAM_SUFFIX: &str = "/sse";
/// Socket-upgrade endpoint, relative to the protected prefix.
const SOCKET_SUFFIX: &str = "/ws";
/// Third-party proxy path with traffic collection, relative to the prefix.
const THIRD_PARTY_SUFFIX: &str = "/akamai";
/// Alternate prefix that reaches the third party while bypassing collection.
const BYPASS_PREFIX: &str = "/api2";

/// Upstream target classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetClass {
    /// Buffered request/response forward.
    Rest,
    /// Server-sent events; long-lived, unbuffered.
    Stream,
    /// Bidirectional WebSocket relay.
    Socket,
    /// Alternate backend; `Dispatch::collected` separates the authenticated
    /// collection path from the bypass path.
    ThirdParty,
}

/// Resolved route for one inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub class: TargetClass,
    /// Path to send upstream, after prefix stripping / literal rewrites.
    pub path: String,
    /// Base URL for the target; `None` means the route is unconfigured and
    /// the caller must answer with a 503 configuration error.
    pub base: Option<String>,
    /// Whether the exchange is recorded by the traffic collector.
    pub collected: bool,
}

/// Declarative routing table. Resolution is a pure function of its input:
/// literal rewrites first, then the exact stream/socket paths, then prefix
/// rules from most to least specific, then the default passthrough.
#[derive(Debug, Clone)]
pub struct RouteTable {
    rest_base: Option<String>,
    stream_base: Option<String>,
    third_party_base: Option<String>,
    socket_url: Option<String>,
    protected_prefix: String,
    stream_path: String,
    socket_path: String,
    third_party_prefix: String,
}

impl RouteTable {
    pub fn new(upstreams: &UpstreamConfig, security: &SecurityConfig) -> Self {
        let prefix = security.protected_prefix.clone();
        Self {
            rest_base: upstreams.rest_base.clone(),
            stream_base: upstreams.stream_base.clone(),
            third_party_base: upstreams.third_party_base.clone(),
            socket_url: upstreams.socket_url.clone(),
            stream_path: format!("{}{}", prefix, STREAM_SUFFIX),
            socket_path: format!("{}{}", prefix, SOCKET_SUFFIX),
            third_party_prefix: format!("{}{}", prefix, THIRD_PARTY_SUFFIX),
            protected_prefix: prefix,
        }
    }

    /// Resolve a path and method to a target. No I/O; deterministic for a
    /// given input. The method does not currently influence selection (every
    /// target class accepts all methods; OPTIONS is answered before dispatch)
    /// but is part of the resolution contract.
    pub fn resolve(&self, path: &str, method: &Method) -> Dispatch {
        for (from, to) in LITERAL_REWRITES {
            if path == from {
                return self.resolve(to, method);
            }
        }

        if path == self.stream_path {
            return Dispatch {
                class: TargetClass::Stream,
                path: String::new(),
                base: self.stream_base.clone(),
                collected: false,
            };
        }

        if path == self.socket_path {
            return Dispatch {
                class: TargetClass::Socket,
                path: String::new(),
                base: self.socket_url.clone(),
                collected: false,
            };
        }

        if let Some(rest) = strip_prefix(path, &self.third_party_prefix) {
            return Dispatch {
                class: TargetClass::ThirdParty,
                path: rest,
                base: self.third_party_base.clone(),
                collected: true,
            };
        }

        if let Some(rest) = strip_prefix(path, BYPASS_PREFIX) {
            return Dispatch {
                class: TargetClass::ThirdParty,
                path: rest,
                base: self.third_party_base.clone(),
                collected: false,
            };
        }

        if let Some(rest) = strip_prefix(path, &self.protected_prefix) {
            return Dispatch {
                class: TargetClass::Rest,
                path: rest,
                base: self.rest_base.clone(),
                collected: true,
            };
        }

        // Default: forward to the REST target with the path unchanged.
        Dispatch {
            class: TargetClass::Rest,
            path: path.to_string(),
            base: self.rest_base.clone(),
            collected: false,
        }
    }
}

/// Strip `prefix` as a whole path segment; `/api2` matches `/api2` and
/// `/api2/x` but not `/api2x`. The stripped remainder always starts with `/`.
fn strip_prefix(path: &str, prefix: &str) -> Option<String> {
    if path == prefix {
        return Some("/".to_string());
    }
    path.strip_prefix(prefix)
        .filter(|rest| rest.starts_with('/'))
        .map(|rest| rest.to_string())
}
