use std::time::{Duration, Instant};

use anyhow::Result;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Method},
    response::Response,
};
use bytes::Bytes;
use tracing::{info, warn};

use crate::config::ForwardingConfig;
use crate::error::GatewayError;
use crate::trace::{TraceId, TRACE_HEADER};

use super::{is_hop_by_hop_header, AttemptOutcome, ProxyAttempt};

const FORWARDED_HOST_HEADER: &str = "x-forwarded-host";
const FORWARDED_PROTO_HEADER: &str = "x-forwarded-proto";
const ORIGINAL_PATH_HEADER: &str = "x-original-path";
const BACKEND_LATENCY_HEADER: &str = "x-backend-latency";

/// Fully prepared outbound call. Headers are the sanitized inbound set;
/// hop-by-hop entries are filtered at build time.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub trace_id: TraceId,
    pub forwarded_host: Option<String>,
    pub original_path: String,
}

/// Final response plus the attempt log for this forward.
pub struct ForwardOutcome {
    pub response: Response,
    pub attempts: Vec<ProxyAttempt>,
    pub response_bytes: usize,
}

/// Forwards buffered requests with a per-attempt timeout and bounded retry.
///
/// Only transport-level failures are retried; any received HTTP status is
/// returned immediately, error statuses included. Total attempts never
/// exceed `max_retries + 1`.
pub struct ResilientClient {
    http: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
    backoff_base: Duration,
}

impl ResilientClient {
    pub fn new(config: &ForwardingConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(20)
            .user_agent("edge-gateway/0.1")
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            http,
            timeout: config.timeout,
            max_retries: config.max_retries,
            backoff_base: config.backoff_base,
        })
    }

    /// Execute the forward. Synthesizes a 503 `Backend Unavailable` response
    /// when every attempt fails at the transport level, so the caller always
    /// gets a response to finalize.
    pub async fn forward(&self, request: OutboundRequest) -> ForwardOutcome {
        let mut attempts = Vec::new();
        let mut last_error = String::new();
        let total_start = Instant::now();

        for attempt in 0..=self.max_retries {
            let attempt_start = Instant::now();
            let result = self.build_attempt(&request).send().await;
            let elapsed = attempt_start.elapsed();

            match result {
                Ok(upstream) => {
                    let status = upstream.status();
                    info!(
                        trace_id = %request.trace_id,
                        attempt = attempt + 1,
                        latency_ms = elapsed.as_millis() as u64,
                        destination = %request.url,
                        status = status.as_u16(),
                        "Proxy attempt completed"
                    );
                    attempts.push(ProxyAttempt {
                        attempt: attempt + 1,
                        elapsed,
                        outcome: AttemptOutcome::Status(status.as_u16()),
                    });

                    let headers = upstream.headers().clone();
                    let body = match upstream.bytes().await {
                        Ok(body) => body,
                        Err(e) => {
                            // Status already received; a body read failure is
                            // not retryable.
                            warn!(
                                trace_id = %request.trace_id,
                                destination = %request.url,
                                error = %e,
                                "Failed to read upstream response body"
                            );
                            let response = GatewayError::Transport(e.to_string())
                                .into_response_with(&request.trace_id);
                            return ForwardOutcome {
                                response,
                                attempts,
                                response_bytes: 0,
                            };
                        }
                    };

                    let response = build_response(
                        status,
                        headers,
                        body.clone(),
                        &request.trace_id,
                        total_start.elapsed(),
                    );
                    return ForwardOutcome {
                        response,
                        attempts,
                        response_bytes: body.len(),
                    };
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        trace_id = %request.trace_id,
                        attempt = attempt + 1,
                        latency_ms = elapsed.as_millis() as u64,
                        destination = %request.url,
                        error = %last_error,
                        "Proxy attempt failed"
                    );
                    attempts.push(ProxyAttempt {
                        attempt: attempt + 1,
                        elapsed,
                        outcome: AttemptOutcome::TransportError(last_error.clone()),
                    });

                    if attempt < self.max_retries {
                        tokio::time::sleep(self.backoff_base * 2u32.pow(attempt)).await;
                    }
                }
            }
        }

        let response =
            GatewayError::Transport(last_error).into_response_with(&request.trace_id);
        ForwardOutcome {
            response,
            attempts,
            response_bytes: 0,
        }
    }

    fn build_attempt(&self, request: &OutboundRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(request.method.clone(), &request.url)
            .timeout(self.timeout);

        for (name, value) in request.headers.iter() {
            if !is_hop_by_hop_header(name) {
                builder = builder.header(name, value);
            }
        }

        if let Some(host) = &request.forwarded_host {
            builder = builder.header(FORWARDED_HOST_HEADER, host);
        }
        builder = builder
            .header(FORWARDED_PROTO_HEADER, "http")
            .header(ORIGINAL_PATH_HEADER, &request.original_path)
            .header(TRACE_HEADER, request.trace_id.header_value());

        // GET/HEAD/OPTIONS never carry a body, whatever the original had.
        if !matches!(
            request.method,
            Method::GET | Method::HEAD | Method::OPTIONS
        ) && !request.body.is_empty()
        {
            builder = builder.body(request.body.clone());
        }

        builder
    }
}

fn build_response(
    status: axum::http::StatusCode,
    upstream_headers: HeaderMap,
    body: Bytes,
    trace_id: &TraceId,
    total_elapsed: Duration,
) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in upstream_headers.iter() {
        if !is_hop_by_hop_header(name) {
            headers.insert(name, value.clone());
        }
    }
    headers.insert(TRACE_HEADER, trace_id.header_value());
    headers.insert(
        BACKEND_LATENCY_HEADER,
        HeaderValue::from(total_elapsed.as_millis() as u64),
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Request,
        http::header,
        routing::{any, get},
        Router,
    };
    use std::net::SocketAddr;

    fn client(max_retries: u32) -> ResilientClient {
        ResilientClient::new(&ForwardingConfig {
            timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            max_retries,
            backoff_base: Duration::from_millis(1),
        })
        .unwrap()
    }

    fn outbound(url: String, method: Method) -> OutboundRequest {
        OutboundRequest {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            trace_id: TraceId::generate(),
            forwarded_host: Some("gateway.example".to_string()),
            original_path: "/api/users".to_string(),
        }
    }

    async fn spawn_upstream(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn unreachable_upstream_exhausts_retries_and_synthesizes_503() {
        let client = client(2);
        let request = outbound("http://127.0.0.1:1/users".to_string(), Method::GET);
        let trace = request.trace_id.clone();

        let outcome = client.forward(request).await;

        assert_eq!(outcome.attempts.len(), 3); // max_retries + 1
        assert!(outcome
            .attempts
            .iter()
            .all(|a| matches!(a.outcome, AttemptOutcome::TransportError(_))));
        assert_eq!(outcome.response.status(), 503);

        let body = axum::body::to_bytes(outcome.response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "Backend Unavailable");
        assert_eq!(body["traceId"], trace.as_str());
    }

    #[tokio::test]
    async fn http_error_status_passes_through_without_retry() {
        let addr = spawn_upstream(Router::new()).await; // no routes: everything 404
        let client = client(2);

        let outcome = client
            .forward(outbound(format!("http://{}/missing", addr), Method::GET))
            .await;

        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.response.status(), 404);
    }

    #[tokio::test]
    async fn success_carries_trace_and_latency_headers() {
        let addr = spawn_upstream(Router::new().route("/users", get(|| async { "ok" }))).await;
        let client = client(2);
        let request = outbound(format!("http://{}/users", addr), Method::GET);
        let trace = request.trace_id.clone();

        let outcome = client.forward(request).await;

        assert_eq!(outcome.response.status(), 200);
        assert_eq!(outcome.response_bytes, 2);
        let headers = outcome.response.headers();
        assert_eq!(headers.get(TRACE_HEADER).unwrap(), trace.as_str());
        assert!(headers.contains_key(BACKEND_LATENCY_HEADER));
    }

    #[tokio::test]
    async fn outbound_headers_are_rewritten() {
        // Echo selected request headers back in the response body.
        let echo = any(|req: Request| async move {
            let pick = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string()
            };
            serde_json::json!({
                "forwarded_host": pick("x-forwarded-host"),
                "forwarded_proto": pick("x-forwarded-proto"),
                "original_path": pick("x-original-path"),
                "trace": pick("x-trace-id"),
                "connection": pick("connection"),
            })
            .to_string()
        });
        let addr = spawn_upstream(Router::new().route("/echo", echo)).await;

        let client = client(0);
        let mut request = outbound(format!("http://{}/echo", addr), Method::GET);
        request
            .headers
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        let trace = request.trace_id.clone();

        let outcome = client.forward(request).await;
        let body = axum::body::to_bytes(outcome.response.into_body(), usize::MAX)
            .await
            .unwrap();
        let seen: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(seen["forwarded_host"], "gateway.example");
        assert_eq!(seen["forwarded_proto"], "http");
        assert_eq!(seen["original_path"], "/api/users");
        assert_eq!(seen["trace"], trace.as_str());
        // hop-by-hop header was not forwarded
        assert_eq!(seen["connection"], "");
    }

    #[tokio::test]
    async fn body_is_omitted_for_get() {
        let echo_len = any(|req: Request| async move {
            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .unwrap();
            body.len().to_string()
        });
        let addr = spawn_upstream(Router::new().route("/len", echo_len)).await;
        let client = client(0);

        let mut request = outbound(format!("http://{}/len", addr), Method::GET);
        request.body = Bytes::from_static(b"should not be sent");
        let outcome = client.forward(request).await;
        let body = axum::body::to_bytes(outcome.response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"0");

        let mut request = outbound(format!("http://{}/len", addr), Method::POST);
        request.body = Bytes::from_static(b"12345");
        let outcome = client.forward(request).await;
        let body = axum::body::to_bytes(outcome.response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"5");
    }
}
