use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, FromRequestParts, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use chrono::Utc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn, Instrument};

use crate::config::Config;
use crate::dispatch::{Dispatch, RouteTable, TargetClass};
use crate::error::GatewayError;
use crate::observability::{ExchangeRecord, TrafficCollector};
use crate::policy::headers::{apply_security_headers, sanitize_and_inject};
use crate::policy::{CorsPolicy, FixedWindowLimiter, RateLimitDecision, RateLimitStore};
use crate::proxy::{socket, OutboundRequest, ResilientClient, StreamBridge};
use crate::trace::TraceId;

const RATELIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
const RATELIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RATELIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Per-request processing stages, recorded on the request span as the
/// pipeline advances. Preflight and rate-limit rejections exit at
/// `PolicyChecked`; misconfigured targets exit at `Dispatched`.
#[derive(Debug, Clone, Copy)]
enum Stage {
    Received,
    Traced,
    PolicyChecked,
    Dispatched,
    Proxied,
    Responded,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Traced => "traced",
            Stage::PolicyChecked => "policy_checked",
            Stage::Dispatched => "dispatched",
            Stage::Proxied => "proxied",
            Stage::Responded => "responded",
        }
    }

    fn advance(self) {
        tracing::Span::current().record("stage", self.as_str());
    }
}

/// The request pipeline: trace assignment, policy enforcement, dispatch, and
/// forwarding, in that order. One instance serves all connections.
pub struct Gateway {
    config: Config,
    routes: RouteTable,
    cors: CorsPolicy,
    limiter: Arc<dyn RateLimitStore>,
    client: ResilientClient,
    streams: StreamBridge,
    collector: Option<TrafficCollector>,
}

impl Gateway {
    /// Must be called inside a Tokio runtime: the collector spawns its worker
    /// task here.
    pub fn new(config: Config) -> Result<Self> {
        let routes = RouteTable::new(&config.upstreams, &config.security);
        let cors = CorsPolicy::new(config.security.allowed_origins.clone());
        let limiter = Arc::new(FixedWindowLimiter::new(
            config.rate_limit.window,
            config.rate_limit.capacity,
            config.rate_limit.sweep_threshold,
        ));
        let client = ResilientClient::new(&config.forwarding)?;
        let streams = StreamBridge::new(config.forwarding.connect_timeout)?;
        let collector = config
            .collector
            .enabled
            .then(|| TrafficCollector::spawn(&config.collector));

        Ok(Self {
            config,
            routes,
            cors,
            limiter,
            client,
            streams,
            collector,
        })
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .fallback(handle)
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self)
    }

    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        info!("Gateway listening on {}", addr);

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("Server error")?;
        Ok(())
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.config
            .security
            .exclude_paths
            .iter()
            .any(|p| path.starts_with(p.as_str()))
    }
}

async fn handle(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let trace_id = TraceId::from_headers(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(|q| q.to_string());

    let span = info_span!(
        "request",
        trace_id = %trace_id,
        method = %method,
        path = %path,
        stage = Stage::Received.as_str(),
    );
    process(gateway, addr, request, trace_id, method, path, query)
        .instrument(span)
        .await
}

async fn process(
    gateway: Arc<Gateway>,
    addr: SocketAddr,
    request: Request,
    trace_id: TraceId,
    method: Method,
    path: String,
    query: Option<String>,
) -> Response {
    let start = Instant::now();
    Stage::Traced.advance();
    let (mut parts, body) = request.into_parts();

    // Excluded paths skip policy entirely: no CORS, no rate limiting, no
    // security headers. Only the trace id is attached.
    if gateway.is_excluded(&path) {
        let dispatch = gateway.routes.resolve(&path, &method);
        return forward_buffered(
            &gateway,
            &parts.headers,
            body,
            &method,
            &path,
            &query,
            &trace_id,
            &addr,
            &dispatch,
            start,
        )
        .await;
    }

    let origin = parts
        .headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let cors_headers = gateway.cors.headers_for(origin.as_deref());

    // Every OPTIONS on a non-excluded path is answered at the edge; it never
    // reaches an upstream and is not counted against the rate limit. A
    // missing origin yields an empty CORS set and is rejected like a
    // disallowed one.
    if method == Method::OPTIONS {
        let response = if cors_headers.is_empty() {
            warn!(
                origin = origin.as_deref().unwrap_or(""),
                "Preflight without an allowed origin"
            );
            GatewayError::CorsRejected.into_response_with(&trace_id)
        } else {
            StatusCode::NO_CONTENT.into_response()
        };
        return finalize(response, &trace_id, &cors_headers, None);
    }

    let identity = client_identity(&parts.headers, &addr);
    let decision = gateway.limiter.check(&identity);
    if !decision.allowed {
        warn!(identity = %identity, "Rate limit exceeded");
        let response = GatewayError::RateLimited {
            retry_after_secs: decision.retry_after_secs(),
        }
        .into_response_with(&trace_id);
        return finalize(response, &trace_id, &cors_headers, Some(&decision));
    }

    Stage::PolicyChecked.advance();

    let dispatch = gateway.routes.resolve(&path, &method);
    Stage::Dispatched.advance();
    info!(
        class = ?dispatch.class,
        upstream_path = %dispatch.path,
        "Dispatching request"
    );

    let response = match dispatch.class {
        TargetClass::Socket => {
            let wants_upgrade = parts
                .headers
                .get(header::UPGRADE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case("websocket"))
                .unwrap_or(false);
            if !wants_upgrade {
                GatewayError::UpgradeRequired.into_response_with(&trace_id)
            } else {
                match dispatch.base {
                    None => GatewayError::Config(unconfigured_message(dispatch.class))
                        .into_response_with(&trace_id),
                    Some(upstream_url) => {
                        match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
                            Ok(ws) => socket::bridge(ws, upstream_url, trace_id.clone()),
                            Err(e) => GatewayError::UpgradeFailed(e.to_string())
                                .into_response_with(&trace_id),
                        }
                    }
                }
            }
        }
        TargetClass::Stream => match &dispatch.base {
            None => GatewayError::Config(unconfigured_message(dispatch.class))
                .into_response_with(&trace_id),
            Some(base) => match gateway
                .streams
                .bridge(method.clone(), base, query.as_deref(), &trace_id)
                .await
            {
                Ok(response) => response,
                Err(e) => e.into_response_with(&trace_id),
            },
        },
        TargetClass::Rest | TargetClass::ThirdParty => {
            forward_buffered(
                &gateway,
                &parts.headers,
                body,
                &method,
                &path,
                &query,
                &trace_id,
                &addr,
                &dispatch,
                start,
            )
            .await
        }
    };

    Stage::Proxied.advance();
    let response = finalize(response, &trace_id, &cors_headers, Some(&decision));
    Stage::Responded.advance();
    response
}

#[allow(clippy::too_many_arguments)]
async fn forward_buffered(
    gateway: &Gateway,
    inbound_headers: &HeaderMap,
    body: axum::body::Body,
    method: &Method,
    path: &str,
    query: &Option<String>,
    trace_id: &TraceId,
    addr: &SocketAddr,
    dispatch: &Dispatch,
    start: Instant,
) -> Response {
    let Some(base) = &dispatch.base else {
        return GatewayError::Config(unconfigured_message(dispatch.class))
            .into_response_with(trace_id);
    };

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            return GatewayError::BadRequest(format!("Failed to read request body: {}", e))
                .into_response_with(trace_id)
        }
    };

    let mut headers = inbound_headers.clone();
    let protected = path.starts_with(&gateway.config.security.protected_prefix);
    sanitize_and_inject(
        &mut headers,
        gateway.config.security.api_key.as_deref(),
        protected,
    );

    let forwarded_host = inbound_headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let mut url = format!("{}{}", base.trim_end_matches('/'), dispatch.path);
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }

    let request_bytes = body.len();
    let outcome = gateway
        .client
        .forward(OutboundRequest {
            method: method.clone(),
            url,
            headers,
            body,
            trace_id: trace_id.clone(),
            forwarded_host,
            original_path: path.to_string(),
        })
        .await;

    if dispatch.collected {
        if let Some(collector) = &gateway.collector {
            collector.record(ExchangeRecord {
                timestamp: Utc::now(),
                trace_id: trace_id.as_str().to_string(),
                client_ip: addr.ip().to_string(),
                method: method.to_string(),
                path: path.to_string(),
                status: outcome.response.status().as_u16(),
                latency_ms: start.elapsed().as_millis() as u64,
                request_bytes,
                response_bytes: outcome.response_bytes,
            });
        }
    }

    outcome.response
}

/// Attach the gateway's own response headers: the fixed security set, the
/// CORS set computed for this origin, rate-limit accounting, and the trace id.
fn finalize(
    mut response: Response,
    trace_id: &TraceId,
    cors_headers: &HeaderMap,
    decision: Option<&RateLimitDecision>,
) -> Response {
    let headers = response.headers_mut();
    apply_security_headers(headers);
    for (name, value) in cors_headers.iter() {
        headers.insert(name, value.clone());
    }
    if let Some(decision) = decision {
        headers.insert(RATELIMIT_LIMIT_HEADER, HeaderValue::from(decision.limit));
        headers.insert(
            RATELIMIT_REMAINING_HEADER,
            HeaderValue::from(decision.remaining),
        );
        // Epoch milliseconds, matching the granularity of the decision itself.
        headers.insert(
            RATELIMIT_RESET_HEADER,
            HeaderValue::from(decision.reset_at_ms),
        );
    }
    headers.insert(crate::trace::TRACE_HEADER, trace_id.header_value());
    response
}

/// Rate-limit identity: first hop of `X-Forwarded-For` when present,
/// otherwise the peer address.
fn client_identity(headers: &HeaderMap, addr: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

fn unconfigured_message(class: TargetClass) -> String {
    match class {
        TargetClass::Rest => {
            "API Gateway URL not configured. Set API_GATEWAY_URL environment variable.".to_string()
        }
        TargetClass::Stream => {
            "SSE Function URL not configured. Set SSE_FUNCTION_URL environment variable."
                .to_string()
        }
        TargetClass::Socket => {
            "Socket URL not configured. Set SOCKET_URL environment variable.".to_string()
        }
        TargetClass::ThirdParty => {
            "Third-party URL not configured. Set THIRD_PARTY_URL environment variable."
                .to_string()
        }
    }
}
