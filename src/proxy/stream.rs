use std::time::Duration;

use anyhow::Result;
use axum::{
    body::Body,
    http::{header, HeaderValue, Method},
    response::Response,
};
use tracing::{info, warn};

use crate::error::{GatewayError, Result as GatewayResult};
use crate::trace::{TraceId, TRACE_HEADER};

/// Unidirectional event-stream passthrough.
///
/// The upstream body is piped to the client verbatim, without buffering and
/// without retry: once bytes may have been sent, a retry is not safe. Only
/// the connect phase has a timeout; stream duration is caller-controlled.
pub struct StreamBridge {
    http: reqwest::Client,
}

impl StreamBridge {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent("edge-gateway/0.1")
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create streaming client: {}", e))?;
        Ok(Self { http })
    }

    pub async fn bridge(
        &self,
        method: Method,
        base: &str,
        query: Option<&str>,
        trace_id: &TraceId,
    ) -> GatewayResult<Response> {
        let url = match query {
            Some(query) => format!("{}?{}", base, query),
            None => base.to_string(),
        };

        info!(trace_id = %trace_id, destination = %url, "Connecting event stream");

        let upstream = self
            .http
            .request(method, &url)
            .header(TRACE_HEADER, trace_id.header_value())
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| {
                warn!(trace_id = %trace_id, destination = %url, error = %e, "Event stream connect failed");
                GatewayError::StreamConnect(e.to_string())
            })?;

        let status = upstream.status();
        info!(trace_id = %trace_id, destination = %url, status = status.as_u16(), "Event stream connected");

        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, HeaderValue::from_static("keep-alive"))
            .header(TRACE_HEADER, trace_id.header_value())
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| GatewayError::StreamConnect(e.to_string()))
    }
}
