use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::trace::{TraceId, TRACE_HEADER};

/// Gateway error taxonomy.
///
/// Upstream HTTP error statuses are deliberately absent: a response received
/// from an upstream is passed through verbatim, whatever its status.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{0}")]
    Config(String),

    #[error("Unable to reach backend service after multiple attempts")]
    Transport(String),

    #[error("{0}")]
    StreamConnect(String),

    #[error("Rate limit exceeded. Please try again later.")]
    RateLimited { retry_after_secs: u64 },

    #[error("CORS origin not allowed")]
    CorsRejected,

    #[error("Expected WebSocket upgrade request")]
    UpgradeRequired,

    #[error("{0}")]
    UpgradeFailed(String),

    #[error("{0}")]
    BadRequest(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::StreamConnect(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CorsRejected => StatusCode::FORBIDDEN,
            GatewayError::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
            GatewayError::UpgradeFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "Configuration Error",
            GatewayError::Transport(_) => "Backend Unavailable",
            GatewayError::StreamConnect(_) => "SSE Connection Failed",
            GatewayError::RateLimited { .. } => "Too Many Requests",
            GatewayError::CorsRejected => "CORS Rejected",
            GatewayError::UpgradeRequired => "Upgrade Required",
            GatewayError::UpgradeFailed(_) => "WebSocket Upgrade Failed",
            GatewayError::BadRequest(_) => "Bad Request",
        }
    }

    /// Convert into the structured JSON response, carrying the trace id in
    /// both the body and the `X-Trace-ID` header.
    pub fn into_response_with(self, trace_id: &TraceId) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();

        let mut body = json!({
            "error": error_code,
            "message": self.to_string(),
            "traceId": trace_id.as_str(),
        });
        if let GatewayError::Transport(ref details) = self {
            body["details"] = json!(details);
        }

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(TRACE_HEADER, trace_id.header_value());
        if let GatewayError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                headers.insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
