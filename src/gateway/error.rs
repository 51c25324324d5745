use std::error::Error as _;
use std::io;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use super::cors_headers;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Missing parameters: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid cookie: {0}")]
    InvalidCookie(&'static str),

    #[error("Requested range not satisfiable for a {total} byte resource")]
    RangeNotSatisfiable { total: u64 },

    #[error("Too many redirects ({hops} hops)")]
    TooManyRedirects { hops: u8 },

    #[error("Video stream error: upstream answered {0}")]
    UpstreamRejected(StatusCode),

    #[error("Video stream error: upstream still failing with {status} after {attempts} attempts")]
    UpstreamUnavailable { status: StatusCode, attempts: u8 },

    #[error("Proxy error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Upstream did not report a usable content length")]
    MissingContentLength,

    #[error("Upstream body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Upstream did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Failed to build response: {0}")]
    Response(#[from] axum::http::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingParameter(_)
            | GatewayError::InvalidUrl(_)
            | GatewayError::InvalidCookie(_) => StatusCode::BAD_REQUEST,
            GatewayError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            GatewayError::TooManyRedirects { .. } => StatusCode::LOOP_DETECTED,
            GatewayError::UpstreamRejected(status) | GatewayError::UpstreamUnavailable { status, .. }
                if status.is_client_error() || status.is_server_error() =>
            {
                *status
            }
            GatewayError::UpstreamRejected(_) | GatewayError::UpstreamUnavailable { .. } => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Transport(_)
            | GatewayError::MissingContentLength
            | GatewayError::BodyTooLarge { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            // Nobody is left to read this one.
            GatewayError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            GatewayError::Response(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(serde_json::json!({
            "success": false,
            "error": self.to_string(),
        }));

        let mut response = (status, cors_headers(), body).into_response();

        if let GatewayError::RangeNotSatisfiable { total } = self {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", total)) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }

        response
    }
}

/// Connection-level failures worth another attempt: connect errors, timeouts, and the socket
/// errors a flaky upstream produces (reset, refused, unreachable).
pub fn is_transient(err: &reqwest::Error) -> bool {
    if err.is_connect() || err.is_timeout() {
        return true;
    }
    io_error_kind(err).is_some_and(|kind| {
        matches!(
            kind,
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::TimedOut
                | io::ErrorKind::HostUnreachable
                | io::ErrorKind::NetworkUnreachable
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
        )
    })
}

/// Resets and aborts seen once bytes are already flowing: the client paused or seeked.
pub fn is_reset(err: &reqwest::Error) -> bool {
    io_error_kind(err).is_some_and(|kind| {
        matches!(
            kind,
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
        )
    })
}

fn io_error_kind(err: &reqwest::Error) -> Option<io::ErrorKind> {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        source = inner.source();
    }
    None
}
