//! Error types and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Error codes surfaced to callers in the X-Proxy-Error header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// The cluster could not be brought up (start command failed or probe timed out)
    ClusterUnavailable,
    /// Network failure while relaying to an already-up backend
    ForwardFailed,
    /// The inbound request could not be read
    BadRequest,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::ClusterUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ForwardFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::ClusterUnavailable => "CLUSTER_UNAVAILABLE",
            ProxyErrorCode::ForwardFailed => "FORWARD_FAILED",
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
        }
    }
}

/// Failure of a single startup operation.
///
/// Cloned out to every caller coalesced into the same operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartupError {
    /// The external start command failed
    #[error("{0}")]
    StartCommand(String),
    /// No probe succeeded before the startup deadline
    #[error("RPC not ready before timeout ({}ms)", .0.as_millis())]
    ProbeTimeout(Duration),
    /// The startup task ended without producing an outcome
    #[error("startup aborted: {0}")]
    Aborted(String),
}

/// Failure of the external start or stop command
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command is empty")]
    Empty,
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Failed(String),
}

/// Failure of a single health probe attempt
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("RPC probe failed with status {0}")]
    Status(u16),
    #[error("RPC probe timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("RPC probe request failed: {0}")]
    Request(String),
}

/// Failure while relaying a request to the backend
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("{0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Render an error with its full source chain, e.g. "client error (Connect): Connection refused"
pub fn describe(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_msg = cause.to_string();
        if !message.contains(&cause_msg) {
            message.push_str(": ");
            message.push_str(&cause_msg);
        }
        source = cause.source();
    }
    message
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}"}}"#,
                self.error.replace('\\', "\\\\").replace('"', "\\\"")
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(message).to_json();

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::ClusterUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::ForwardFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::BadRequest.status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_error_response_json() {
        let json = ErrorResponse::new("RPC not ready before timeout").to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["error"], "RPC not ready before timeout");
        assert_eq!(value.as_object().unwrap().len(), 1);
    }

    #[test]
    fn test_error_response_escapes_quotes() {
        let json = ErrorResponse::new(r#"compose said "no""#).to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["error"], r#"compose said "no""#);
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::ForwardFailed, "connection refused");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "FORWARD_FAILED"
        );
    }

    #[test]
    fn test_startup_error_messages() {
        let timeout = StartupError::ProbeTimeout(Duration::from_millis(1500));
        assert_eq!(timeout.to_string(), "RPC not ready before timeout (1500ms)");

        let failed = StartupError::StartCommand("no such service".to_string());
        assert_eq!(failed.to_string(), "no such service");
    }
}
