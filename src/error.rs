use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the proxy router
#[derive(Error, Debug)]
pub enum RouterError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration has not been loaded yet")]
    ConfigNotLoaded,

    #[error("Failed to read {path}: {source}")]
    ConfigFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Listener errors
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    // Forwarding errors
    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Tunnel error: {0}")]
    TunnelError(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    // Exclusive queue errors
    #[error("Exclusive queue is closed")]
    QueueClosed,

    #[error("Exclusive task panicked: {0}")]
    TaskPanicked(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for proxy router operations
pub type Result<T> = std::result::Result<T, RouterError>;

impl RouterError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            RouterError::InvalidConfig(_)
            | RouterError::ConfigFile { .. }
            | RouterError::Json(_)
            | RouterError::InvalidRequest(_)
            | RouterError::InvalidProxyAddress(_)
            | RouterError::UnsupportedProtocol(_) => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            RouterError::Unauthorized => StatusCode::UNAUTHORIZED,

            // 502 Bad Gateway
            RouterError::ProxyConnectionFailed(_) | RouterError::TunnelError(_) => {
                StatusCode::BAD_GATEWAY
            }

            // 503 Service Unavailable
            RouterError::ConfigNotLoaded | RouterError::QueueClosed => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // 500 Internal Server Error
            RouterError::Bind { .. }
            | RouterError::Tls(_)
            | RouterError::TaskPanicked(_)
            | RouterError::Io(_)
            | RouterError::Http(_)
            | RouterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Implement IntoResponse for API error responses
impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for RouterError {
    fn from(err: hyper::Error) -> Self {
        RouterError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for RouterError {
    fn from(err: url::ParseError) -> Self {
        RouterError::InvalidProxyAddress(err.to_string())
    }
}
