use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the proxylist application
#[derive(Error, Debug)]
pub enum PoolError {
    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database connection failed: {0}")]
    DatabaseConnection(String),

    #[error("Store write failed for {identity}: {reason}")]
    StoreWrite { identity: String, reason: String },

    // Proxy errors
    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Probe failed: {0}")]
    Probe(String),

    // Tunnel errors
    #[error("Tunnel error: {0}")]
    TunnelError(String),

    #[error("CONNECT failed: {0}")]
    ConnectFailed(String),

    // Shutdown
    #[error("Operation cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

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

/// Result type alias for proxylist operations
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            PoolError::InvalidRequest(_)
            | PoolError::InvalidProxyAddress(_)
            | PoolError::UnsupportedProtocol(_)
            | PoolError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 404 Not Found
            PoolError::NotFound(_) => StatusCode::NOT_FOUND,

            // 502 Bad Gateway
            PoolError::ProxyConnectionFailed(_)
            | PoolError::Probe(_)
            | PoolError::TunnelError(_)
            | PoolError::ConnectFailed(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            PoolError::DatabaseConnection(_) | PoolError::Cancelled => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // 500 Internal Server Error
            PoolError::Database(_)
            | PoolError::StoreWrite { .. }
            | PoolError::Io(_)
            | PoolError::Http(_)
            | PoolError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
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

    /// Whether this error is a shutdown signal rather than an ordinary failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PoolError::Cancelled)
    }
}

// Implement IntoResponse for API error responses
impl IntoResponse for PoolError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for PoolError {
    fn from(err: hyper::Error) -> Self {
        PoolError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for PoolError {
    fn from(err: url::ParseError) -> Self {
        PoolError::InvalidConfig(err.to_string())
    }
}
