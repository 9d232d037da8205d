//! Error types for GraphForge
//!
//! Provides the error taxonomy for the retrieval core with:
//! - Distinct error types for each failure mode (routing, retrieval, synthesis, providers)
//! - Stable machine-readable error codes
//! - HTTP status code mapping
//! - Detail-free caller responses carrying an opaque correlation id

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,

    // Rate limiting (6xxx)
    RateLimited,

    // Graph store errors (7xxx)
    GraphStoreError,
    ConnectionError,
    RetrievalTimeout,

    // External provider errors (8xxx)
    UpstreamError,
    EmbeddingError,
    ProviderTimeout,
    ClassificationFailure,
    DecompositionFailed,
    SynthesisFailure,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 1001,

            ErrorCode::RateLimited => 6001,

            ErrorCode::GraphStoreError => 7001,
            ErrorCode::ConnectionError => 7002,
            ErrorCode::RetrievalTimeout => 7004,

            ErrorCode::UpstreamError => 8001,
            ErrorCode::EmbeddingError => 8002,
            ErrorCode::ProviderTimeout => 8003,
            ErrorCode::ClassificationFailure => 8010,
            ErrorCode::DecompositionFailed => 8011,
            ErrorCode::SynthesisFailure => 8012,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    // Provider throttling
    #[error("Provider rate limit persisted after {retries} retries")]
    RateLimited { retries: u32 },

    // Graph store errors
    #[error("Graph store error: {message}")]
    GraphStore { message: String },

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    #[error("Retrieval timeout in {operation} after {timeout_ms}ms")]
    RetrievalTimeout { operation: String, timeout_ms: u64 },

    // External provider errors
    #[error("Upstream provider returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Embedding service error: {message}")]
    EmbeddingError { message: String },

    #[error("Provider call {operation} timed out after {timeout_ms}ms")]
    ProviderTimeout { operation: String, timeout_ms: u64 },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Route classification failed: {message}")]
    ClassificationFailure { message: String },

    #[error("All {attempted} sub-questions failed")]
    DecompositionFailed { attempted: usize },

    #[error("Synthesis failed: {message}")]
    SynthesisFailed { message: String },

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::GraphStore { .. } => ErrorCode::GraphStoreError,
            AppError::Database(_) => ErrorCode::GraphStoreError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::RetrievalTimeout { .. } => ErrorCode::RetrievalTimeout,
            AppError::Upstream { .. } => ErrorCode::UpstreamError,
            AppError::EmbeddingError { .. } => ErrorCode::EmbeddingError,
            AppError::ProviderTimeout { .. } => ErrorCode::ProviderTimeout,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::ClassificationFailure { .. } => ErrorCode::ClassificationFailure,
            AppError::DecompositionFailed { .. } => ErrorCode::DecompositionFailed,
            AppError::SynthesisFailed { .. } => ErrorCode::SynthesisFailure,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,

            // 500 Internal Server Error
            AppError::Database(_)
            | AppError::GraphStore { .. }
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::Upstream { .. }
            | AppError::EmbeddingError { .. }
            | AppError::HttpClient(_)
            | AppError::ClassificationFailure { .. }
            | AppError::DecompositionFailed { .. }
            | AppError::SynthesisFailed { .. } => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            AppError::RateLimited { .. } | AppError::DatabaseConnection { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // 504 Gateway Timeout
            AppError::RetrievalTimeout { .. } | AppError::ProviderTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
        }
    }

    /// Caller-facing message. Never contains endpoints, credentials or upstream bodies.
    pub fn public_message(&self) -> String {
        match self.code() {
            ErrorCode::ValidationError => match self {
                AppError::Validation { message, .. } => format!("Invalid request: {}", message),
                _ => "Invalid request".to_string(),
            },
            ErrorCode::RateLimited => "The answer service is busy, retry later".to_string(),
            ErrorCode::GraphStoreError | ErrorCode::ConnectionError => {
                "Knowledge graph is unavailable".to_string()
            }
            ErrorCode::RetrievalTimeout => "Evidence retrieval timed out".to_string(),
            ErrorCode::UpstreamError | ErrorCode::EmbeddingError | ErrorCode::ProviderTimeout => {
                "A model provider is unavailable".to_string()
            }
            ErrorCode::ClassificationFailure => "Query could not be routed".to_string(),
            ErrorCode::DecompositionFailed => {
                "No sub-question of the query could be answered".to_string()
            }
            ErrorCode::SynthesisFailure => "Answer generation failed".to_string(),
            ErrorCode::InternalError
            | ErrorCode::ConfigurationError
            | ErrorCode::SerializationError => "Internal error".to_string(),
        }
    }

    /// Whether a provider call that failed with this error may be retried
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Upstream { status, .. } => *status >= 500,
            AppError::HttpClient(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            AppError::ProviderTimeout { .. } | AppError::EmbeddingError { .. } => true,
            _ => false,
        }
    }

    /// Whether this error came from provider throttling
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AppError::RateLimited { .. })
            || matches!(self, AppError::Upstream { status: 429, .. })
    }

    /// Whether this error is a timeout of an external call
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            AppError::RetrievalTimeout { .. } | AppError::ProviderTimeout { .. }
        )
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// A failed request as seen by the caller: a stable kind plus an opaque correlation id
#[derive(Debug, Error)]
#[error("request {correlation_id} failed: {error}")]
pub struct RequestFailure {
    pub correlation_id: Uuid,
    #[source]
    pub error: AppError,
}

impl RequestFailure {
    pub fn new(correlation_id: Uuid, error: AppError) -> Self {
        Self {
            correlation_id,
            error,
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.error.code()
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

fn error_response(error: &AppError, correlation_id: Option<Uuid>) -> Response {
    let status = error.status_code();
    let code = error.code();

    // Full detail stays in the logs
    if error.is_server_error() {
        tracing::error!(
            error = %error,
            code = ?code,
            correlation_id = ?correlation_id,
            status = status.as_u16(),
            "Server error"
        );
    } else if error.is_client_error() {
        tracing::warn!(
            error = %error,
            code = ?code,
            correlation_id = ?correlation_id,
            status = status.as_u16(),
            "Client error"
        );
    }

    let body = ErrorResponse {
        error: ErrorDetails {
            code,
            message: error.public_message(),
            correlation_id,
        },
    };

    (status, Json(body)).into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error_response(&self, None)
    }
}

impl IntoResponse for RequestFailure {
    fn into_response(self) -> Response {
        error_response(&self.error, Some(self.correlation_id))
    }
}
