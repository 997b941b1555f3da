use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Ocr(#[from] OcrError),

    #[error("{0}")]
    Llm(#[from] LlmError),
}

/// Rasterizer errors
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Failed to load PDFium library: {message}")]
    PdfiumUnavailable { message: String },

    #[error("Malformed document: {reason}")]
    MalformedDocument { reason: String },

    #[error("Failed to render page {page}: {message}")]
    Render { page: usize, message: String },

    #[error("Rasterizer task failed: {message}")]
    Task { message: String },
}

impl ProcessingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessingError::MalformedDocument { .. } | ProcessingError::Render { .. } => {
                ErrorKind::MalformedDocument
            }
            // No pages can be produced, so no text can be either
            ProcessingError::PdfiumUnavailable { .. } | ProcessingError::Task { .. } => {
                ErrorKind::ExtractionUnavailable
            }
        }
    }
}

/// OCR provider errors
#[derive(Error, Debug)]
pub enum OcrError {
    #[error("{provider} rejected credentials: {message}")]
    Auth { provider: String, message: String },

    #[error("Connection to {provider} failed")]
    Network {
        provider: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} rate limit exceeded")]
    RateLimited { provider: String },

    #[error("{provider} did not answer within {secs}s")]
    Timeout { provider: String, secs: u64 },

    #[error("{provider} request failed (status {status}): {message}")]
    Provider {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{provider} is not available: {message}")]
    Unavailable { provider: String, message: String },

    #[error("Invalid response from {provider}: {message}")]
    InvalidResponse { provider: String, message: String },

    #[error("Page {page} could not be recognized: {message}")]
    Page { page: usize, message: String },

    #[error("No OCR provider succeeded ({summary})")]
    Exhausted { summary: String },
}

impl OcrError {
    /// Whether the failure concerns the provider as a whole rather than one page.
    /// Provider-level failures trigger the fallback provider.
    pub fn is_provider_level(&self) -> bool {
        !matches!(self, OcrError::Page { .. })
    }
}

/// Language-model client errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Connection failed to language model at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Language model did not answer within {secs}s")]
    Timeout { secs: u64 },

    #[error("Language model rate limit exceeded")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Language model server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("Language model rejected credentials (status {status})")]
    Unauthorized { status: u16, message: String },

    #[error("Language model rejected the request (status {status}): {message}")]
    BadRequest { status: u16, message: String },

    #[error("Invalid response from language model: {message}")]
    InvalidResponse { message: String },
}

impl LlmError {
    /// Transient failures are retried with backoff; everything else fails immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Connection { .. }
                | LlmError::Timeout { .. }
                | LlmError::RateLimited { .. }
                | LlmError::Server { .. }
        )
    }
}

/// Field extraction failures after retries are spent
#[derive(Error, Debug)]
pub enum FieldError {
    #[error("Model answer could not be parsed after {attempts} attempt(s): {message}")]
    Parse { attempts: u32, message: String },

    #[error("Language model call failed after {attempts} attempt(s)")]
    Provider {
        attempts: u32,
        #[source]
        source: LlmError,
    },
}

impl FieldError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FieldError::Parse { .. } => ErrorKind::ExtractionParseError,
            FieldError::Provider { .. } => ErrorKind::AiProviderError,
        }
    }
}

/// Persistence sink errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to access store at {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed store contents")]
    Csv(#[from] csv::Error),

    #[error("Row rejected: {field} {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("Store lock poisoned by a panicked writer")]
    LockPoisoned,

    #[error("Store task failed: {message}")]
    Task { message: String },
}

/// Stream client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Server answered {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Stream read failed: {message}")]
    Transport { message: String },

    #[error("Malformed stream line: {line}")]
    Malformed {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Stream ended without a complete event")]
    IncompleteStream,

    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },
}

/// Failure classes a single job can end in.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    MalformedDocument,
    ExtractionUnavailable,
    ExtractionParseError,
    AiProviderError,
    PersistenceError,
}

/// API error response (matches Axum's built-in JsonRejection format)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Ocr(_) | ServiceError::Llm(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::Config { .. } => "config_error",
            ServiceError::Ocr(_) => "ocr_error",
            ServiceError::Llm(_) => "llm_error",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code().to_string();

        let response = ErrorResponse {
            message: format_error_chain(&self),
            code: Some(code),
        };

        (status, Json(response)).into_response()
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Render an error and its sources as a single `outer: inner: root` line.
pub fn format_error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
