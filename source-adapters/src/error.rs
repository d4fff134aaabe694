use common::error::AppError;
use common::storage::types::document::SourceKind;
use thiserror::Error;

/// How a source failure should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    /// Bad input. Never retried.
    Validation,
    /// Timeout, connection reset, 5xx, rate limit. Worth retrying.
    Transient,
    /// 404/403/401, robots-blocked, unsupported format. Retrying cannot help.
    Permanent,
}

#[derive(Error, Debug, Clone)]
#[error("{source_kind}: {message}")]
pub struct SourceError {
    pub kind: SourceErrorKind,
    pub source_kind: SourceKind,
    pub message: String,
}

impl SourceError {
    pub fn validation(source_kind: SourceKind, message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Validation,
            source_kind,
            message: message.into(),
        }
    }

    pub fn transient(source_kind: SourceKind, message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Transient,
            source_kind,
            message: message.into(),
        }
    }

    pub fn permanent(source_kind: SourceKind, message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Permanent,
            source_kind,
            message: message.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind == SourceErrorKind::Transient
    }

    /// Error type label carried into `job_failed` telemetry.
    pub fn error_type(&self) -> &'static str {
        match self.kind {
            SourceErrorKind::Validation => "ValidationError",
            SourceErrorKind::Transient => "TransientFetchError",
            SourceErrorKind::Permanent => "PermanentFetchError",
        }
    }
}

impl From<SourceError> for AppError {
    fn from(err: SourceError) -> Self {
        match err.kind {
            SourceErrorKind::Validation => AppError::Validation(err.to_string()),
            _ => AppError::Processing(err.to_string()),
        }
    }
}

/// Classify a transport-level failure from reqwest.
pub fn classify_request_error(source_kind: SourceKind, err: &reqwest::Error) -> SourceError {
    if err.is_timeout() || err.is_connect() {
        return SourceError::transient(source_kind, format!("request failed: {err}"));
    }

    if let Some(status) = err.status() {
        return classify_status(source_kind, status, &err.to_string());
    }

    SourceError::transient(source_kind, format!("request error: {err}"))
}

/// Classify an HTTP status: 429 and 5xx are transient, 401/403/404 are
/// permanent, anything else unexpected is permanent.
pub fn classify_status(
    source_kind: SourceKind,
    status: reqwest::StatusCode,
    detail: &str,
) -> SourceError {
    if status.as_u16() == 429 || status.is_server_error() {
        SourceError::transient(source_kind, format!("HTTP {status}: {detail}"))
    } else {
        SourceError::permanent(source_kind, format!("HTTP {status}: {detail}"))
    }
}
