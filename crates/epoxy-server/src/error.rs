//! Error types for the boot server HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use epoxy_core::host::EntropyError;
use epoxy_core::store::StoreError;
use thiserror::Error;

/// Errors produced by the boot handlers. Each maps to one HTTP status; the
/// conversion is the only recovery the server performs — transient store
/// errors are not retried because the machine re-requests on its next boot
/// cycle.
#[derive(Debug, Error)]
pub enum BootError {
    /// The requested host record does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The request's source IP does not match the host record.
    #[error("Caller cannot access host")]
    CallerCannotAccessHost,

    /// The presented session ID does not match the host record.
    #[error("Given session ID does not match host record")]
    SessionMismatch,

    /// The request itself is malformed.
    #[error("{0}")]
    BadRequest(String),

    /// A server-side dependency failed (store, entropy, registry, URL
    /// parsing).
    #[error("{0}")]
    Internal(String),

    /// The extension backend could not be reached.
    #[error("extension backend request failed: {0}")]
    BadGateway(String),
}

impl BootError {
    /// The HTTP status this error answers with.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::CallerCannotAccessHost | Self::SessionMismatch => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for BootError {
    fn into_response(self) -> Response {
        // Plain-text bodies with a trailing newline, matching what booting
        // firmware and initramfs scripts expect to log.
        (self.status_code(), format!("{self}\n")).into_response()
    }
}

impl From<StoreError> for BootError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::NotFound(err.to_string()),
            StoreError::Backend(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<EntropyError> for BootError {
    fn from(err: EntropyError) -> Self {
        Self::Internal(err.to_string())
    }
}
