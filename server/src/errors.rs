use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::blob::BlobError;
use crate::store::StoreError;
use crate::tokens::TokenError;

/// The error taxonomy every core operation reports to its caller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppError {
    /// Malformed or missing input
    #[error("validation failed: {0}")]
    Validation(String),
    /// A record with the same natural key already exists
    #[error("conflict: {0}")]
    Conflict(String),
    /// A referenced entity is absent
    #[error("not found: {0}")]
    NotFound(String),
    /// Bad credential, or an expired, invalid or reused token
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// An external store or blob call failed, including timeouts
    #[error("upstream failure: {0}")]
    Upstream(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    /// Short machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::Upstream(_) => "upstream",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Validation(m)
            | Self::Conflict(m)
            | Self::NotFound(m)
            | Self::Unauthorized(m)
            | Self::Upstream(m) => m,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(m) => AppError::Conflict(m),
            StoreError::NotFound(m) => AppError::NotFound(m),
            StoreError::Backend(m) => AppError::Upstream(format!("record store: {m}")),
        }
    }
}

impl From<BlobError> for AppError {
    fn from(err: BlobError) -> Self {
        AppError::Upstream(format!("blob store: {err}"))
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            // Signing only fails on a broken key, which is our problem and not the caller's
            TokenError::Signing(m) => AppError::Upstream(format!("token signing: {m}")),
            other => AppError::Unauthorized(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    kind: &'a str,
    message: &'a str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = ?self, "Request Error");
        } else {
            tracing::info!(kind = self.kind(), message = self.message(), "Request rejected");
        }

        let body = ErrorBody {
            success: false,
            kind: self.kind(),
            message: self.message(),
        };

        (status, Json(body)).into_response()
    }
}
