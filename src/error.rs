use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Value};
use thiserror::Error;

use crate::storage::StorageError;
use crate::tenant::TenantId;

/// Errors raised by the tenancy layer itself. Domain failures from the storage
/// engine travel through [`TenancyError::Storage`] untouched.
#[derive(Debug, Error)]
pub enum TenancyError {
    #[error("No tenant could be resolved for '{0}'")]
    TenantNotFound(String),

    #[error("Requested tenant '{asserted}' does not match resolved tenant '{resolved}'")]
    TenantMismatch { asserted: TenantId, resolved: TenantId },

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Invalid tenant id: {0:?}")]
    InvalidTenantId(String),

    #[error("No connection available for tenant '{tenant}' within {waited:?}")]
    PoolTimeout { tenant: TenantId, waited: Duration },

    #[error("Failed to pin schema for tenant '{tenant}': {reason}")]
    SchemaPinFailed { tenant: TenantId, reason: String },

    #[error("Operation '{operation}' for tenant '{tenant}' exceeded {timeout:?}")]
    OperationTimeout {
        operation: &'static str,
        tenant: TenantId,
        timeout: Duration,
    },

    #[error("Connection source error: {0}")]
    Connection(String),

    #[error("Organization directory error: {0}")]
    Directory(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl TenancyError {
    /// Resolution and authorization failures, as opposed to internal faults
    pub fn is_authorization_failure(&self) -> bool {
        matches!(
            self,
            TenancyError::TenantNotFound(_)
                | TenancyError::TenantMismatch { .. }
                | TenancyError::Unauthenticated(_)
                | TenancyError::InvalidTenantId(_)
        )
    }
}

/// HTTP API error with appropriate status codes and client-friendly messages
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    InternalServerError(String),
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::Unauthorized(_) => 401,
            ApiError::Forbidden(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) => 409,
            ApiError::InternalServerError(_) => 500,
            ApiError::ServiceUnavailable(_) => 503,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::InternalServerError(msg)
            | ApiError::ServiceUnavailable(msg) => msg,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "error": true,
            "message": self.message(),
            "code": self.error_code()
        })
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        ApiError::Unauthorized(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        ApiError::InternalServerError(message.into())
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        ApiError::ServiceUnavailable(message.into())
    }
}

impl From<TenancyError> for ApiError {
    fn from(err: TenancyError) -> Self {
        match err {
            TenancyError::TenantNotFound(_) => ApiError::not_found("No organization found for this user"),
            TenancyError::TenantMismatch { .. } => {
                ApiError::forbidden("Operation not permitted for the requested organization")
            }
            TenancyError::Unauthenticated(msg) => ApiError::unauthorized(msg),
            TenancyError::InvalidTenantId(id) => ApiError::bad_request(format!("Invalid organization id: {}", id)),
            TenancyError::PoolTimeout { .. } => ApiError::service_unavailable("Database temporarily unavailable"),
            TenancyError::OperationTimeout { .. } => ApiError::service_unavailable("Request processing timed out"),
            TenancyError::SchemaPinFailed { tenant, reason } => {
                tracing::error!("Schema pin failed for tenant '{}': {}", tenant, reason);
                ApiError::internal_server_error("Database error occurred")
            }
            TenancyError::Connection(msg) => {
                tracing::error!("Connection source error: {}", msg);
                ApiError::service_unavailable("Database temporarily unavailable")
            }
            TenancyError::Directory(msg) => {
                tracing::error!("Organization directory error: {}", msg);
                ApiError::internal_server_error("An error occurred while processing your request")
            }
            TenancyError::Storage(err) => err.into(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => ApiError::not_found(msg),
            StorageError::ConstraintViolation(msg) => ApiError::Conflict(msg),
            StorageError::InvalidFilter(msg) => ApiError::bad_request(msg),
            StorageError::SchemaNotPinned => {
                tracing::error!("Storage operation attempted on an unpinned connection");
                ApiError::internal_server_error("Database error occurred")
            }
            StorageError::Backend(sqlx_err) => {
                // Log the real error but return generic message
                tracing::error!("SQLx error: {}", sqlx_err);
                ApiError::internal_server_error("Database error occurred")
            }
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_json())).into_response()
    }
}
