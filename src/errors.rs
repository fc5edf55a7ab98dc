use crate::{backend::BlobError, lock::LockError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Coarse classification used by callers to decide between "surface",
/// "retry later" and "shut down".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Lookup miss. Recovered locally or surfaced as a 404.
    NotFound,
    /// Client-supplied data disagrees with stored state. Never retried.
    Conflict,
    /// Store, cluster or cache unreachable. Retried by background loops.
    Transient,
    /// Correctness can no longer be guaranteed; the process must stop.
    Fatal,
}

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("no such key")]
    NoSuchKey,
    #[error("bucket `{0}` not found")]
    NoSuchBucket(String),
    #[error("no such multipart upload")]
    NoSuchUpload,
    #[error("one or more of the specified parts could not be found or is invalid")]
    InvalidPart,
    #[error("part {part_number} ({size} bytes, etag {etag}) is smaller than the minimum allowed size")]
    PartTooSmall {
        part_number: u32,
        size: i64,
        etag: String,
    },
    #[error("invalid version id")]
    InvalidVersion,
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("restore lifetime of {0} days is outside 1..=30")]
    InvalidRestoreDate(i32),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type MetaResult<T> = Result<T, MetaError>;

impl MetaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetaError::NoSuchKey | MetaError::NoSuchBucket(_) | MetaError::NoSuchUpload => {
                ErrorKind::NotFound
            }
            MetaError::InvalidPart
            | MetaError::PartTooSmall { .. }
            | MetaError::InvalidVersion
            | MetaError::InvalidRestoreDate(_)
            | MetaError::InvalidBucketName { .. }
            | MetaError::InvalidObjectKey
            | MetaError::Conflict(_) => ErrorKind::Conflict,
            MetaError::Sqlx(sqlx::Error::RowNotFound) => ErrorKind::NotFound,
            MetaError::Sqlx(_) | MetaError::Serde(_) | MetaError::Cache(_) => ErrorKind::Transient,
            MetaError::Blob(err) if err.is_not_found() => ErrorKind::NotFound,
            MetaError::Blob(_) => ErrorKind::Transient,
            MetaError::Lock(LockError::NotObtained(_)) => ErrorKind::Conflict,
            MetaError::Lock(LockError::Unavailable(_)) | MetaError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<MetaError> for AppError {
    fn from(err: MetaError) -> Self {
        let status = match err.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::BAD_REQUEST,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_is_a_lookup_miss() {
        let err = MetaError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.is_not_found());
    }

    #[test]
    fn client_mistakes_are_conflicts() {
        let err = MetaError::PartTooSmall {
            part_number: 1,
            size: 10,
            etag: "abc".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(MetaError::InvalidPart.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn lock_service_outage_is_fatal() {
        let err = MetaError::from(LockError::Unavailable("connection refused".into()));
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn app_error_status_follows_kind() {
        assert_eq!(AppError::from(MetaError::NoSuchKey).status, StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::from(MetaError::InvalidPart).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(MetaError::Fatal("boom".into())).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
