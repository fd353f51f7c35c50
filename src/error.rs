//! Error taxonomy and HTTP status mapping for the management API

use hyper::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the registries, the lifecycle controller and the
/// topology reconciler.
#[derive(Debug, Error)]
pub enum Error {
    /// A registry lookup found no matching row
    #[error("{0} not found")]
    NotFound(String),

    /// A uniqueness invariant would be violated
    #[error("{0}")]
    Conflict(String),

    /// The container runtime daemon is unreachable
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// A specific container/volume/network/image operation failed
    #[error("failed to {op}: {message}")]
    RuntimeOperation { op: &'static str, message: String },

    /// The in-container config write exited non-zero or could not run
    #[error("config deployment failed: {0}")]
    ConfigDeployment(String),

    /// Malformed create/update request
    #[error("{0}")]
    Validation(String),

    /// Underlying SQLite failure
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl Error {
    /// Wrap a failed runtime-capability call with the operation that failed
    pub fn runtime(op: &'static str, err: impl std::fmt::Display) -> Self {
        Error::RuntimeOperation {
            op,
            message: err.to_string(),
        }
    }

    /// Get the HTTP status code this error maps to
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::RuntimeOperation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::ConfigDeployment(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable error code for API clients
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict(_) => "CONFLICT",
            Error::RuntimeUnavailable(_) => "RUNTIME_UNAVAILABLE",
            Error::RuntimeOperation { .. } => "RUNTIME_OPERATION_FAILED",
            Error::ConfigDeployment(_) => "CONFIG_DEPLOYMENT_FAILED",
            Error::Validation(_) => "VALIDATION_FAILED",
            Error::Database(_) => "DATABASE_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::NotFound("server x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Conflict("name taken".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::Validation("bad name".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::RuntimeUnavailable("no socket".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::runtime("create container", "boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::ConfigDeployment("exit 1".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(
            Error::runtime("stop container", "busy").code(),
            "RUNTIME_OPERATION_FAILED"
        );
        assert_eq!(
            Error::ConfigDeployment("exit 2".into()).code(),
            "CONFIG_DEPLOYMENT_FAILED"
        );
    }

    #[test]
    fn test_runtime_error_message() {
        let err = Error::runtime("remove volume", "volume is in use");
        assert_eq!(
            err.to_string(),
            "failed to remove volume: volume is in use"
        );
    }
}
