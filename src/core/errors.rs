//! Broker error sum, mapped onto HTTP statuses at the API boundary.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by broker operations.
///
/// Validation, auth, not-found and conflict errors carry a short message that
/// is returned to the caller verbatim. Upstream errors indicate a failure in
/// the container runtime or a downstream container. Internal errors are
/// logged with context and surfaced as a generic 500.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed payload, unknown GPU, invalid name, oversized frame.
    #[error("{0}")]
    BadRequest(String),

    /// Missing or invalid credentials.
    #[error("{0}")]
    Unauthorized(String),

    /// Authenticated but not allowed.
    #[error("{0}")]
    Forbidden(String),

    /// Unknown app, session, home, upload, share or template.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate username, app, store or home directory.
    #[error("{0}")]
    Conflict(String),

    /// Container or remote registry unreachable.
    #[error("{0}")]
    BadGateway(String),

    /// Container did not become ready within the deadline.
    #[error("{0}")]
    GatewayTimeout(String),

    /// Unexpected runtime failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Build a `BadRequest` from anything displayable.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Build an `Unauthorized` from anything displayable.
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Build a `Forbidden` from anything displayable.
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Build a `NotFound` from anything displayable.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Build a `Conflict` from anything displayable.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Build a `BadGateway` from anything displayable.
    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        Self::BadGateway(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.into())
    }
}
