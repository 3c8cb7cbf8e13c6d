//! Domain-facing error envelope (spec §7). Infrastructure failures (DB,
//! Docker client construction, migrations) use `anyhow` and bubble to
//! `main`; everything a caller is expected to branch on is a `ServiceError`
//! variant here, mapped to `{status, message, data}` at the boundary and
//! never leaking internals (a DB error becomes "internal error", logged in
//! full at `error` level first).

use serde::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Admission was denied by the Availability Engine or Policy Resolver —
    /// this is a normal outcome, not a bug, and carries a user-facing reason.
    #[error("{0}")]
    Denied(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    fn status(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Forbidden(_) => "forbidden",
            ServiceError::InvalidRequest(_) => "invalid_request",
            ServiceError::Denied(_) => "denied",
            ServiceError::Internal(_) => "internal_error",
        }
    }

    /// Message safe to return to a caller. Internal errors are logged with
    /// full detail and replaced with a generic message here.
    fn public_message(&self) -> String {
        match self {
            ServiceError::Internal(err) => {
                error!(target: "audit", error = %err, "internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub status: String,
    pub message: String,
}

impl From<&ServiceError> for ErrorEnvelope {
    fn from(err: &ServiceError) -> Self {
        ErrorEnvelope {
            status: err.status().to_string(),
            message: err.public_message(),
        }
    }
}

/// `{status: "ok"|..., message, data}` wrapper every Reservation Service
/// operation returns, per spec §7.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub status: String,
    pub message: String,
    pub data: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Envelope {
            status: "ok".to_string(),
            message: String::new(),
            data: Some(data),
        }
    }

    pub fn ok_empty() -> Self {
        Envelope {
            status: "ok".to_string(),
            message: String::new(),
            data: None,
        }
    }

    pub fn err(error: &ServiceError) -> Self {
        let envelope = ErrorEnvelope::from(error);
        Envelope {
            status: envelope.status,
            message: envelope.message,
            data: None,
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_error_message_does_not_leak() {
        let err = ServiceError::Internal(anyhow::anyhow!("sqlite: disk I/O error at /secret/path"));
        let envelope = ErrorEnvelope::from(&err);
        assert_eq!(envelope.status, "internal_error");
        assert_eq!(envelope.message, "internal error");
        assert!(!envelope.message.contains("secret"));
    }

    #[test]
    fn denied_message_passes_through() {
        let err = ServiceError::Denied(
            "Not enough resources to make a reservation: cpus. Available: 2 cores cpus.".to_string(),
        );
        let envelope = ErrorEnvelope::from(&err);
        assert_eq!(envelope.status, "denied");
        assert!(envelope.message.contains("cpus"));
    }
}
