//! Error kinds surfaced to API callers.

use thiserror::Error;

/// Caller-facing error for store and cache operations. Variants map onto the
/// HTTP statuses the outer API layer emits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("invalid body content: {0}")]
    InvalidBodyContent(String),
    #[error("missing required: {0}")]
    MissingRequired(String),
    /// Empty result carrying HTTP 204, e.g. a post-delete lookup miss.
    #[error("no content")]
    NoContent,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::InvalidBodyContent(_) => 422,
            ApiError::MissingRequired(_) => 422,
            ApiError::NoContent => 204,
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) => 409,
            ApiError::Unauthorized(_) => 401,
            ApiError::Forbidden(_) => 403,
            ApiError::Cancelled => 499,
            ApiError::Internal(_) => 500,
        }
    }

    /// Map an upstream HTTP status onto the matching passthrough variant.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => ApiError::Unauthorized(message),
            403 => ApiError::Forbidden(message),
            404 => ApiError::NotFound(message),
            409 => ApiError::Conflict(message),
            _ => ApiError::Internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(ApiError::NoContent.status_code(), 204);
        assert_eq!(ApiError::InvalidBodyContent("x".into()).status_code(), 422);
        assert_eq!(ApiError::from_status(409, "rv mismatch"), ApiError::Conflict("rv mismatch".into()));
        assert_eq!(ApiError::from_status(500, "boom").status_code(), 500);
    }
}
