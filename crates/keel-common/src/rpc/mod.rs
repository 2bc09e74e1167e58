//! The contract between a piped agent and the control plane.
//!
//! Requests and responses are plain serde records sent as JSON. Failures carry
//! an [`ApiCode`] whose names follow the gRPC status codes so both sides agree
//! on which errors are worth retrying.
mod messages;
mod service;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use messages::*;
pub use service::PipedService;

/// Header carrying the piped token on every call.
pub const AUTHORIZATION_HEADER: &str = "authorization";
pub const TOKEN_PREFIX: &str = "Bearer ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiCode {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    PermissionDenied,
    FailedPrecondition,
    Unauthenticated,
    Unavailable,
    DeadlineExceeded,
    Internal,
}

impl ApiCode {
    /// Codes that indicate a transient failure.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ApiCode::Internal | ApiCode::Unavailable | ApiCode::DeadlineExceeded
        )
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ApiCode::NotFound => 404,
            ApiCode::AlreadyExists => 409,
            ApiCode::InvalidArgument => 400,
            ApiCode::PermissionDenied => 403,
            ApiCode::FailedPrecondition => 412,
            ApiCode::Unauthenticated => 401,
            ApiCode::Unavailable => 503,
            ApiCode::DeadlineExceeded => 504,
            ApiCode::Internal => 500,
        }
    }

    pub fn from_http_status(status: u16) -> Self {
        match status {
            404 => ApiCode::NotFound,
            409 => ApiCode::AlreadyExists,
            400 => ApiCode::InvalidArgument,
            403 => ApiCode::PermissionDenied,
            412 => ApiCode::FailedPrecondition,
            401 => ApiCode::Unauthenticated,
            502..=503 => ApiCode::Unavailable,
            504 | 408 => ApiCode::DeadlineExceeded,
            _ => ApiCode::Internal,
        }
    }
}

impl fmt::Display for ApiCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApiCode::NotFound => "NOT_FOUND",
            ApiCode::AlreadyExists => "ALREADY_EXISTS",
            ApiCode::InvalidArgument => "INVALID_ARGUMENT",
            ApiCode::PermissionDenied => "PERMISSION_DENIED",
            ApiCode::FailedPrecondition => "FAILED_PRECONDITION",
            ApiCode::Unauthenticated => "UNAUTHENTICATED",
            ApiCode::Unavailable => "UNAVAILABLE",
            ApiCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ApiCode::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: ApiCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ApiCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ApiCode::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ApiCode::AlreadyExists, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ApiCode::InvalidArgument, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ApiCode::PermissionDenied, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(ApiCode::FailedPrecondition, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ApiCode::Unauthenticated, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ApiCode::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ApiCode::Internal, message)
    }

    pub fn is_retriable(&self) -> bool {
        self.code.is_retriable()
    }
}

pub type RpcResult<T> = Result<T, RpcError>;

/// The identity carried by a piped token: `project:piped:key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipedToken {
    pub project_id: String,
    pub piped_id: String,
    pub piped_key: String,
}

impl PipedToken {
    pub fn new(project_id: &str, piped_id: &str, piped_key: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            piped_id: piped_id.to_string(),
            piped_key: piped_key.to_string(),
        }
    }

    pub fn parse(raw: &str) -> RpcResult<Self> {
        let raw = raw.strip_prefix(TOKEN_PREFIX).unwrap_or(raw).trim();
        let mut parts = raw.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(project), Some(piped), Some(key))
                if !project.is_empty() && !piped.is_empty() && !key.is_empty() =>
            {
                Ok(Self::new(project, piped, key))
            }
            _ => Err(RpcError::unauthenticated("malformed piped token")),
        }
    }

    pub fn header_value(&self) -> String {
        format!("{}{}", TOKEN_PREFIX, self)
    }
}

impl fmt::Display for PipedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.project_id, self.piped_id, self.piped_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_codes() {
        assert!(ApiCode::Internal.is_retriable());
        assert!(ApiCode::Unavailable.is_retriable());
        assert!(ApiCode::DeadlineExceeded.is_retriable());
        for code in [
            ApiCode::InvalidArgument,
            ApiCode::PermissionDenied,
            ApiCode::NotFound,
            ApiCode::AlreadyExists,
            ApiCode::FailedPrecondition,
            ApiCode::Unauthenticated,
        ] {
            assert!(!code.is_retriable(), "{code}");
        }
    }

    #[test]
    fn http_status_round_trip() {
        for code in [
            ApiCode::NotFound,
            ApiCode::AlreadyExists,
            ApiCode::InvalidArgument,
            ApiCode::PermissionDenied,
            ApiCode::FailedPrecondition,
            ApiCode::Unauthenticated,
            ApiCode::Unavailable,
            ApiCode::DeadlineExceeded,
            ApiCode::Internal,
        ] {
            assert_eq!(ApiCode::from_http_status(code.http_status()), code);
        }
    }

    #[test]
    fn token_parsing() {
        let token = PipedToken::parse("Bearer proj:piped-1:k:with:colons").unwrap();
        assert_eq!(token.project_id, "proj");
        assert_eq!(token.piped_id, "piped-1");
        assert_eq!(token.piped_key, "k:with:colons");
        assert_eq!(PipedToken::parse(&token.header_value()).unwrap(), token);

        for bad in ["", "proj", "proj:piped", "proj::key", ":piped:key"] {
            let err = PipedToken::parse(bad).unwrap_err();
            assert_eq!(err.code, ApiCode::Unauthenticated);
        }
    }
}
