//! Typed failures surfaced by the governor
//!
//! Every failed remote call is turned into exactly one `ApiError` at the
//! classification boundary. Nothing above that boundary sees a raw status.

use std::time::Duration;

/// Diagnostic fields carried over from the remote error body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteDetail {
    pub http_status: Option<u16>,
    pub code: Option<i64>,
    pub subcode: Option<i64>,
    pub error_type: Option<String>,
}

impl RemoteDetail {
    pub fn status(http_status: u16) -> Self {
        Self {
            http_status: Some(http_status),
            ..Self::default()
        }
    }
}

/// Classification category, used for retry eligibility, logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    RateLimit,
    Auth,
    Permission,
    Validation,
    ApplicationLimit,
    UserLimit,
    Processing,
}

impl FailureKind {
    /// Stable label for logs, metrics and error bodies.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::RateLimit => "rate_limit",
            FailureKind::Auth => "auth",
            FailureKind::Permission => "permission",
            FailureKind::Validation => "validation",
            FailureKind::ApplicationLimit => "application_limit",
            FailureKind::UserLimit => "user_limit",
            FailureKind::Processing => "processing",
        }
    }
}

/// A classified failure. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    /// Quota or local block; `retry_after` says how long to back off.
    #[error("rate limited: {message} (retry after {}ms)", .retry_after.as_millis())]
    RateLimit {
        message: String,
        retry_after: Duration,
        detail: RemoteDetail,
    },

    #[error("authentication failed: {message}")]
    Auth {
        message: String,
        detail: RemoteDetail,
    },

    #[error("permission denied: {message}")]
    Permission {
        message: String,
        detail: RemoteDetail,
    },

    #[error("invalid request: {message}")]
    Validation {
        message: String,
        detail: RemoteDetail,
    },

    #[error("application request limit reached: {message}")]
    ApplicationLimit {
        message: String,
        detail: RemoteDetail,
    },

    #[error("user request limit reached: {message}")]
    UserLimit {
        message: String,
        detail: RemoteDetail,
    },

    /// Anything else. Unparseable bodies and unknown remote codes land here.
    #[error("request processing failed: {message}")]
    Processing {
        message: String,
        detail: RemoteDetail,
    },

    /// Terminal failure after a retryable kind used up its budget.
    #[error("{context} failed after {retries} retries: {source}")]
    RetriesExhausted {
        context: String,
        retries: u32,
        source: Box<ApiError>,
    },
}

impl ApiError {
    /// Local rate-limit rejection (no remote detail).
    pub fn rate_limited(message: impl Into<String>, retry_after: Duration) -> Self {
        ApiError::RateLimit {
            message: message.into(),
            retry_after,
            detail: RemoteDetail::default(),
        }
    }

    /// Generic processing failure with an optional HTTP status.
    pub fn processing(message: impl Into<String>, http_status: Option<u16>) -> Self {
        ApiError::Processing {
            message: message.into(),
            detail: RemoteDetail {
                http_status,
                ..RemoteDetail::default()
            },
        }
    }

    /// Failure kind. An exhausted retry reports the kind of its last cause.
    pub fn kind(&self) -> FailureKind {
        match self {
            ApiError::RateLimit { .. } => FailureKind::RateLimit,
            ApiError::Auth { .. } => FailureKind::Auth,
            ApiError::Permission { .. } => FailureKind::Permission,
            ApiError::Validation { .. } => FailureKind::Validation,
            ApiError::ApplicationLimit { .. } => FailureKind::ApplicationLimit,
            ApiError::UserLimit { .. } => FailureKind::UserLimit,
            ApiError::Processing { .. } => FailureKind::Processing,
            ApiError::RetriesExhausted { source, .. } => source.kind(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::RateLimit { message, .. }
            | ApiError::Auth { message, .. }
            | ApiError::Permission { message, .. }
            | ApiError::Validation { message, .. }
            | ApiError::ApplicationLimit { message, .. }
            | ApiError::UserLimit { message, .. }
            | ApiError::Processing { message, .. } => message,
            ApiError::RetriesExhausted { source, .. } => source.message(),
        }
    }

    pub fn detail(&self) -> &RemoteDetail {
        match self {
            ApiError::RateLimit { detail, .. }
            | ApiError::Auth { detail, .. }
            | ApiError::Permission { detail, .. }
            | ApiError::Validation { detail, .. }
            | ApiError::ApplicationLimit { detail, .. }
            | ApiError::UserLimit { detail, .. }
            | ApiError::Processing { detail, .. } => detail,
            ApiError::RetriesExhausted { source, .. } => source.detail(),
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        self.detail().http_status
    }

    /// Explicit wait carried by the rate-limit family.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimit { retry_after, .. } => Some(*retry_after),
            ApiError::RetriesExhausted { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, ApiError::RetriesExhausted { .. })
    }
}

/// Result alias for governor operations.
pub type Result<T> = std::result::Result<T, ApiError>;
