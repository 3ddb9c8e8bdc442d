//! Error classification for failed remote responses
//!
//! The remote API reports failures as `{"error": {"message", "type", "code",
//! "error_subcode"}}`. A handful of `(code, subcode)` pairs mean "this ad
//! account is throttled, come back in N minutes" and are mapped to
//! `RateLimit` with a fixed wait. Other codes map to a dedicated kind, and
//! anything unrecognised keeps its remote fields for diagnostics.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{ApiError, RemoteDetail};

/// Throttling `(code, subcode)` pairs and the wait each implies.
const RATE_LIMIT_PAIRS: &[(i64, i64, Duration)] = &[
    // Ads management: too many calls to this ad account
    (17, 2446079, Duration::from_secs(300)),
    // Business use case: ads insights throttled for this ad account
    (80004, 2446079, Duration::from_secs(300)),
    // Too many calls from this ad account, short window
    (613, 1487742, Duration::from_secs(60)),
];

const AUTH_CODE: i64 = 190;
const PERMISSION_CODES: &[i64] = &[10, 200];
const VALIDATION_CODE: i64 = 100;
const APPLICATION_LIMIT_CODE: i64 = 4;
const USER_LIMIT_CODE: i64 = 17;

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: RemoteErrorBody,
}

/// Structured error body returned by the remote API.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct RemoteErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default, rename = "error_subcode", alias = "subcode")]
    pub subcode: Option<i64>,
}

impl RemoteErrorBody {
    /// Parse the `error` object out of a response body, if it has one.
    pub fn parse(body: &str) -> Option<Self> {
        serde_json::from_str::<ErrorEnvelope>(body)
            .ok()
            .map(|envelope| envelope.error)
    }
}

/// Classify a non-success response into a typed failure.
///
/// Bodies that do not carry a structured remote error become `Processing`
/// with the raw status and body text.
pub fn classify_response(status: u16, body: &str) -> ApiError {
    match RemoteErrorBody::parse(body) {
        Some(remote) => classify_remote(status, remote),
        None => ApiError::processing(format!("HTTP {status}: {}", body.trim()), Some(status)),
    }
}

/// Classify a parsed remote error body.
pub fn classify_remote(status: u16, remote: RemoteErrorBody) -> ApiError {
    let message = remote
        .message
        .clone()
        .unwrap_or_else(|| format!("remote error (HTTP {status})"));
    let detail = RemoteDetail {
        http_status: Some(status),
        code: remote.code,
        subcode: remote.subcode,
        error_type: remote.error_type,
    };

    if let (Some(code), Some(subcode)) = (detail.code, detail.subcode)
        && let Some((_, _, wait)) = RATE_LIMIT_PAIRS
            .iter()
            .find(|(c, s, _)| *c == code && *s == subcode)
    {
        return ApiError::RateLimit {
            message,
            retry_after: *wait,
            detail,
        };
    }

    match detail.code {
        Some(AUTH_CODE) => ApiError::Auth { message, detail },
        Some(code) if PERMISSION_CODES.contains(&code) => ApiError::Permission { message, detail },
        Some(VALIDATION_CODE) => ApiError::Validation { message, detail },
        Some(APPLICATION_LIMIT_CODE) => ApiError::ApplicationLimit { message, detail },
        Some(USER_LIMIT_CODE) => ApiError::UserLimit { message, detail },
        _ => ApiError::Processing { message, detail },
    }
}
