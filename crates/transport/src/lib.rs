//! Transport abstraction for the remote marketing API
//!
//! Defines the `Transport` trait: issue one HTTP-style call and hand back the
//! status, headers and body text. Non-success statuses are returned as
//! ordinary responses so the governor can classify the error body; only
//! network-level failures surface as `TransportError`.

pub mod http;

pub use http::{HeaderInjection, HttpTransport};
pub use reqwest::Method;
pub use reqwest::header::HeaderMap;

use std::future::Future;
use std::pin::Pin;

/// A single outbound call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    /// JSON body for mutating calls; `None` sends no body.
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Anything other than GET/HEAD consumes write-call score.
    pub fn is_write(&self) -> bool {
        !matches!(self.method, Method::GET | Method::HEAD)
    }
}

/// Raw upstream response. Body is kept as text so an unparseable error body
/// can still be reported verbatim.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network-level failures. HTTP error statuses are not represented here.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("failed to read response body: {0}")]
    Body(String),
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Abstraction over the HTTP client used to reach the remote API.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Transport>`), so tests can swap in a scripted implementation.
pub trait Transport: Send + Sync {
    /// Issue one call. Resolves to the upstream response whatever its status.
    fn send(&self, request: ApiRequest)
    -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + '_>>;
}
