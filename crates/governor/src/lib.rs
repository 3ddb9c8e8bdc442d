//! API access governor for the rate-limited marketing API
//!
//! Sits between callers and the remote API so that many ad accounts can share
//! one process without blowing the upstream throughput budget:
//!
//! 1. `RateLimiter` admits or rejects each call against a per-account score
//!    that halves every decay period; overflowing the budget blocks the
//!    account for a penalty window.
//! 2. `classify_response` turns a failed response into a typed `ApiError`.
//! 3. `RetryPolicy::retry_with_backoff` retries the retryable kinds up to
//!    their per-kind budget, honouring an explicit retry-after when present.
//! 4. `paging` walks cursor-paged collections lazily, collects them up to an
//!    item ceiling, and submits large inputs in throttled batches.
//!
//! `GovernedClient` wires the four together around a `transport::Transport`.

pub mod classify;
pub mod client;
pub mod error;
pub mod metrics;
pub mod paging;
pub mod rate_limit;
pub mod retry;

pub use classify::{RemoteErrorBody, classify_response};
pub use client::GovernedClient;
pub use error::{ApiError, FailureKind, RemoteDetail, Result};
pub use paging::{
    PageCursors, PageParams, PageResult, PageStream, collect_all_pages, create_batches,
    extract_cursor, fetch_all_pages, parse_page, process_batches,
};
pub use rate_limit::{AccountUsage, RateLimitConfig, RateLimiter, RateTier};
pub use retry::{RetryPolicy, retry_with_backoff};
