//! Governor metrics
//!
//! Series recorded through whatever global recorder the host installs:
//!
//! - `governor_rate_limited_total` (counter): label `reason` (`blocked`, `overflow`)
//! - `governor_retries_total` (counter): label `kind`
//! - `governor_failures_total` (counter): label `kind`
//! - `governor_pages_fetched_total` (counter)

/// Why the limiter rejected a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Blocked,
    Overflow,
}

impl RejectReason {
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::Blocked => "blocked",
            RejectReason::Overflow => "overflow",
        }
    }
}

/// Record a call rejected by the local limiter.
pub fn record_rate_limited(reason: RejectReason) {
    metrics::counter!("governor_rate_limited_total", "reason" => reason.label()).increment(1);
}

/// Record one retry about to be attempted for a failure of `kind`.
pub fn record_retry(kind: &'static str) {
    metrics::counter!("governor_retries_total", "kind" => kind).increment(1);
}

/// Record a failure surfaced to the caller, retried or not.
pub fn record_failure(kind: &'static str) {
    metrics::counter!("governor_failures_total", "kind" => kind).increment(1);
}

/// Record one successfully fetched page.
pub fn record_page_fetched() {
    metrics::counter!("governor_pages_fetched_total").increment(1);
}
