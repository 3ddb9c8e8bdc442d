//! Per-account score-based rate limiter
//!
//! Each account carries a usage score. Reads and writes add a fixed cost;
//! the score halves every decay period. A call that would push the score
//! past the tier's maximum blocks the account for the tier's block window,
//! during which every call is rejected regardless of score.
//!
//! Account state is created lazily on first use and lives for the process.
//! The map sits behind an `RwLock` and every account has its own `Mutex`, so
//! one evaluate-then-update sequence never interleaves with another for the
//! same account, even on a multi-threaded runtime.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ApiError, Result};
use crate::metrics::{self, RejectReason};

/// Overall ceiling for `wait_for_capacity`.
pub const MAX_CAPACITY_WAIT: Duration = Duration::from_secs(60);

/// Poll interval while waiting for capacity.
pub const CAPACITY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Access tier of the upstream app, fixed for the limiter's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateTier {
    Development,
    Standard,
}

impl RateTier {
    pub fn label(&self) -> &'static str {
        match self {
            RateTier::Development => "development",
            RateTier::Standard => "standard",
        }
    }
}

impl fmt::Display for RateTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for RateTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(RateTier::Development),
            "standard" => Ok(RateTier::Standard),
            other => Err(format!(
                "unknown rate tier {other:?}, expected \"development\" or \"standard\""
            )),
        }
    }
}

/// Score budget for a tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub max_score: f64,
    pub decay_time: Duration,
    pub block_time: Duration,
    pub read_call_score: f64,
    pub write_call_score: f64,
}

impl RateLimitConfig {
    pub const fn development() -> Self {
        Self {
            max_score: 60.0,
            decay_time: Duration::from_secs(300),
            block_time: Duration::from_secs(300),
            read_call_score: 1.0,
            write_call_score: 3.0,
        }
    }

    pub const fn standard() -> Self {
        Self {
            max_score: 9000.0,
            decay_time: Duration::from_secs(300),
            block_time: Duration::from_secs(60),
            read_call_score: 1.0,
            write_call_score: 3.0,
        }
    }

    pub const fn for_tier(tier: RateTier) -> Self {
        match tier {
            RateTier::Development => Self::development(),
            RateTier::Standard => Self::standard(),
        }
    }

    fn call_score(&self, is_write: bool) -> f64 {
        if is_write {
            self.write_call_score
        } else {
            self.read_call_score
        }
    }
}

/// Mutable limiter state for one account.
#[derive(Debug, Clone)]
struct AccountRateState {
    current_score: f64,
    last_decay: Instant,
    blocked: bool,
    block_until: Instant,
}

impl AccountRateState {
    fn new(now: Instant) -> Self {
        Self {
            current_score: 0.0,
            last_decay: now,
            blocked: false,
            block_until: now,
        }
    }

    /// Apply decay, then clear a block whose window has passed.
    ///
    /// Runs before every admission check and every read so that idle
    /// accounts are never judged on a stale score.
    fn refresh(&mut self, config: &RateLimitConfig, now: Instant) {
        let decay_ms = config.decay_time.as_millis().max(1);
        let periods = now.saturating_duration_since(self.last_decay).as_millis() / decay_ms;
        if periods > 0 {
            let exponent = i32::try_from(periods).unwrap_or(i32::MAX);
            self.current_score *= 0.5f64.powi(exponent);
            self.last_decay = now;
        }

        if self.blocked && now >= self.block_until {
            self.blocked = false;
        }
    }

    fn block_remaining(&self, now: Instant) -> Duration {
        if self.blocked {
            self.block_until.saturating_duration_since(now)
        } else {
            Duration::ZERO
        }
    }

    /// Time until the next decay period boundary.
    fn until_next_decay(&self, config: &RateLimitConfig, now: Instant) -> Duration {
        config
            .decay_time
            .saturating_sub(now.saturating_duration_since(self.last_decay))
    }
}

/// Point-in-time view of one account, decay applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountUsage {
    pub score: f64,
    pub remaining_capacity: f64,
    pub blocked: bool,
    pub block_remaining_ms: u64,
}

/// Registry of per-account rate state.
///
/// Constructed explicitly and shared by reference (`Arc<RateLimiter>`), so
/// isolated instances can coexist in tests or under different server configs.
pub struct RateLimiter {
    tier: RateTier,
    config: RateLimitConfig,
    accounts: RwLock<HashMap<String, Arc<Mutex<AccountRateState>>>>,
}

impl RateLimiter {
    pub fn new(tier: RateTier) -> Self {
        let config = RateLimitConfig::for_tier(tier);
        info!(
            tier = tier.label(),
            max_score = config.max_score,
            block_secs = config.block_time.as_secs(),
            "rate limiter initialized"
        );
        Self {
            tier,
            config,
            accounts: RwLock::new(HashMap::new()),
        }
    }

    pub fn tier(&self) -> RateTier {
        self.tier
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Get or lazily create the state cell for an account.
    async fn account(&self, account_id: &str) -> Arc<Mutex<AccountRateState>> {
        if let Some(state) = self.accounts.read().await.get(account_id) {
            return state.clone();
        }
        self.accounts
            .write()
            .await
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AccountRateState::new(Instant::now()))))
            .clone()
    }

    /// Run `f` against a refreshed view of the account without creating state
    /// for accounts that have never made a call.
    async fn inspect<R>(
        &self,
        account_id: &str,
        f: impl FnOnce(&AccountRateState, Instant) -> R,
    ) -> R {
        let existing = self.accounts.read().await.get(account_id).cloned();
        let now = Instant::now();
        match existing {
            Some(cell) => {
                let mut state = cell.lock().await;
                state.refresh(&self.config, now);
                f(&*state, now)
            }
            None => f(&AccountRateState::new(now), now),
        }
    }

    /// Admit or reject one intended call for `account_id`.
    ///
    /// On admission the call's score is added to the account. A blocked
    /// account fails with the remaining block time; a call that would
    /// overflow `max_score` blocks the account and fails with the full
    /// block window.
    pub async fn check_rate_limit(&self, account_id: &str, is_write: bool) -> Result<()> {
        let cell = self.account(account_id).await;
        let mut state = cell.lock().await;
        let now = Instant::now();
        state.refresh(&self.config, now);

        if state.blocked {
            let remaining = state.block_remaining(now);
            debug!(
                account_id,
                remaining_ms = remaining.as_millis() as u64,
                "call rejected, account blocked"
            );
            metrics::record_rate_limited(RejectReason::Blocked);
            return Err(ApiError::rate_limited(
                format!("account {account_id} is blocked"),
                remaining,
            ));
        }

        let call_score = self.config.call_score(is_write);
        if state.current_score + call_score > self.config.max_score {
            state.blocked = true;
            state.block_until = now + self.config.block_time;
            warn!(
                account_id,
                score = state.current_score,
                call_score,
                max_score = self.config.max_score,
                block_secs = self.config.block_time.as_secs(),
                "score budget exceeded, blocking account"
            );
            metrics::record_rate_limited(RejectReason::Overflow);
            return Err(ApiError::rate_limited(
                format!(
                    "account {account_id} exceeded score budget ({:.0}/{:.0})",
                    state.current_score + call_score,
                    self.config.max_score
                ),
                self.config.block_time,
            ));
        }

        state.current_score += call_score;
        debug!(
            account_id,
            is_write,
            score = state.current_score,
            "call admitted"
        );
        Ok(())
    }

    /// Wait until `required_score` fits in the account's budget.
    ///
    /// Polls every `CAPACITY_POLL_INTERVAL` for at most `MAX_CAPACITY_WAIT`.
    /// Fails immediately when a pending block outlasts the remaining wait
    /// budget. Does not consume score; follow up with `check_rate_limit`.
    pub async fn wait_for_capacity(&self, account_id: &str, required_score: f64) -> Result<()> {
        let cell = self.account(account_id).await;
        let started = Instant::now();

        loop {
            let waited = started.elapsed();
            let budget_left = MAX_CAPACITY_WAIT.saturating_sub(waited);

            let retry_after = {
                let mut state = cell.lock().await;
                let now = Instant::now();
                state.refresh(&self.config, now);

                if state.blocked {
                    let remaining = state.block_remaining(now);
                    if remaining > budget_left {
                        debug!(
                            account_id,
                            remaining_ms = remaining.as_millis() as u64,
                            "block outlasts wait budget, giving up"
                        );
                        return Err(ApiError::rate_limited(
                            format!("account {account_id} is blocked beyond the wait limit"),
                            remaining,
                        ));
                    }
                    remaining
                } else if state.current_score + required_score <= self.config.max_score {
                    if !waited.is_zero() {
                        debug!(
                            account_id,
                            waited_ms = waited.as_millis() as u64,
                            "capacity available"
                        );
                    }
                    return Ok(());
                } else {
                    state.until_next_decay(&self.config, now)
                }
            };

            if budget_left.is_zero() {
                warn!(
                    account_id,
                    required_score,
                    "timed out waiting for rate limit capacity"
                );
                return Err(ApiError::rate_limited(
                    format!(
                        "timed out after {}s waiting for capacity on account {account_id}",
                        MAX_CAPACITY_WAIT.as_secs()
                    ),
                    retry_after,
                ));
            }

            tokio::time::sleep(CAPACITY_POLL_INTERVAL.min(budget_left)).await;
        }
    }

    pub async fn current_score(&self, account_id: &str) -> f64 {
        self.inspect(account_id, |state, _| state.current_score)
            .await
    }

    pub async fn remaining_capacity(&self, account_id: &str) -> f64 {
        let max = self.config.max_score;
        self.inspect(account_id, |state, _| (max - state.current_score).max(0.0))
            .await
    }

    pub async fn is_account_blocked(&self, account_id: &str) -> bool {
        self.inspect(account_id, |state, _| state.blocked).await
    }

    pub async fn block_time_remaining(&self, account_id: &str) -> Duration {
        self.inspect(account_id, |state, now| state.block_remaining(now))
            .await
    }

    /// All four accessors in one refreshed read.
    pub async fn snapshot(&self, account_id: &str) -> AccountUsage {
        let max = self.config.max_score;
        self.inspect(account_id, |state, now| AccountUsage {
            score: state.current_score,
            remaining_capacity: (max - state.current_score).max(0.0),
            blocked: state.blocked,
            block_remaining_ms: state.block_remaining(now).as_millis() as u64,
        })
        .await
    }

    /// Forget an account's state. Returns whether the account was tracked.
    pub async fn reset_account(&self, account_id: &str) -> bool {
        let removed = self.accounts.write().await.remove(account_id).is_some();
        if removed {
            info!(account_id, "rate limit state reset");
        }
        removed
    }

    /// Number of accounts with tracked state.
    pub async fn tracked_accounts(&self) -> usize {
        self.accounts.read().await.len()
    }
}
