//! Retry policy
//!
//! A pure function from (attempt outcome, attempts made) to what happens
//! next. Every platform goes through the same policy, so attempt accounting
//! and backoff never depend on which adapter produced the outcome.

use rand::Rng;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::platforms::PlatformResult;

/// Outcome of one attempt, before the policy is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The adapter ran and classified the platform's answer
    Platform(PlatformResult),
    /// No usable token and retrying cannot help (revoked grant, missing or
    /// corrupt credential)
    Unauthorized(String),
    /// Token refresh failed for a reason that may go away
    RefreshTransient(String),
}

/// What the scheduler does with a sub-job after an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Succeeded(String),
    Retry { delay: Duration, reason: String },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Delay for a rate limit that came without Retry-After
    pub rate_limit_floor: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
            rate_limit_floor: config.rate_limit_floor(),
        }
    }

    /// Upper bound on attempts per record
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after the `attempt`-th (1-based) failed attempt
    ///
    /// `base * 2^(attempt-1)` plus up to 50% jitter, capped at `backoff_max`.
    /// The jitter never reaches the next step, so delays strictly increase
    /// until the cap.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let base_ms = self.backoff_base.as_millis() as f64 * 2f64.powi(exponent);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..0.5);
        let delay_ms = base_ms * (1.0 + jitter);

        let max_ms = self.backoff_max.as_millis() as f64;
        Duration::from_millis(delay_ms.min(max_ms) as u64)
    }

    /// Decide the fate of a sub-job that has made `attempts_made` attempts
    pub fn decide(&self, outcome: AttemptOutcome, attempts_made: u32) -> Decision {
        let exhausted = attempts_made >= self.max_attempts();

        match outcome {
            AttemptOutcome::Platform(PlatformResult::Accepted(external_id)) => {
                Decision::Succeeded(external_id)
            }
            AttemptOutcome::Platform(PlatformResult::RejectedPermanently(reason))
            | AttemptOutcome::Unauthorized(reason) => Decision::Failed(reason),
            AttemptOutcome::Platform(PlatformResult::RateLimited(retry_after)) => {
                let reason = match retry_after {
                    Some(after) => format!("rate limited (retry after {}s)", after.as_secs()),
                    None => "rate limited".to_string(),
                };
                if exhausted {
                    Decision::Failed(reason)
                } else {
                    Decision::Retry {
                        delay: retry_after.unwrap_or(self.rate_limit_floor),
                        reason,
                    }
                }
            }
            AttemptOutcome::Platform(PlatformResult::TransientFailure(reason))
            | AttemptOutcome::RefreshTransient(reason) => {
                if exhausted {
                    Decision::Failed(reason)
                } else {
                    Decision::Retry {
                        delay: self.backoff_delay(attempts_made),
                        reason,
                    }
                }
            }
        }
    }
}
