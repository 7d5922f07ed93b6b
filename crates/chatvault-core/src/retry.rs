//! Retry policy for failed OCR attempts.
//!
//! Attempts are counted per document. A failure increments the count; once it
//! reaches `max_attempts` the document is terminally failed, otherwise it is
//! requeued with a linear backoff of `attempts * backoff_step`.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::defaults::{OCR_MAX_ATTEMPTS, OCR_RETRY_BACKOFF_SECS};

/// Outcome of applying the retry policy to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue; eligible again at `next_attempt_at`.
    Retry {
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Attempts exhausted; terminal failure.
    GiveUp { attempts: i32 },
}

impl RetryDecision {
    pub fn attempts(&self) -> i32 {
        match self {
            RetryDecision::Retry { attempts, .. } | RetryDecision::GiveUp { attempts } => *attempts,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, RetryDecision::GiveUp { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: OCR_MAX_ATTEMPTS,
            backoff_step: Duration::from_secs(OCR_RETRY_BACKOFF_SECS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: i32, backoff_step: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_step,
        }
    }

    /// Decide what happens after a failure, given the attempts recorded before it.
    pub fn decide(&self, prior_attempts: i32, now: DateTime<Utc>) -> RetryDecision {
        let attempts = prior_attempts.max(0) + 1;
        if attempts >= self.max_attempts {
            return RetryDecision::GiveUp { attempts };
        }
        let step = chrono::Duration::from_std(self.backoff_step)
            .unwrap_or_else(|_| chrono::Duration::seconds(OCR_RETRY_BACKOFF_SECS as i64));
        // Saturates instead of overflowing the calendar range.
        let next_attempt_at = step
            .checked_mul(attempts)
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        RetryDecision::Retry {
            attempts,
            next_attempt_at,
        }
    }
}
