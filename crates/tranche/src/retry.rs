//! Piece aggregation and the retry policy applied to a finished attempt.
//!
//! Piece outcomes are folded into one download status by a first-match scan in
//! ascending index order. A retryable piece makes the whole attempt retryable; the
//! policy then decides between waiting for a backoff, waiting for a network, or giving
//! up on resuming when partial data has no validator.

use std::time::Duration;

use rand::RngExt;

use crate::model::DownloadPiece;
use crate::status::StatusCode;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Consecutive failed attempts after which no further retry is scheduled.
    pub max_retries: u32,
    /// Delay after the first failure. Actual delay = base * 2^(failures - 1) + jitter.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// When true, adds random jitter of [0, base_delay/2).
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(24 * 60 * 60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // 2^attempt is computed with a checked shift so attempts >= 32 saturate.
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp_delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        let capped = exp_delay.min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        // Jitter is limited so the final delay never exceeds `max_delay`.
        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }

    /// Backoff before the next attempt, given the failure counter after this attempt.
    pub fn retry_after(&self, num_failed: u32) -> Duration {
        self.delay_for_attempt(num_failed.saturating_sub(1))
    }

    pub fn decide(&self, num_failed: u32, conditions: RetryConditions) -> RetryDecision {
        if num_failed >= self.max_retries {
            return RetryDecision::Exhausted;
        }

        let status = if !conditions.has_validator && conditions.made_progress {
            StatusCode::CannotResume
        } else if conditions.network_intact {
            StatusCode::WaitingToRetry
        } else {
            StatusCode::WaitingForNetwork
        };
        RetryDecision::Wait(status)
    }
}

/// Facts about the attempt that the retry decision depends on.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryConditions {
    /// The active network is the one the attempt started on, and it is connected.
    pub network_intact: bool,
    /// An `ETag` is on record for the download.
    pub has_validator: bool,
    /// The failing piece had transferred data.
    pub made_progress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Wait(StatusCode),
    /// The failure counter reached the configured maximum.
    Exhausted,
}

/// Result of scanning the pieces of a finished attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregate {
    /// The first piece with a retryable status.
    Retryable {
        index: u32,
        status: StatusCode,
        message: Option<String>,
        made_progress: bool,
    },
    /// A piece status that replaces the download's.
    Replace {
        status: StatusCode,
        message: Option<String>,
    },
    Success,
}

/// Folds piece statuses, in the given (index) order, against the download's status.
///
/// A piece replaces the status if it is an error more severe than `current`, or if
/// it is waiting for network or retry. The first match wins.
pub fn aggregate(current: StatusCode, pieces: &[DownloadPiece]) -> Aggregate {
    for piece in pieces {
        if piece.status.is_retryable() {
            return Aggregate::Retryable {
                index: piece.index,
                status: piece.status,
                message: piece.status_msg.clone(),
                made_progress: piece.cur_bytes > 0,
            };
        }

        let replace = (piece.status.is_error() && piece.status.code() > current.code())
            || piece.status == StatusCode::WaitingForNetwork
            || piece.status == StatusCode::WaitingToRetry;

        if replace {
            return Aggregate::Replace {
                status: piece.status,
                message: piece.status_msg.clone(),
            };
        }
    }

    Aggregate::Success
}
