//! Per-delivery retry state machine and backoff policy.
//!
//! Every delivery moves through
//! `Pending -> InFlight -> {Retrying, Succeeded, DeadLettered}`, with
//! `Retrying` looping back to `InFlight` once the backoff delay has elapsed.
//! The [`AttemptRecord`] is the only place that decides between retrying and
//! finishing a delivery; callers act on the returned [`Decision`].

use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Outcome, RetryError};
use crate::types::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPhase {
    Pending,
    InFlight,
    Retrying,
    Succeeded,
    DeadLettered,
}

impl DeliveryPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryPhase::Succeeded | DeliveryPhase::DeadLettered)
    }
}

/// What to do after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Wait for the delay, then attempt again.
    Retry(Duration),
    Succeed,
    /// Give up; carries the outcome that caused it.
    DeadLetter(Outcome),
}

/// Decide the next step from an outcome and the number of attempts made so
/// far, including the one that produced `outcome`.
pub fn decide(outcome: Outcome, attempts: u32, policy: &RetryPolicy) -> Decision {
    match outcome {
        Outcome::Success => Decision::Succeed,
        Outcome::ClientRejected | Outcome::MalformedRoute => Decision::DeadLetter(outcome),
        Outcome::ServerTransient | Outcome::Timeout | Outcome::ConnectionFailure => {
            if attempts < policy.max_attempts {
                Decision::Retry(backoff_delay(attempts, policy))
            } else {
                Decision::DeadLetter(outcome)
            }
        }
    }
}

/// Attempt history for one in-flight delivery.
///
/// Created when a delivery is admitted and dropped once a terminal action has
/// been issued. Never shared between deliveries.
#[derive(Debug)]
pub struct AttemptRecord {
    attempts: u32,
    first_attempt_at: Option<Instant>,
    last_outcome: Option<Outcome>,
    phase: DeliveryPhase,
}

impl Default for AttemptRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl AttemptRecord {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            first_attempt_at: None,
            last_outcome: None,
            phase: DeliveryPhase::Pending,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn phase(&self) -> DeliveryPhase {
        self.phase
    }

    pub fn last_outcome(&self) -> Option<Outcome> {
        self.last_outcome
    }

    pub fn first_attempt_at(&self) -> Option<Instant> {
        self.first_attempt_at
    }

    /// Time since the first attempt started.
    pub fn elapsed(&self) -> Duration {
        self.first_attempt_at
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    /// Move to `InFlight` and count the attempt. Returns the attempt number,
    /// starting at 1.
    pub fn begin_attempt(&mut self) -> Result<u32, RetryError> {
        match self.phase {
            DeliveryPhase::Pending | DeliveryPhase::Retrying => {
                self.attempts += 1;
                self.first_attempt_at.get_or_insert_with(Instant::now);
                self.phase = DeliveryPhase::InFlight;
                Ok(self.attempts)
            }
            from => Err(RetryError::InvalidTransition {
                from,
                event: "begin attempt",
            }),
        }
    }

    /// Record the outcome of the in-flight attempt and decide what follows.
    pub fn record(&mut self, outcome: Outcome, policy: &RetryPolicy) -> Result<Decision, RetryError> {
        if self.phase != DeliveryPhase::InFlight {
            return Err(RetryError::InvalidTransition {
                from: self.phase,
                event: "record outcome",
            });
        }

        self.last_outcome = Some(outcome);
        let decision = decide(outcome, self.attempts, policy);
        self.phase = match decision {
            Decision::Retry(_) => DeliveryPhase::Retrying,
            Decision::Succeed => DeliveryPhase::Succeeded,
            Decision::DeadLetter(_) => DeliveryPhase::DeadLettered,
        };
        Ok(decision)
    }
}

/// Delay before retrying after attempt number `attempt` (1-based).
///
/// `min(cap, base * 2^(attempt-1))` plus a random jitter within the policy's
/// bounds, clamped to `cap`.
pub fn backoff_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let exp = exponential_delay(attempt, policy.backoff_base, policy.backoff_cap);
    let jitter = jitter_delay(policy.jitter_min, policy.jitter_max);
    exp.saturating_add(jitter).min(policy.backoff_cap)
}

/// Capped exponential delay without jitter.
pub fn exponential_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << shift).min(cap)
}

/// Uniform random delay in `[min, max]`.
pub fn jitter_delay(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let lo = duration_nanos(min);
    let hi = duration_nanos(max);
    Duration::from_nanos(fastrand::u64(lo..=hi))
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
