use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use courier_core::{MessageStatus, Timestamp};
use courier_store::MessageRecord;
use serde::{Deserialize, Serialize};

use crate::reliability::ReliabilityOutcome;

/// Named backoff strategy selected per leg in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// Evenly spaced attempts across the timeout window.
    #[default]
    Constant,
    /// The constant interval doubled per attempt, capped at the remaining window.
    Exponential,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Constant => "constant",
            Self::Exponential => "exponential",
        }
    }

    /// Raw next-attempt time before the monotonic clamp.
    fn schedule(&self, policy: &RetryPolicy, state: &RetryState, now: Timestamp) -> Timestamp {
        let interval = policy.interval_ms();
        let delay = match self {
            Self::Constant => interval,
            Self::Exponential => {
                let factor = 1_u64.checked_shl(state.attempts).unwrap_or(u64::MAX);
                let window_end = state.scheduled_start.saturating_add(policy.timeout_ms());
                interval
                    .saturating_mul(factor)
                    .min(window_end.saturating_sub(now))
            }
        };
        now.saturating_add(delay)
    }
}

impl FromStr for RetryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "constant" => Ok(Self::Constant),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!("unknown retry strategy: {other}")),
        }
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry limits of one leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Length of the retry window measured from the scheduled start.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub max_attempts: u32,
    #[serde(default)]
    pub strategy: RetryStrategy,
}

impl RetryPolicy {
    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// `timeout / max_attempts`, the constant spacing between attempts.
    pub fn interval_ms(&self) -> u64 {
        self.timeout_ms() / u64::from(self.max_attempts.max(1))
    }
}

/// Retry bookkeeping of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt: Option<Timestamp>,
    /// Received time, or restore time once the message was restored.
    pub scheduled_start: Timestamp,
}

impl RetryState {
    pub fn of(record: &MessageRecord) -> Self {
        Self {
            attempts: record.send_attempts,
            max_attempts: record.send_attempts_max,
            next_attempt: record.next_attempt,
            scheduled_start: record.scheduled_start(),
        }
    }
}

/// Whether another attempt is allowed.
///
/// The attempt limit is the message's own `max_attempts`, which restore
/// raises beyond the policy value; the time limit is the policy window.
pub fn has_attempts_left(state: &RetryState, policy: &RetryPolicy, now: Timestamp) -> bool {
    state.attempts < state.max_attempts
        && now < state.scheduled_start.saturating_add(policy.timeout_ms())
}

/// Next attempt time for `state`, never earlier than `now + 1` nor than the
/// previously scheduled attempt.
pub fn compute_next_attempt(policy: &RetryPolicy, state: &RetryState, now: Timestamp) -> Timestamp {
    policy
        .strategy
        .schedule(policy, state, now)
        .max(now.saturating_add(1))
        .max(state.next_attempt.unwrap_or(0))
}

/// Transition picked by the retry engine for one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The message is already terminal.
    Unchanged,
    Acknowledge,
    /// Keep waiting for an asynchronous receipt.
    AwaitCallback,
    Retry {
        attempts: u32,
        next_attempt: Timestamp,
    },
    Fail {
        attempts: u32,
    },
}

/// Decides the transition for `outcome`.
///
/// A failure consumes an attempt before the budget is checked, so with
/// `max_attempts = 3` the third consecutive failure is terminal.
pub fn decide(
    outcome: ReliabilityOutcome,
    status: MessageStatus,
    state: &RetryState,
    policy: &RetryPolicy,
    now: Timestamp,
) -> RetryDecision {
    if status.is_terminal() {
        return RetryDecision::Unchanged;
    }
    match outcome {
        ReliabilityOutcome::Ok => RetryDecision::Acknowledge,
        ReliabilityOutcome::WaitingForCallback => RetryDecision::AwaitCallback,
        ReliabilityOutcome::PullFailed | ReliabilityOutcome::Abort => {
            let attempts = state.attempts.saturating_add(1).min(state.max_attempts);
            let bumped = RetryState { attempts, ..*state };
            if has_attempts_left(&bumped, policy, now) {
                RetryDecision::Retry {
                    attempts,
                    next_attempt: compute_next_attempt(policy, &bumped, now),
                }
            } else {
                RetryDecision::Fail { attempts }
            }
        }
    }
}
