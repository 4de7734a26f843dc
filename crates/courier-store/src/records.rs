use std::fmt;
use std::str::FromStr;

use courier_core::{
    Channel, CoreError, ExchangeDirection, MessageId, MessageStatus, NodeId, PModeKey, PartyId,
    Timestamp,
};

/// One row of the message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub channel: Channel,
    pub initiator: PartyId,
    pub responder: PartyId,
    pub direction: ExchangeDirection,
    pub pmode_key: PModeKey,
    pub status: MessageStatus,
    pub send_attempts: u32,
    pub send_attempts_max: u32,
    /// Width of the retry window in milliseconds, measured from
    /// [`MessageRecord::scheduled_start`].
    pub retry_timeout_ms: u64,
    pub next_attempt: Option<Timestamp>,
    pub received_at: Timestamp,
    pub restored_at: Option<Timestamp>,
    pub receipt_deadline: Option<Timestamp>,
    pub created_at: Timestamp,
    /// Write counter. Every store write to the row bumps it, so a stale
    /// snapshot can never overwrite a newer one.
    pub version: u64,
}

impl MessageRecord {
    /// Start of the current retry window: the restore time when the message
    /// was restored, otherwise the time it was received.
    pub fn scheduled_start(&self) -> Timestamp {
        self.restored_at.unwrap_or(self.received_at)
    }

    /// End of the current retry window.
    pub fn retry_window_end(&self) -> Timestamp {
        self.scheduled_start().saturating_add(self.retry_timeout_ms)
    }
}

/// State of a pull claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimState {
    Waiting,
    Claimed,
    Expired,
}

impl ClaimState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Claimed => "CLAIMED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl FromStr for ClaimState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(Self::Waiting),
            "CLAIMED" => Ok(Self::Claimed),
            "EXPIRED" => Ok(Self::Expired),
            _ => Err(CoreError::InvalidInput("unknown claim state")),
        }
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent claim record for a pull message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullClaim {
    pub message_id: MessageId,
    pub channel: Channel,
    pub initiator: PartyId,
    pub state: ClaimState,
    pub claimed_by: Option<NodeId>,
    pub stale_after: Option<Timestamp>,
    pub available_at: Timestamp,
    pub created_at: Timestamp,
}

/// What happens to a message's pull claim alongside a status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimChange {
    Keep,
    /// Drop the claim row (receipt processed or message deleted).
    Remove,
    /// Back to `WAITING`, claimable again from `available_at`.
    Requeue { available_at: Timestamp },
    /// Tombstone the claim as `EXPIRED`.
    Expire,
    /// Keep `CLAIMED` and push the staleness deadline out.
    Refresh { stale_after: Timestamp },
    /// Insert or reset the claim to `WAITING` (restore of a pull message).
    Recreate { available_at: Timestamp },
}

/// Compare-and-set write of a message log row.
///
/// The row is only written when its stored status equals `expected` and its
/// stored version equals `record.version`. With `require_claimed` set, the
/// claim must also still be `CLAIMED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub record: MessageRecord,
    pub expected: MessageStatus,
    pub claim: ClaimChange,
    pub require_claimed: bool,
}

/// Message touched by claim-next, with the status it had before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimCandidate {
    pub message_id: MessageId,
    pub previous: MessageStatus,
}

/// Result of one atomic claim-next call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimOutcome {
    /// Message now `CLAIMED` and `WAITING_FOR_RECEIPT`.
    pub claimed: Option<ClaimCandidate>,
    /// Candidates whose retry budget was spent, marked `SEND_FAILURE` in the
    /// same transaction.
    pub staled: Vec<ClaimCandidate>,
}
