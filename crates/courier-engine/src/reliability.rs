//! Classification of exchange responses against a leg's reliability contract.

use courier_core::{ExchangeDirection, MessageId};
use serde::{Deserialize, Serialize};

/// Result of checking one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReliabilityOutcome {
    Ok,
    WaitingForCallback,
    PullFailed,
    Abort,
}

/// How the acknowledgement for a leg is delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyPattern {
    /// Receipt comes back on the same exchange.
    #[default]
    Response,
    /// Receipt arrives later as a separate inbound exchange.
    Callback,
}

/// Reliability requirements of a leg.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliabilityContract {
    #[serde(default)]
    pub pattern: ReplyPattern,
    /// Receipts must carry non-repudiation evidence.
    #[serde(default)]
    pub non_repudiation: bool,
}

/// Upstream classification of an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFault {
    /// Signature, certificate or trust failure.
    Security,
    /// Processing-mode mismatch on the remote side.
    Configuration,
    /// Any other protocol-level error.
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    Receipt {
        ref_to_message_id: Option<MessageId>,
        non_repudiation: bool,
    },
    /// Transport-level success without any signal (async callbacks).
    Empty,
    Fault(ResponseFault),
    /// Could not be parsed as a signal.
    Malformed,
}

/// A response as seen by the reliability checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedResponse {
    pub kind: ResponseKind,
}

impl ReceivedResponse {
    pub fn receipt(ref_to_message_id: MessageId) -> Self {
        Self {
            kind: ResponseKind::Receipt {
                ref_to_message_id: Some(ref_to_message_id),
                non_repudiation: false,
            },
        }
    }

    pub fn receipt_with_evidence(ref_to_message_id: MessageId) -> Self {
        Self {
            kind: ResponseKind::Receipt {
                ref_to_message_id: Some(ref_to_message_id),
                non_repudiation: true,
            },
        }
    }

    pub fn empty() -> Self {
        Self {
            kind: ResponseKind::Empty,
        }
    }

    pub fn fault(fault: ResponseFault) -> Self {
        Self {
            kind: ResponseKind::Fault(fault),
        }
    }

    pub fn malformed() -> Self {
        Self {
            kind: ResponseKind::Malformed,
        }
    }
}

/// Classifies `response` for the message `expected`.
///
/// Pure: nothing is persisted here, the retry engine applies the outcome.
pub fn check(
    expected: &MessageId,
    direction: ExchangeDirection,
    response: Option<&ReceivedResponse>,
    contract: Option<&ReliabilityContract>,
) -> ReliabilityOutcome {
    let Some(response) = response else {
        return ReliabilityOutcome::PullFailed;
    };
    match &response.kind {
        ResponseKind::Malformed => ReliabilityOutcome::PullFailed,
        ResponseKind::Fault(fault) => match (direction, fault) {
            (ExchangeDirection::Pull, ResponseFault::Security | ResponseFault::Configuration) => {
                ReliabilityOutcome::Abort
            }
            _ => ReliabilityOutcome::PullFailed,
        },
        ResponseKind::Empty => match contract {
            None => ReliabilityOutcome::Ok,
            Some(contract) if contract.pattern == ReplyPattern::Callback => {
                ReliabilityOutcome::WaitingForCallback
            }
            Some(_) => ReliabilityOutcome::PullFailed,
        },
        ResponseKind::Receipt {
            ref_to_message_id,
            non_repudiation,
        } => {
            let Some(contract) = contract else {
                return ReliabilityOutcome::Ok;
            };
            if ref_to_message_id.as_ref() != Some(expected) {
                return ReliabilityOutcome::PullFailed;
            }
            if contract.non_repudiation && !non_repudiation {
                return ReliabilityOutcome::PullFailed;
            }
            ReliabilityOutcome::Ok
        }
    }
}
