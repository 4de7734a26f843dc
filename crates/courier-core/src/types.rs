use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Separator between a base channel and its per-initiator sub-channel.
pub const DEFAULT_CHANNEL_SEPARATOR: char = '/';

macro_rules! string_id {
    ($name:ident, $what:literal) => {
        #[doc = concat!("Opaque ", $what, " identifier.")]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Builds the identifier, rejecting empty or blank values.
            pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(CoreError::InvalidInput(concat!("empty ", $what)));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(MessageId, "message id");
string_id!(PartyId, "party id");
string_id!(PModeKey, "pmode key");
string_id!(NodeId, "node id");
string_id!(Channel, "channel");

impl Channel {
    /// Returns the base channel when this one carries a sub-channel suffix.
    ///
    /// `mpc/sub` yields `mpc`; a channel without `separator` yields `None`.
    pub fn base(&self, separator: char) -> Option<Channel> {
        let (base, rest) = self.0.rsplit_once(separator)?;
        if base.trim().is_empty() || rest.is_empty() {
            return None;
        }
        Some(Channel(base.to_string()))
    }
}

/// Whether the sender transmits unprompted or the receiver pulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeDirection {
    Push,
    Pull,
}

impl ExchangeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }
}

impl FromStr for ExchangeDirection {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(Self::Push),
            "pull" => Ok(Self::Pull),
            other => Err(CoreError::UnknownDirection(other.to_string())),
        }
    }
}

impl fmt::Display for ExchangeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an outbound user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// Push message accepted and waiting for its first dispatch.
    SendEnqueued,
    ReadyToPull,
    WaitingForReceipt,
    WaitingForCallback,
    WaitingForRetry,
    Acknowledged,
    SendFailure,
    Deleted,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 8] = [
        Self::SendEnqueued,
        Self::ReadyToPull,
        Self::WaitingForReceipt,
        Self::WaitingForCallback,
        Self::WaitingForRetry,
        Self::Acknowledged,
        Self::SendFailure,
        Self::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendEnqueued => "SEND_ENQUEUED",
            Self::ReadyToPull => "READY_TO_PULL",
            Self::WaitingForReceipt => "WAITING_FOR_RECEIPT",
            Self::WaitingForCallback => "WAITING_FOR_CALLBACK",
            Self::WaitingForRetry => "WAITING_FOR_RETRY",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::SendFailure => "SEND_FAILURE",
            Self::Deleted => "DELETED",
        }
    }

    /// Terminal statuses are never left by the retry engine.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::SendFailure | Self::Deleted)
    }

    /// Statuses in which an outstanding send waits for its receipt.
    pub fn is_awaiting_receipt(&self) -> bool {
        matches!(self, Self::WaitingForReceipt | Self::WaitingForCallback)
    }
}

impl FromStr for MessageStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::UnknownStatus(s.to_string()))
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{Channel, ExchangeDirection, MessageId, MessageStatus};
    use crate::error::CoreError;

    #[test]
    fn ids_reject_blank_values() {
        assert_eq!(
            MessageId::new("  "),
            Err(CoreError::InvalidInput("empty message id"))
        );
        assert_eq!(MessageId::new("m-1").map(|id| id.to_string()), Ok("m-1".into()));
    }

    #[test]
    fn channel_base_strips_last_segment_only() {
        let sub: Channel = "urn:mpc:default/partyA".parse().expect("channel");
        assert_eq!(
            sub.base('/').map(|c| c.as_str().to_string()),
            Some("urn:mpc:default".to_string())
        );
        let nested: Channel = "a/b/c".parse().expect("channel");
        assert_eq!(nested.base('/').map(|c| c.to_string()), Some("a/b".into()));
    }

    #[test]
    fn channel_without_separator_has_no_base() {
        let plain: Channel = "urn:mpc:default".parse().expect("channel");
        assert!(plain.base('/').is_none());
        let trailing: Channel = "mpc/".parse().expect("channel");
        assert!(trailing.base('/').is_none());
    }

    #[test]
    fn status_strings_parse_back() {
        for status in MessageStatus::ALL {
            assert_eq!(status.as_str().parse::<MessageStatus>(), Ok(status));
        }
        assert!("LOST".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        let terminal: Vec<_> = MessageStatus::ALL
            .into_iter()
            .filter(MessageStatus::is_terminal)
            .collect();
        assert_eq!(
            terminal,
            vec![
                MessageStatus::Acknowledged,
                MessageStatus::SendFailure,
                MessageStatus::Deleted
            ]
        );
    }

    #[test]
    fn direction_parses_case_insensitively() {
        assert_eq!("PULL".parse::<ExchangeDirection>(), Ok(ExchangeDirection::Pull));
        assert_eq!(" push ".parse::<ExchangeDirection>(), Ok(ExchangeDirection::Push));
        assert!("both".parse::<ExchangeDirection>().is_err());
    }

    #[test]
    fn status_serializes_as_screaming_snake() {
        let json = serde_json::to_string(&MessageStatus::WaitingForRetry).expect("json");
        assert_eq!(json, "\"WAITING_FOR_RETRY\"");
    }
}
