use courier_core::{Channel, MessageId};
use serde::{Deserialize, Serialize};

/// Coarse classification of an exchanged envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// Business document (pushed, or returned to a pull request).
    UserMessage,
    /// Signal asking a responder for the next waiting message on a channel.
    PullRequest,
    /// Reliability receipt referring to an earlier user message.
    Receipt,
    /// Protocol-level error signal.
    Error,
    /// Empty answer to a pull request (nothing waiting).
    Empty,
}

/// Opaque envelope plus the routing metadata the engine needs.
///
/// `body` is built and interpreted by the envelope collaborator; the engine
/// only ever reads the header fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub message_id: Option<MessageId>,
    pub ref_to_message_id: Option<MessageId>,
    pub channel: Option<Channel>,
    pub body: Vec<u8>,
}

impl Envelope {
    /// Pull request signal for `channel`.
    pub fn pull_request(channel: Channel, correlation_id: Option<MessageId>) -> Self {
        Self {
            kind: EnvelopeKind::PullRequest,
            message_id: correlation_id,
            ref_to_message_id: None,
            channel: Some(channel),
            body: Vec::new(),
        }
    }

    /// User message carrying an externally built body.
    pub fn user_message(message_id: MessageId, body: Vec<u8>) -> Self {
        Self {
            kind: EnvelopeKind::UserMessage,
            message_id: Some(message_id),
            ref_to_message_id: None,
            channel: None,
            body,
        }
    }

    /// Receipt referring to `ref_to`.
    pub fn receipt(ref_to: MessageId, body: Vec<u8>) -> Self {
        Self {
            kind: EnvelopeKind::Receipt,
            message_id: None,
            ref_to_message_id: Some(ref_to),
            channel: None,
            body,
        }
    }

    /// Empty pull answer.
    pub fn empty(ref_to: Option<MessageId>) -> Self {
        Self {
            kind: EnvelopeKind::Empty,
            message_id: None,
            ref_to_message_id: ref_to,
            channel: None,
            body: Vec::new(),
        }
    }

    /// Error signal, optionally referring to a message.
    pub fn error(ref_to: Option<MessageId>, body: Vec<u8>) -> Self {
        Self {
            kind: EnvelopeKind::Error,
            message_id: None,
            ref_to_message_id: ref_to,
            channel: None,
            body,
        }
    }
}
