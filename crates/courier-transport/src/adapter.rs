use std::collections::VecDeque;
use std::hash::Hash;

use thiserror::Error;

use crate::envelope::Envelope;

/// Coarse per-transport health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHealthSnapshot {
    pub outbound_queued: u64,
    pub outbound_send_ok: u64,
    pub outbound_send_err: u64,
    pub inbound_received: u64,
    pub last_error: Option<String>,
}

/// Errors surfaced by the in-memory transports.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("send disabled")]
    SendDisabled,
    #[error("peer unreachable: {0}")]
    Unreachable(String),
}

/// Envelope-oriented transport contract used by the exchange engine.
pub trait MessageTransport {
    /// Opaque peer handle used for replies/routing.
    type Peer: Clone + Eq + Hash;
    /// Transport-specific send error.
    type Error;

    /// Hands an envelope to the transport for delivery to `peer`.
    fn send(&mut self, peer: &Self::Peer, envelope: &Envelope) -> Result<(), Self::Error>;
    /// Returns the next inbound envelope and its sending peer.
    fn recv(&mut self) -> Option<(Self::Peer, Envelope)>;

    /// Whether outbound send is currently available.
    fn can_send(&self) -> bool {
        true
    }

    /// Best-effort transport health counters for ops decisions.
    fn health_snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot::default()
    }
}

/// In-memory transport for tests and simulations.
#[derive(Debug, Default, Clone)]
pub struct InMemoryTransport {
    inbound: VecDeque<(String, Envelope)>,
    outbound: Vec<(String, Envelope)>,
    unreachable: Vec<String>,
    allow_send: bool,
    send_ok: u64,
    send_err: u64,
    recv_ok: u64,
    last_error: Option<String>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            allow_send: true,
            ..Self::default()
        }
    }

    /// Queues an envelope as inbound traffic from `peer`.
    pub fn enqueue_inbound(&mut self, peer: impl Into<String>, envelope: Envelope) {
        self.inbound.push_back((peer.into(), envelope));
    }

    /// Drains and returns all outbound sends captured so far.
    pub fn take_outbound(&mut self) -> Vec<(String, Envelope)> {
        std::mem::take(&mut self.outbound)
    }

    /// Enables/disables outbound sending capability.
    pub fn set_allow_send(&mut self, allow_send: bool) {
        self.allow_send = allow_send;
    }

    /// Makes every send to `peer` fail until cleared.
    pub fn set_unreachable(&mut self, peer: impl Into<String>, unreachable: bool) {
        let peer = peer.into();
        self.unreachable.retain(|p| p != &peer);
        if unreachable {
            self.unreachable.push(peer);
        }
    }

    fn fail(&mut self, err: TransportError) -> Result<(), TransportError> {
        self.send_err += 1;
        self.last_error = Some(err.to_string());
        Err(err)
    }
}

impl MessageTransport for InMemoryTransport {
    type Peer = String;
    type Error = TransportError;

    fn send(&mut self, peer: &Self::Peer, envelope: &Envelope) -> Result<(), Self::Error> {
        if !self.allow_send {
            return self.fail(TransportError::SendDisabled);
        }
        if self.unreachable.contains(peer) {
            return self.fail(TransportError::Unreachable(peer.clone()));
        }
        self.outbound.push((peer.clone(), envelope.clone()));
        self.send_ok += 1;
        Ok(())
    }

    fn recv(&mut self) -> Option<(Self::Peer, Envelope)> {
        let msg = self.inbound.pop_front();
        if msg.is_some() {
            self.recv_ok += 1;
        }
        msg
    }

    fn can_send(&self) -> bool {
        self.allow_send
    }

    fn health_snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot {
            outbound_queued: self.outbound.len() as u64,
            outbound_send_ok: self.send_ok,
            outbound_send_err: self.send_err,
            inbound_received: self.recv_ok,
            last_error: self.last_error.clone(),
        }
    }
}

/// Routes all captured outbound envelopes from one in-memory transport into
/// another transport's inbound queue, tagging them as sent by `from_peer`.
pub fn route_in_memory_outbound(
    from: &mut InMemoryTransport,
    to: &mut InMemoryTransport,
    from_peer: impl Into<String>,
) -> usize {
    let from_peer = from_peer.into();
    let outbound = from.take_outbound();
    let moved = outbound.len();
    for (_, envelope) in outbound {
        to.enqueue_inbound(from_peer.clone(), envelope);
    }
    moved
}

#[cfg(test)]
mod tests {
    use courier_core::{Channel, MessageId};

    use super::{
        route_in_memory_outbound, InMemoryTransport, MessageTransport, TransportError,
        TransportHealthSnapshot,
    };
    use crate::envelope::{Envelope, EnvelopeKind};

    fn channel() -> Channel {
        "urn:mpc:default".parse().expect("channel")
    }

    #[test]
    fn in_memory_transport_send_and_recv_work() {
        let mut transport = InMemoryTransport::new();
        let id: MessageId = "m-1".parse().expect("id");
        transport.enqueue_inbound("alice", Envelope::user_message(id.clone(), vec![1, 2]));

        let (peer, envelope) = transport.recv().expect("should receive one envelope");
        assert_eq!(peer, "alice");
        assert_eq!(envelope.kind, EnvelopeKind::UserMessage);
        assert_eq!(envelope.message_id, Some(id));

        transport
            .send(&"bob".to_string(), &Envelope::pull_request(channel(), None))
            .expect("send should succeed");
        let outbound = transport.take_outbound();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].1.kind, EnvelopeKind::PullRequest);
        assert_eq!(
            transport.health_snapshot(),
            TransportHealthSnapshot {
                outbound_queued: 0,
                outbound_send_ok: 1,
                outbound_send_err: 0,
                inbound_received: 1,
                last_error: None,
            }
        );
    }

    #[test]
    fn unreachable_peer_fails_and_records_error() {
        let mut transport = InMemoryTransport::new();
        transport.set_unreachable("bob", true);
        let err = transport
            .send(&"bob".to_string(), &Envelope::pull_request(channel(), None))
            .expect_err("unreachable peer should fail");
        assert_eq!(err, TransportError::Unreachable("bob".into()));
        assert_eq!(
            transport.health_snapshot().last_error.as_deref(),
            Some("peer unreachable: bob")
        );

        transport.set_unreachable("bob", false);
        assert!(transport
            .send(&"bob".to_string(), &Envelope::pull_request(channel(), None))
            .is_ok());
    }

    #[test]
    fn disabled_send_is_rejected() {
        let mut transport = InMemoryTransport::new();
        transport.set_allow_send(false);
        assert!(!transport.can_send());
        assert_eq!(
            transport.send(&"bob".to_string(), &Envelope::empty(None)),
            Err(TransportError::SendDisabled)
        );
    }

    #[test]
    fn route_in_memory_outbound_moves_envelopes_to_receiver_inbox() {
        let mut src = InMemoryTransport::new();
        let mut dst = InMemoryTransport::new();
        src.send(&"peer-a".to_string(), &Envelope::pull_request(channel(), None))
            .expect("send should succeed");
        src.send(&"peer-b".to_string(), &Envelope::empty(None))
            .expect("send should succeed");

        let moved = route_in_memory_outbound(&mut src, &mut dst, "src-peer");
        assert_eq!(moved, 2);

        let (peer1, first) = dst.recv().expect("first inbound expected");
        assert_eq!(peer1, "src-peer");
        assert_eq!(first.kind, EnvelopeKind::PullRequest);
        let (_, second) = dst.recv().expect("second inbound expected");
        assert_eq!(second.kind, EnvelopeKind::Empty);
    }
}
