use std::sync::Arc;

use courier_core::{Channel, MessageId, PartyId};
use courier_transport::adapter::MessageTransport;
use courier_transport::envelope::{Envelope, EnvelopeKind};
use tracing::{debug, warn};

use crate::coordinator::{Coordinator, PullResponse};
use crate::error::{Disposition, EngineError};
use crate::reliability::{ReceivedResponse, ReliabilityOutcome, ResponseFault};

const TEMPORARY_FAILURE: &[u8] = b"temporary failure";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverStats {
    /// Envelopes polled from the transport.
    pub inbound_envelopes: usize,
    /// Pull requests answered with a claimed message.
    pub pulls_served: usize,
    /// Pull requests answered with an empty signal.
    pub empty_answers: usize,
    /// Pull requests answered with an error because of a transient failure.
    pub temporary_failures: usize,
    /// Pull requests sent to responders.
    pub pulls_sent: usize,
    /// User messages received in answer to our pull requests.
    pub messages_received: usize,
    /// Receipts and faults applied to outstanding messages.
    pub receipts_applied: usize,
    /// Receipts refused because the wait already ended.
    pub receipts_rejected: usize,
    /// Push messages handed to the transport.
    pub dispatched: usize,
    /// Outbound sends the transport refused.
    pub send_errors: usize,
}

/// Moves envelopes between a transport and the coordinator.
///
/// Transport peers are party ids: replies go back to the sending peer and
/// push messages go to the record's responder.
pub struct ExchangeDriver<T> {
    coordinator: Arc<Coordinator>,
    transport: T,
    receipt_body: Vec<u8>,
    stats: DriverStats,
}

impl<T> ExchangeDriver<T>
where
    T: MessageTransport<Peer = String>,
    T::Error: std::fmt::Display,
{
    pub fn new(coordinator: Arc<Coordinator>, transport: T) -> Self {
        Self {
            coordinator,
            transport,
            receipt_body: Vec::new(),
            stats: DriverStats::default(),
        }
    }

    /// Body attached to receipts this driver emits, e.g. non-repudiation
    /// evidence produced by the envelope layer.
    pub fn with_receipt_body(mut self, body: Vec<u8>) -> Self {
        self.receipt_body = body;
        self
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn stats(&self) -> DriverStats {
        self.stats
    }

    /// Handles every inbound envelope currently queued. Returns how many
    /// were processed.
    pub fn pump_inbound(&mut self) -> usize {
        let mut processed = 0;
        while let Some((peer, envelope)) = self.transport.recv() {
            self.stats.inbound_envelopes += 1;
            processed += 1;
            match envelope.kind {
                EnvelopeKind::PullRequest => self.serve_pull(&peer, envelope),
                EnvelopeKind::UserMessage => self.accept_user_message(&peer, envelope),
                EnvelopeKind::Empty => self.note_responder_success(&peer),
                EnvelopeKind::Receipt => self.accept_receipt(envelope),
                EnvelopeKind::Error => self.accept_error(&peer, envelope),
            }
        }
        processed
    }

    /// Sends this cycle's pull requests for each `(responder, channel)`.
    pub fn initiate_pulls(&mut self, targets: &[(PartyId, Channel)]) -> usize {
        let mut sent = 0;
        for (responder, channel) in targets {
            let count = self.coordinator.requests_this_cycle(responder);
            let peer = responder.as_str().to_string();
            for _ in 0..count {
                let request = Envelope::pull_request(channel.clone(), None);
                if let Err(err) = self.transport.send(&peer, &request) {
                    warn!(responder = %responder, channel = %channel, error = %err, "pull request send failed");
                    self.stats.send_errors += 1;
                    self.coordinator.pacing().on_error(responder);
                    break;
                }
                sent += 1;
            }
        }
        self.stats.pulls_sent += sent;
        sent
    }

    /// Dispatches every due push message. Returns how many were handed to
    /// the transport.
    pub fn dispatch_due(&mut self) -> Result<usize, EngineError> {
        let due = self.coordinator.process_due_retries()?;
        let mut sent = 0;
        for record in due.dispatch {
            match self.coordinator.mark_dispatched(&record.message_id) {
                Ok(_) => {}
                Err(EngineError::InvalidTransition { .. }) => {
                    debug!(message_id = %record.message_id, "message moved on before dispatch");
                    continue;
                }
                Err(err) => return Err(err),
            }
            let mut envelope = Envelope::user_message(record.message_id.clone(), Vec::new());
            envelope.channel = Some(record.channel.clone());
            let peer = record.responder.as_str().to_string();
            match self.transport.send(&peer, &envelope) {
                Ok(()) => sent += 1,
                Err(err) => {
                    warn!(message_id = %record.message_id, responder = %record.responder, error = %err, "push send failed");
                    self.stats.send_errors += 1;
                    self.coordinator
                        .update_retry_logging(&record.message_id, ReliabilityOutcome::PullFailed)?;
                }
            }
        }
        self.stats.dispatched += sent;
        Ok(sent)
    }

    fn serve_pull(&mut self, peer: &String, request: Envelope) {
        let correlation = request.message_id;
        let Some(channel) = request.channel else {
            self.reply(
                peer,
                Envelope::error(correlation, b"pull request without channel".to_vec()),
            );
            return;
        };
        let reply = match self
            .coordinator
            .handle_inbound_pull_request(&channel, correlation.as_ref())
        {
            Ok(PullResponse::Message(message_id)) => {
                self.stats.pulls_served += 1;
                let mut envelope = Envelope::user_message(message_id, Vec::new());
                envelope.ref_to_message_id = correlation;
                envelope.channel = Some(channel);
                envelope
            }
            Ok(PullResponse::Empty) => {
                self.stats.empty_answers += 1;
                Envelope::empty(correlation)
            }
            Err(err) => match err.disposition() {
                Disposition::RetryLater => {
                    warn!(channel = %channel, error = %err, "pull request failed temporarily");
                    self.stats.temporary_failures += 1;
                    Envelope::error(correlation, TEMPORARY_FAILURE.to_vec())
                }
                Disposition::GiveUp => {
                    warn!(channel = %channel, error = %err, "pull request rejected");
                    Envelope::error(correlation, err.to_string().into_bytes())
                }
            },
        };
        self.reply(peer, reply);
    }

    fn accept_user_message(&mut self, peer: &String, envelope: Envelope) {
        self.note_responder_success(peer);
        let Some(message_id) = envelope.message_id else {
            warn!(peer = %peer, "user message without id dropped");
            return;
        };
        self.stats.messages_received += 1;
        debug!(message_id = %message_id, peer = %peer, "user message received");
        self.reply(peer, Envelope::receipt(message_id, self.receipt_body.clone()));
    }

    fn accept_receipt(&mut self, envelope: Envelope) {
        let Some(ref_to) = envelope.ref_to_message_id else {
            warn!("receipt without reference dropped");
            return;
        };
        let response = if envelope.body.is_empty() {
            ReceivedResponse::receipt(ref_to.clone())
        } else {
            ReceivedResponse::receipt_with_evidence(ref_to.clone())
        };
        self.apply_response(&ref_to, &response);
    }

    fn accept_error(&mut self, peer: &String, envelope: Envelope) {
        if let Some(ref_to) = envelope.ref_to_message_id.as_ref() {
            if let Ok(Some(_)) = self.coordinator.store().message(ref_to) {
                let fault = classify_fault(&envelope.body);
                self.apply_response(ref_to, &ReceivedResponse::fault(fault));
                return;
            }
        }
        // An error answering one of our pull requests.
        debug!(peer = %peer, body = %String::from_utf8_lossy(&envelope.body), "responder error");
        if let Ok(responder) = peer.parse::<PartyId>() {
            self.coordinator.pacing().on_error(&responder);
        }
    }

    fn apply_response(&mut self, message_id: &MessageId, response: &ReceivedResponse) {
        match self
            .coordinator
            .handle_inbound_receipt(message_id, Some(response))
        {
            Ok(outcome) => {
                self.stats.receipts_applied += 1;
                debug!(message_id = %message_id, ?outcome, "response applied");
            }
            Err(EngineError::ClaimExpired(_)) => {
                self.stats.receipts_rejected += 1;
            }
            Err(err) => warn!(message_id = %message_id, error = %err, "response not applied"),
        }
    }

    fn note_responder_success(&self, peer: &str) {
        if let Ok(responder) = peer.parse::<PartyId>() {
            self.coordinator.pacing().on_success(&responder);
        }
    }

    fn reply(&mut self, peer: &String, envelope: Envelope) {
        if let Err(err) = self.transport.send(peer, &envelope) {
            warn!(peer = %peer, error = %err, "reply send failed");
            self.stats.send_errors += 1;
        }
    }
}

fn classify_fault(body: &[u8]) -> ResponseFault {
    match String::from_utf8_lossy(body).trim() {
        "security" => ResponseFault::Security,
        "configuration" => ResponseFault::Configuration,
        _ => ResponseFault::Protocol,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use courier_core::{
        Channel, ManualClock, MessageId, MessageStatus, NodeId, PModeKey, PartyId,
    };
    use courier_store::{ClaimState, SqliteStore};
    use courier_transport::adapter::{route_in_memory_outbound, InMemoryTransport};
    use courier_transport::envelope::{Envelope, EnvelopeKind};

    use super::{classify_fault, ExchangeDriver};
    use crate::config::EngineConfig;
    use crate::coordinator::{Coordinator, Submission};
    use crate::notify::RecordingSink;
    use crate::pacing::PacingConfig;
    use crate::pmode::StaticPModeProvider;
    use crate::reliability::ResponseFault;

    const CATALOGUE: &str = r#"
[[process]]
key = "invoice-pull"
initiator = "party-b"
responder = "party-a"
channel = "mpc/invoices"

[process.leg]
name = "invoice"
direction = "pull"
retry = { timeout = "10m", max_attempts = 3 }

[[process]]
key = "ack-push"
initiator = "party-a"
responder = "party-b"
channel = "mpc/acks"

[process.leg]
name = "ack"
direction = "push"
reliability = { pattern = "response", non_repudiation = true }
retry = { timeout = "1h", max_attempts = 3 }
"#;

    fn node(name: &str, clock: &ManualClock) -> ExchangeDriver<InMemoryTransport> {
        let mut config = EngineConfig::new(NodeId::new(name).expect("node"));
        config.pacing = PacingConfig {
            max_requests_per_cycle: 2,
            recovering_time_secs: 2,
            error_threshold: 1,
        };
        let coordinator = Coordinator::new(
            config,
            Arc::new(SqliteStore::open_in_memory().expect("store")),
            Arc::new(StaticPModeProvider::from_toml_str(CATALOGUE).expect("catalogue")),
            Arc::new(RecordingSink::new()),
            Arc::new(clock.clone()),
        );
        ExchangeDriver::new(Arc::new(coordinator), InMemoryTransport::new())
    }

    fn id(raw: &str) -> MessageId {
        MessageId::new(raw).expect("id")
    }

    fn party(raw: &str) -> PartyId {
        PartyId::new(raw).expect("party")
    }

    fn invoices() -> Channel {
        Channel::new("mpc/invoices").expect("channel")
    }

    fn submit(driver: &ExchangeDriver<InMemoryTransport>, message_id: &str, pmode: &str) {
        driver
            .coordinator()
            .submit(Submission {
                message_id: id(message_id),
                pmode_key: PModeKey::new(pmode).expect("key"),
                channel: None,
            })
            .expect("submit");
    }

    fn status(driver: &ExchangeDriver<InMemoryTransport>, message_id: &str) -> MessageStatus {
        driver
            .coordinator()
            .store()
            .message(&id(message_id))
            .expect("read")
            .expect("record")
            .status
    }

    #[test]
    fn pull_round_trip_acknowledges_message() {
        let clock = ManualClock::starting_at(1_000);
        let mut responder = node("node-a", &clock);
        let mut initiator = node("node-b", &clock);
        submit(&responder, "m-1", "invoice-pull");

        let targets = [(party("party-a"), invoices())];
        assert_eq!(initiator.initiate_pulls(&targets), 2);
        route_in_memory_outbound(
            initiator.transport_mut(),
            responder.transport_mut(),
            "party-b",
        );

        assert_eq!(responder.pump_inbound(), 2);
        assert_eq!(responder.stats().pulls_served, 1);
        assert_eq!(responder.stats().empty_answers, 1);
        assert_eq!(status(&responder, "m-1"), MessageStatus::WaitingForReceipt);

        route_in_memory_outbound(
            responder.transport_mut(),
            initiator.transport_mut(),
            "party-a",
        );
        initiator.pump_inbound();
        assert_eq!(initiator.stats().messages_received, 1);

        let mut replies = initiator.transport_mut().take_outbound();
        assert_eq!(replies.len(), 1);
        let (peer, receipt) = replies.remove(0);
        assert_eq!(peer, "party-a");
        assert_eq!(receipt.kind, EnvelopeKind::Receipt);
        responder.transport_mut().enqueue_inbound("party-b", receipt);
        responder.pump_inbound();

        assert_eq!(status(&responder, "m-1"), MessageStatus::Acknowledged);
        assert_eq!(responder.stats().receipts_applied, 1);
    }

    #[test]
    fn busy_store_answers_pull_with_temporary_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("courier.db");
        let store = SqliteStore::open(&path).expect("store");
        store
            .set_busy_timeout(Duration::from_millis(20))
            .expect("busy timeout");
        let clock = ManualClock::starting_at(1_000);
        let coordinator = Coordinator::new(
            EngineConfig::new(NodeId::new("node-a").expect("node")),
            Arc::new(store),
            Arc::new(StaticPModeProvider::from_toml_str(CATALOGUE).expect("catalogue")),
            Arc::new(RecordingSink::new()),
            Arc::new(clock),
        );
        let mut responder = ExchangeDriver::new(Arc::new(coordinator), InMemoryTransport::new());
        submit(&responder, "m-1", "invoice-pull");

        let holder = rusqlite::Connection::open(&path).expect("second connection");
        holder.execute_batch("BEGIN EXCLUSIVE;").expect("lock");
        responder
            .transport_mut()
            .enqueue_inbound("party-b", Envelope::pull_request(invoices(), Some(id("req-1"))));
        assert_eq!(responder.pump_inbound(), 1);
        holder.execute_batch("ROLLBACK;").expect("unlock");

        let mut replies = responder.transport_mut().take_outbound();
        assert_eq!(replies.len(), 1);
        let (peer, reply) = replies.remove(0);
        assert_eq!(peer, "party-b");
        assert_eq!(reply.kind, EnvelopeKind::Error);
        assert_eq!(reply.ref_to_message_id, Some(id("req-1")));
        assert_eq!(reply.body, b"temporary failure".to_vec());
        assert_eq!(responder.stats().temporary_failures, 1);
        assert_eq!(responder.stats().pulls_served, 0);

        assert_eq!(status(&responder, "m-1"), MessageStatus::ReadyToPull);
        let claim = responder
            .coordinator()
            .store()
            .claim_of(&id("m-1"))
            .expect("claim")
            .expect("row");
        assert_eq!(claim.state, ClaimState::Waiting);
    }

    #[test]
    fn unknown_channel_errors_slow_the_initiator_down() {
        let clock = ManualClock::starting_at(1_000);
        let mut responder = node("node-a", &clock);
        let mut initiator = node("node-b", &clock);

        let targets = [(party("party-a"), Channel::new("mpc/unknown").expect("channel"))];
        initiator.initiate_pulls(&targets);
        route_in_memory_outbound(
            initiator.transport_mut(),
            responder.transport_mut(),
            "party-b",
        );
        responder.pump_inbound();
        let replies = responder.transport_mut().take_outbound();
        assert!(replies.iter().all(|(_, e)| e.kind == EnvelopeKind::Error));
        for (_, envelope) in replies {
            initiator.transport_mut().enqueue_inbound("party-a", envelope);
        }
        initiator.pump_inbound();

        assert_eq!(
            initiator.coordinator().requests_this_cycle(&party("party-a")),
            1
        );
    }

    #[test]
    fn push_dispatch_and_receipt_with_evidence() {
        let clock = ManualClock::starting_at(1_000);
        let mut sender = node("node-a", &clock);
        let mut receiver = node("node-b", &clock).with_receipt_body(b"nrr".to_vec());
        submit(&sender, "p-1", "ack-push");

        assert_eq!(sender.dispatch_due().expect("dispatch"), 1);
        assert_eq!(status(&sender, "p-1"), MessageStatus::WaitingForReceipt);
        route_in_memory_outbound(sender.transport_mut(), receiver.transport_mut(), "party-a");
        receiver.pump_inbound();
        route_in_memory_outbound(receiver.transport_mut(), sender.transport_mut(), "party-b");
        sender.pump_inbound();

        assert_eq!(status(&sender, "p-1"), MessageStatus::Acknowledged);
    }

    #[test]
    fn failed_push_send_schedules_retry() {
        let clock = ManualClock::starting_at(1_000);
        let mut sender = node("node-a", &clock);
        sender.transport_mut().set_unreachable("party-b", true);
        submit(&sender, "p-1", "ack-push");

        assert_eq!(sender.dispatch_due().expect("dispatch"), 0);
        assert_eq!(status(&sender, "p-1"), MessageStatus::WaitingForRetry);
        assert_eq!(sender.stats().send_errors, 1);
    }

    #[test]
    fn error_signal_for_known_message_is_applied_as_fault() {
        let clock = ManualClock::starting_at(1_000);
        let mut sender = node("node-a", &clock);
        submit(&sender, "p-1", "ack-push");
        sender.dispatch_due().expect("dispatch");
        sender.transport_mut().take_outbound();

        sender
            .transport_mut()
            .enqueue_inbound("party-b", Envelope::error(Some(id("p-1")), b"security".to_vec()));
        sender.pump_inbound();
        assert_eq!(status(&sender, "p-1"), MessageStatus::WaitingForRetry);
        assert_eq!(sender.stats().receipts_applied, 1);
    }

    #[test]
    fn fault_classes_are_read_from_the_body() {
        assert_eq!(classify_fault(b"security"), ResponseFault::Security);
        assert_eq!(classify_fault(b" configuration\n"), ResponseFault::Configuration);
        assert_eq!(classify_fault(b"EBMS:0004"), ResponseFault::Protocol);
    }
}
