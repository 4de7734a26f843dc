use std::sync::Arc;

use courier_core::{
    Channel, Clock, ExchangeDirection, MessageId, MessageStatus, PModeKey, PartyId, Timestamp,
};
use courier_store::{ClaimChange, ClaimState, MessageRecord, SqliteStore, StatusUpdate};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::notify::{Notification, NotificationSink};
use crate::pacing::PullFrequencyRegistry;
use crate::pmode::{ExchangeContext, LegConfig, PModeError, PModeProvider};
use crate::reliability::{self, ReceivedResponse, ReliabilityOutcome, ReplyPattern};
use crate::retry::{self, RetryDecision, RetryState};

/// Answer to an inbound pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullResponse {
    /// This message is now claimed for the requester.
    Message(MessageId),
    /// Nothing is waiting on the channel.
    Empty,
}

/// An outbound user message handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub message_id: MessageId,
    pub pmode_key: PModeKey,
    /// Sub-channel overriding the process channel, e.g. `mpc/partyB`.
    pub channel: Option<Channel>,
}

/// Work found by one pass of the due-retry scanner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DueRetries {
    /// Pull messages made claimable again.
    pub requeued: Vec<MessageId>,
    /// Push messages the resend worker must dispatch now.
    pub dispatch: Vec<MessageRecord>,
    /// Messages whose retry window closed before they came due.
    pub failed: Vec<MessageId>,
}

/// Status a failed message returns to when restored.
pub fn restore_status_of(direction: ExchangeDirection) -> MessageStatus {
    match direction {
        ExchangeDirection::Push => MessageStatus::WaitingForReceipt,
        ExchangeDirection::Pull => MessageStatus::ReadyToPull,
    }
}

enum Applied {
    Unchanged,
    Changed,
    /// A concurrent transition committed first.
    Lost,
}

/// Top-level orchestration of push/pull exchanges for one node.
pub struct Coordinator {
    config: EngineConfig,
    store: Arc<SqliteStore>,
    pmodes: Arc<dyn PModeProvider>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    pacing: PullFrequencyRegistry,
}

impl Coordinator {
    pub fn new(
        config: EngineConfig,
        store: Arc<SqliteStore>,
        pmodes: Arc<dyn PModeProvider>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let pacing = PullFrequencyRegistry::new(config.pacing, Arc::clone(&clock));
        Self {
            config,
            store,
            pmodes,
            notifier,
            clock,
            pacing,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn pacing(&self) -> &PullFrequencyRegistry {
        &self.pacing
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn resolve_exchange_mode(&self, key: &PModeKey) -> Result<ExchangeDirection, EngineError> {
        Ok(self.leg_for(key)?.direction)
    }

    /// Resolves the exchange behind `channel`.
    ///
    /// A channel with no process of its own is retried once as its base
    /// channel (`mpc/sub` as `mpc`); the returned context keeps the
    /// requested channel.
    pub fn build_exchange_context(&self, channel: &Channel) -> Result<ExchangeContext, EngineError> {
        match self.pmodes.find_process(channel) {
            Ok(ctx) => return Ok(ctx),
            Err(PModeError::NoMatchingConfiguration(_)) => {}
            Err(err) => return Err(config_error(err)),
        }
        if let Some(base) = channel.base(self.config.channel_separator) {
            match self.pmodes.find_process(&base) {
                Ok(mut ctx) => {
                    debug!(channel = %channel, base = %base, "resolved sub-channel via base channel");
                    ctx.channel = channel.clone();
                    return Ok(ctx);
                }
                Err(PModeError::NoMatchingConfiguration(_)) => {}
                Err(err) => return Err(config_error(err)),
            }
        }
        Err(EngineError::NoMatchingExchange(channel.clone()))
    }

    /// Oldest claimable message for the pair, or `None`.
    pub fn find_ready_message(
        &self,
        channel: &Channel,
        initiator: &PartyId,
    ) -> Result<Option<MessageId>, EngineError> {
        Ok(self.store.oldest_ready(channel, initiator, self.clock.now())?)
    }

    pub fn submit(&self, submission: Submission) -> Result<MessageRecord, EngineError> {
        let ctx = self
            .pmodes
            .context_for(&submission.pmode_key)
            .map_err(config_error)?;
        let leg = self.leg_for(&submission.pmode_key)?;
        let now = self.clock.now();
        let (status, next_attempt, claim_at) = match leg.direction {
            ExchangeDirection::Pull => (MessageStatus::ReadyToPull, None, Some(now)),
            ExchangeDirection::Push => (MessageStatus::SendEnqueued, Some(now), None),
        };
        let record = MessageRecord {
            message_id: submission.message_id,
            channel: submission.channel.unwrap_or(ctx.channel),
            initiator: ctx.initiator,
            responder: ctx.responder,
            direction: leg.direction,
            pmode_key: submission.pmode_key,
            status,
            send_attempts: 0,
            send_attempts_max: leg.retry.max_attempts,
            retry_timeout_ms: leg.retry.timeout_ms(),
            next_attempt,
            received_at: now,
            restored_at: None,
            receipt_deadline: None,
            created_at: now,
            version: 0,
        };
        self.store.insert_message(&record, claim_at)?;
        info!(
            message_id = %record.message_id,
            channel = %record.channel,
            direction = %record.direction,
            "message submitted"
        );
        Ok(record)
    }

    /// Serves a pull request: claims the oldest waiting message on the
    /// channel for the requesting initiator.
    ///
    /// `StoreUnavailable` must be answered with a temporary failure; no
    /// state was changed in that case.
    pub fn handle_inbound_pull_request(
        &self,
        channel: &Channel,
        correlation_id: Option<&MessageId>,
    ) -> Result<PullResponse, EngineError> {
        let ctx = self.build_exchange_context(channel)?;
        if ctx.direction != ExchangeDirection::Pull {
            return Err(EngineError::Configuration(format!(
                "channel {channel} is not served by a pull process"
            )));
        }
        let now = self.clock.now();
        let stale_after = now.saturating_add(self.config.response_timeout_ms());
        let outcome = self.store.claim_next(
            &ctx.channel,
            &ctx.initiator,
            &self.config.node_id,
            stale_after,
            now,
        )?;

        for staled in &outcome.staled {
            warn!(message_id = %staled.message_id, channel = %ctx.channel, "retry budget spent, message failed at claim");
            self.emit(&[
                Notification::StatusChange {
                    message_id: staled.message_id.clone(),
                    from: staled.previous,
                    to: MessageStatus::SendFailure,
                },
                Notification::TerminalFailure(staled.message_id.clone()),
            ]);
        }

        match outcome.claimed {
            Some(claimed) => {
                info!(
                    message_id = %claimed.message_id,
                    channel = %ctx.channel,
                    initiator = %ctx.initiator,
                    node = %self.config.node_id,
                    correlation_id = ?correlation_id.map(MessageId::as_str),
                    "pull request claimed message"
                );
                self.emit(&[Notification::StatusChange {
                    message_id: claimed.message_id.clone(),
                    from: claimed.previous,
                    to: MessageStatus::WaitingForReceipt,
                }]);
                Ok(PullResponse::Message(claimed.message_id))
            }
            None => {
                debug!(channel = %ctx.channel, initiator = %ctx.initiator, "no message waiting");
                Ok(PullResponse::Empty)
            }
        }
    }

    /// Applies a receipt (or its absence) to an outstanding message.
    ///
    /// Receipts for messages whose wait already ended (claim expired,
    /// retry scheduled, failed) are rejected with `ClaimExpired`. A repeated
    /// receipt for an acknowledged message is a no-op.
    pub fn handle_inbound_receipt(
        &self,
        message_id: &MessageId,
        response: Option<&ReceivedResponse>,
    ) -> Result<ReliabilityOutcome, EngineError> {
        let record = self.load(message_id)?;
        match record.status {
            MessageStatus::Acknowledged => {
                debug!(message_id = %message_id, "duplicate receipt ignored");
                return Ok(ReliabilityOutcome::Ok);
            }
            MessageStatus::Deleted => {
                return Err(EngineError::InvalidTransition {
                    message_id: message_id.clone(),
                    status: record.status,
                    action: "receive receipt for",
                })
            }
            status if status.is_awaiting_receipt() => {}
            _ => {
                warn!(message_id = %message_id, status = %record.status, "receipt arrived after expiry");
                return Err(EngineError::ClaimExpired(message_id.clone()));
            }
        }

        let leg = self.leg_for(&record.pmode_key)?;
        let outcome = reliability::check(
            message_id,
            record.direction,
            response,
            leg.reliability.as_ref(),
        );
        debug!(message_id = %message_id, ?outcome, "reliability check");
        match self.apply_outcome(&record, &leg, outcome)? {
            Applied::Lost => {
                warn!(message_id = %message_id, "receipt lost the race against expiry");
                Err(EngineError::ClaimExpired(message_id.clone()))
            }
            Applied::Unchanged | Applied::Changed => Ok(outcome),
        }
    }

    /// Records the outcome of an exchange in the message's retry state.
    ///
    /// Idempotent for terminal messages.
    pub fn update_retry_logging(
        &self,
        message_id: &MessageId,
        outcome: ReliabilityOutcome,
    ) -> Result<(), EngineError> {
        let record = self.load(message_id)?;
        let leg = self.leg_for(&record.pmode_key)?;
        if let Applied::Lost = self.apply_outcome(&record, &leg, outcome)? {
            debug!(message_id = %message_id, "concurrent transition already applied");
        }
        Ok(())
    }

    pub fn requests_this_cycle(&self, responder: &PartyId) -> u32 {
        self.pacing.requests_this_cycle(responder)
    }

    /// Expires every claim held past its staleness deadline. Returns the
    /// number of messages expired.
    pub fn expire_stale_claims(&self) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let mut expired = 0;
        for claim in self.store.stale_claims(now, self.config.scan_batch)? {
            let Some(record) = self.store.message(&claim.message_id)? else {
                continue;
            };
            if !record.status.is_awaiting_receipt() {
                continue;
            }
            // A reclaim before the snapshot shows up as a fresh deadline here;
            // one after it bumps the row version and loses the write.
            let still_stale = self
                .store
                .claim_of(&claim.message_id)?
                .is_some_and(|current| {
                    current.state == ClaimState::Claimed
                        && current.stale_after.is_some_and(|deadline| deadline <= now)
                });
            if !still_stale {
                continue;
            }
            info!(
                message_id = %claim.message_id,
                claimed_by = ?claim.claimed_by.as_ref().map(|n| n.as_str()),
                "claim expired without receipt"
            );
            if self.expire(&record)? {
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Fails the current attempt of push messages whose receipt deadline
    /// passed. Returns the number of messages affected.
    pub fn expire_overdue_receipts(&self) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let mut expired = 0;
        for record in self.store.overdue_receipts(now, self.config.scan_batch)? {
            info!(message_id = %record.message_id, "receipt deadline passed");
            if self.expire(&record)? {
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Moves due pull retries back to `READY_TO_PULL` and returns the push
    /// messages to dispatch.
    pub fn process_due_retries(&self) -> Result<DueRetries, EngineError> {
        let now = self.clock.now();
        let mut due = DueRetries::default();
        for record in self.store.due_retries(now, self.config.scan_batch)? {
            if now >= record.retry_window_end() {
                if self.expire(&record)? {
                    due.failed.push(record.message_id);
                }
                continue;
            }
            match record.direction {
                ExchangeDirection::Push => due.dispatch.push(record),
                ExchangeDirection::Pull => {
                    let update = StatusUpdate {
                        record: MessageRecord {
                            status: MessageStatus::ReadyToPull,
                            ..record.clone()
                        },
                        expected: record.status,
                        claim: ClaimChange::Keep,
                        require_claimed: false,
                    };
                    if self.commit(&update, &[])? {
                        debug!(message_id = %record.message_id, "pull retry due");
                        due.requeued.push(record.message_id);
                    }
                }
            }
        }
        Ok(due)
    }

    /// Records that a push message was handed to the transport; it now
    /// waits for its receipt until `now + response_timeout`.
    pub fn mark_dispatched(&self, message_id: &MessageId) -> Result<MessageStatus, EngineError> {
        let record = self.load(message_id)?;
        let dispatchable = record.direction == ExchangeDirection::Push
            && match record.status {
                MessageStatus::SendEnqueued | MessageStatus::WaitingForRetry => true,
                MessageStatus::WaitingForReceipt => record.receipt_deadline.is_none(),
                _ => false,
            };
        if !dispatchable {
            return Err(invalid(&record, "dispatch"));
        }
        let leg = self.leg_for(&record.pmode_key)?;
        let status = match leg.reliability.map(|c| c.pattern) {
            Some(ReplyPattern::Callback) => MessageStatus::WaitingForCallback,
            _ => MessageStatus::WaitingForReceipt,
        };
        let now = self.clock.now();
        let update = StatusUpdate {
            record: MessageRecord {
                status,
                receipt_deadline: Some(now.saturating_add(self.config.response_timeout_ms())),
                ..record.clone()
            },
            expected: record.status,
            claim: ClaimChange::Keep,
            require_claimed: false,
        };
        if !self.commit(&update, &status_change(&record, status))? {
            return Err(invalid(&record, "dispatch"));
        }
        debug!(message_id = %message_id, %status, "message dispatched");
        Ok(status)
    }

    /// Restores a failed message to its direction's waiting status and opens
    /// a fresh retry window.
    pub fn restore(&self, message_id: &MessageId) -> Result<MessageStatus, EngineError> {
        let record = self.load(message_id)?;
        if record.status != MessageStatus::SendFailure {
            return Err(invalid(&record, "restore"));
        }
        let leg = self.leg_for(&record.pmode_key)?;
        let now = self.clock.now();
        let status = restore_status_of(record.direction);
        let claim = match record.direction {
            ExchangeDirection::Pull => ClaimChange::Recreate { available_at: now },
            ExchangeDirection::Push => ClaimChange::Keep,
        };
        let update = StatusUpdate {
            record: MessageRecord {
                status,
                send_attempts_max: record
                    .send_attempts_max
                    .saturating_add(leg.retry.max_attempts),
                retry_timeout_ms: leg.retry.timeout_ms(),
                next_attempt: Some(now),
                restored_at: Some(now),
                receipt_deadline: None,
                ..record.clone()
            },
            expected: record.status,
            claim,
            require_claimed: false,
        };
        if !self.commit(&update, &status_change(&record, status))? {
            return Err(invalid(&record, "restore"));
        }
        info!(message_id = %message_id, %status, "message restored");
        Ok(status)
    }

    /// Marks a message `DELETED` and drops its claim. Returns `false` when
    /// it was already deleted.
    pub fn delete(&self, message_id: &MessageId) -> Result<bool, EngineError> {
        let record = self.load(message_id)?;
        match record.status {
            MessageStatus::Deleted => return Ok(false),
            MessageStatus::Acknowledged => return Err(invalid(&record, "delete")),
            _ => {}
        }
        let update = StatusUpdate {
            record: MessageRecord {
                status: MessageStatus::Deleted,
                receipt_deadline: None,
                ..record.clone()
            },
            expected: record.status,
            claim: ClaimChange::Remove,
            require_claimed: false,
        };
        if !self.commit(&update, &status_change(&record, MessageStatus::Deleted))? {
            return Err(invalid(&record, "delete"));
        }
        info!(message_id = %message_id, "message deleted");
        Ok(true)
    }

    fn expire(&self, record: &MessageRecord) -> Result<bool, EngineError> {
        let leg = match self.leg_for(&record.pmode_key) {
            Ok(leg) => leg,
            Err(err) => {
                warn!(message_id = %record.message_id, error = %err, "cannot expire message without its leg");
                return Ok(false);
            }
        };
        Ok(matches!(
            self.apply_outcome(record, &leg, ReliabilityOutcome::PullFailed)?,
            Applied::Changed
        ))
    }

    fn apply_outcome(
        &self,
        record: &MessageRecord,
        leg: &LegConfig,
        outcome: ReliabilityOutcome,
    ) -> Result<Applied, EngineError> {
        let now = self.clock.now();
        let state = RetryState::of(record);
        let decision = retry::decide(outcome, record.status, &state, &leg.retry, now);
        let pull = record.direction == ExchangeDirection::Pull;
        let id = &record.message_id;

        let mut next = record.clone();
        let mut events = Vec::new();
        let claim = match decision {
            RetryDecision::Unchanged => {
                debug!(message_id = %id, status = %record.status, "outcome on terminal message ignored");
                return Ok(Applied::Unchanged);
            }
            RetryDecision::Acknowledge => {
                next.status = MessageStatus::Acknowledged;
                next.receipt_deadline = None;
                events.push(Notification::Acknowledged(id.clone()));
                if pull {
                    ClaimChange::Remove
                } else {
                    ClaimChange::Keep
                }
            }
            RetryDecision::AwaitCallback => {
                let deadline = now.saturating_add(self.config.response_timeout_ms());
                if pull {
                    ClaimChange::Refresh {
                        stale_after: deadline,
                    }
                } else {
                    next.receipt_deadline = Some(deadline);
                    ClaimChange::Keep
                }
            }
            RetryDecision::Retry {
                attempts,
                next_attempt,
            } => {
                next.status = MessageStatus::WaitingForRetry;
                next.send_attempts = attempts;
                next.next_attempt = Some(next_attempt);
                next.receipt_deadline = None;
                if pull {
                    ClaimChange::Requeue {
                        available_at: next_attempt,
                    }
                } else {
                    ClaimChange::Keep
                }
            }
            RetryDecision::Fail { attempts } => {
                next.status = MessageStatus::SendFailure;
                next.send_attempts = attempts;
                next.receipt_deadline = None;
                events.push(Notification::TerminalFailure(id.clone()));
                if pull {
                    ClaimChange::Expire
                } else {
                    ClaimChange::Keep
                }
            }
        };
        if next.status != record.status {
            events.insert(
                0,
                Notification::StatusChange {
                    message_id: id.clone(),
                    from: record.status,
                    to: next.status,
                },
            );
        }

        let update = StatusUpdate {
            record: next,
            expected: record.status,
            claim,
            require_claimed: pull && record.status.is_awaiting_receipt(),
        };
        if !self.commit(&update, &events)? {
            return Ok(Applied::Lost);
        }
        match decision {
            RetryDecision::Retry {
                attempts,
                next_attempt,
            } => info!(message_id = %id, attempts, next_attempt, "retry scheduled"),
            RetryDecision::Fail { attempts } => {
                warn!(message_id = %id, attempts, "retries exhausted, message failed")
            }
            RetryDecision::Acknowledge => debug!(message_id = %id, "receipt accepted"),
            _ => debug!(message_id = %id, "waiting for callback receipt"),
        }
        Ok(Applied::Changed)
    }

    fn commit(&self, update: &StatusUpdate, events: &[Notification]) -> Result<bool, EngineError> {
        if !self.store.apply(update)? {
            return Ok(false);
        }
        self.emit(events);
        Ok(true)
    }

    fn emit(&self, events: &[Notification]) {
        for event in events {
            let result = match event {
                Notification::TerminalFailure(id) => self.notifier.notify_terminal_failure(id),
                Notification::Acknowledged(id) => self.notifier.notify_acknowledged(id),
                Notification::StatusChange {
                    message_id,
                    from,
                    to,
                } => self.notifier.notify_status_change(message_id, *from, *to),
            };
            if let Err(err) = result {
                warn!(error = %err, ?event, "notification failed");
            }
        }
    }

    fn load(&self, message_id: &MessageId) -> Result<MessageRecord, EngineError> {
        self.store
            .message(message_id)?
            .ok_or_else(|| EngineError::UnknownMessage(message_id.clone()))
    }

    fn leg_for(&self, key: &PModeKey) -> Result<LegConfig, EngineError> {
        self.pmodes.resolve_leg(key).map_err(config_error)
    }
}

fn config_error(err: PModeError) -> EngineError {
    match err {
        PModeError::NoMatchingConfiguration(what) => EngineError::Configuration(what),
        other => EngineError::Configuration(other.to_string()),
    }
}

fn invalid(record: &MessageRecord, action: &'static str) -> EngineError {
    EngineError::InvalidTransition {
        message_id: record.message_id.clone(),
        status: record.status,
        action,
    }
}

fn status_change(record: &MessageRecord, to: MessageStatus) -> [Notification; 1] {
    [Notification::StatusChange {
        message_id: record.message_id.clone(),
        from: record.status,
        to,
    }]
}
