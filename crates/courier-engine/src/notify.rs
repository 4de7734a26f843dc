use std::sync::Mutex;

use courier_core::{MessageId, MessageStatus};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification sink unavailable: {0}")]
    Unavailable(String),
}

/// Downstream listener for message lifecycle events.
///
/// Called after the status write committed. Errors are logged by the
/// caller and never undo the transition.
pub trait NotificationSink: Send + Sync {
    fn notify_terminal_failure(&self, message_id: &MessageId) -> Result<(), NotifyError>;
    fn notify_acknowledged(&self, message_id: &MessageId) -> Result<(), NotifyError>;
    fn notify_status_change(
        &self,
        message_id: &MessageId,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    TerminalFailure(MessageId),
    Acknowledged(MessageId),
    StatusChange {
        message_id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
    },
}

/// Sink that only writes lifecycle events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl NotificationSink for LoggingSink {
    fn notify_terminal_failure(&self, message_id: &MessageId) -> Result<(), NotifyError> {
        info!(message_id = %message_id, "message failed permanently");
        Ok(())
    }

    fn notify_acknowledged(&self, message_id: &MessageId) -> Result<(), NotifyError> {
        info!(message_id = %message_id, "message acknowledged");
        Ok(())
    }

    fn notify_status_change(
        &self,
        message_id: &MessageId,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<(), NotifyError> {
        tracing::debug!(message_id = %message_id, %from, %to, "status changed");
        Ok(())
    }
}

/// In-memory sink for tests and simulations.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Notification>>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that records events and then reports every call as failed.
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn terminal_failures(&self) -> Vec<MessageId> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Notification::TerminalFailure(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn acknowledged(&self) -> Vec<MessageId> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Notification::Acknowledged(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: Notification) -> Result<(), NotifyError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        if self.fail {
            return Err(NotifyError::Unavailable("recording sink set to fail".into()));
        }
        Ok(())
    }
}

impl NotificationSink for RecordingSink {
    fn notify_terminal_failure(&self, message_id: &MessageId) -> Result<(), NotifyError> {
        self.record(Notification::TerminalFailure(message_id.clone()))
    }

    fn notify_acknowledged(&self, message_id: &MessageId) -> Result<(), NotifyError> {
        self.record(Notification::Acknowledged(message_id.clone()))
    }

    fn notify_status_change(
        &self,
        message_id: &MessageId,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<(), NotifyError> {
        self.record(Notification::StatusChange {
            message_id: message_id.clone(),
            from,
            to,
        })
    }
}
