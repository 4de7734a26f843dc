use std::time::Duration;

use courier_core::{NodeId, DEFAULT_CHANNEL_SEPARATOR};

use crate::pacing::PacingConfig;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Recorded as `claimed_by` on every claim this node takes.
    pub node_id: NodeId,
    /// How long a claimed or dispatched message waits for its receipt.
    pub response_timeout: Duration,
    /// Separator between a base channel and its sub-channel suffix.
    pub channel_separator: char,
    /// Upper bound of rows handled per scanner pass.
    pub scan_batch: usize,
    /// Pull pacing applied to every responder.
    pub pacing: PacingConfig,
}

impl EngineConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            response_timeout: Duration::from_secs(60),
            channel_separator: DEFAULT_CHANNEL_SEPARATOR,
            scan_batch: 256,
            pacing: PacingConfig::default(),
        }
    }

    pub fn response_timeout_ms(&self) -> u64 {
        u64::try_from(self.response_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}
