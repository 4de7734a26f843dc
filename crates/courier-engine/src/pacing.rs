//! Adaptive per-responder pacing of outbound pull requests.
//!
//! A responder starts at full pace. Reaching the error threshold drops it to
//! one request per cycle; after the next success the pace ramps back up by
//! at most one step per second until it reaches the configured maximum.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use courier_core::{Clock, PartyId, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const RAMP_STEP_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingConfig {
    pub max_requests_per_cycle: u32,
    /// Seconds needed to ramp from one request back to the maximum; `0`
    /// disables the error-driven slowdown.
    pub recovering_time_secs: u32,
    pub error_threshold: u32,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            max_requests_per_cycle: 1,
            recovering_time_secs: 0,
            error_threshold: 10,
        }
    }
}

/// Point-in-time view of one responder's pacing counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacingSnapshot {
    pub responder: PartyId,
    pub max_requests_per_cycle: u32,
    pub current_pace: u32,
    pub error_count: u32,
    pub ramp_step: u32,
    pub low_capacity: bool,
    pub full_capacity: bool,
}

/// Pacing counters of one responder. Safe to share between threads.
#[derive(Debug)]
pub struct ResponderPullFrequency {
    config: PacingConfig,
    current_pace: AtomicU32,
    error_count: AtomicU32,
    ramp_step: AtomicU32,
    last_ramp_ms: AtomicU64,
    low_capacity: AtomicBool,
    full_capacity: AtomicBool,
}

impl ResponderPullFrequency {
    pub fn new(config: PacingConfig) -> Self {
        let config = PacingConfig {
            max_requests_per_cycle: config.max_requests_per_cycle.max(1),
            ..config
        };
        Self {
            current_pace: AtomicU32::new(config.max_requests_per_cycle),
            error_count: AtomicU32::new(0),
            ramp_step: AtomicU32::new(0),
            last_ramp_ms: AtomicU64::new(0),
            low_capacity: AtomicBool::new(false),
            full_capacity: AtomicBool::new(true),
            config,
        }
    }

    pub fn config(&self) -> PacingConfig {
        self.config
    }

    pub fn on_success(&self) {
        self.low_capacity.store(false, Ordering::SeqCst);
        self.error_count.store(0, Ordering::SeqCst);
    }

    /// Counts one error. Returns `true` when this error dropped the
    /// responder to low capacity.
    pub fn on_error(&self) -> bool {
        if self.config.recovering_time_secs == 0 || self.low_capacity.load(Ordering::SeqCst) {
            return false;
        }
        let errors = self.error_count.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if errors < self.config.error_threshold {
            return false;
        }
        // Only the caller that flips the flag resets the ramp.
        if self
            .low_capacity
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.current_pace.store(1, Ordering::SeqCst);
        self.ramp_step.store(0, Ordering::SeqCst);
        self.last_ramp_ms.store(0, Ordering::SeqCst);
        self.full_capacity.store(false, Ordering::SeqCst);
        true
    }

    /// Pull requests to issue in the current cycle, always in
    /// `[1, max_requests_per_cycle]`.
    pub fn requests_this_cycle(&self, now: Timestamp) -> u32 {
        let max = self.config.max_requests_per_cycle;
        if self.low_capacity.load(Ordering::SeqCst) {
            return 1;
        }
        if self.config.recovering_time_secs == 0 || self.full_capacity.load(Ordering::SeqCst) {
            return max;
        }

        let last = self.last_ramp_ms.load(Ordering::SeqCst);
        let due = last == 0 || now >= last.saturating_add(RAMP_STEP_MS);
        if due
            && self
                .last_ramp_ms
                .compare_exchange(last, now.max(1), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let step = self.ramp_step.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            let pace = ramp_pace(step, max, self.config.recovering_time_secs);
            self.current_pace.store(pace, Ordering::SeqCst);
            if pace >= max {
                self.full_capacity.store(true, Ordering::SeqCst);
            }
        }
        self.current_pace.load(Ordering::SeqCst).clamp(1, max)
    }

    pub fn snapshot(&self, responder: PartyId) -> PacingSnapshot {
        PacingSnapshot {
            responder,
            max_requests_per_cycle: self.config.max_requests_per_cycle,
            current_pace: self.current_pace.load(Ordering::SeqCst),
            error_count: self.error_count.load(Ordering::SeqCst),
            ramp_step: self.ramp_step.load(Ordering::SeqCst),
            low_capacity: self.low_capacity.load(Ordering::SeqCst),
            full_capacity: self.full_capacity.load(Ordering::SeqCst),
        }
    }
}

/// `step * max / recovering + 1`, clamped to `[1, max]`.
fn ramp_pace(step: u32, max: u32, recovering_time_secs: u32) -> u32 {
    let raw = u64::from(step) * u64::from(max) / u64::from(recovering_time_secs.max(1)) + 1;
    u32::try_from(raw).unwrap_or(u32::MAX).clamp(1, max)
}

/// Pacing state of every responder this process pulls from.
///
/// Entries are created on first use and live for the process lifetime.
pub struct PullFrequencyRegistry {
    config: PacingConfig,
    entries: RwLock<HashMap<PartyId, Arc<ResponderPullFrequency>>>,
    clock: Arc<dyn Clock>,
}

impl PullFrequencyRegistry {
    pub fn new(config: PacingConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn get(&self, responder: &PartyId) -> Arc<ResponderPullFrequency> {
        if let Some(entry) = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(responder)
        {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let config = self.config;
        Arc::clone(
            entries
                .entry(responder.clone())
                .or_insert_with(|| Arc::new(ResponderPullFrequency::new(config))),
        )
    }

    pub fn requests_this_cycle(&self, responder: &PartyId) -> u32 {
        self.get(responder).requests_this_cycle(self.clock.now())
    }

    pub fn on_success(&self, responder: &PartyId) {
        let entry = self.get(responder);
        if entry.snapshot(responder.clone()).low_capacity {
            info!(responder = %responder, "responder recovered, ramping pull pace");
        }
        entry.on_success();
    }

    pub fn on_error(&self, responder: &PartyId) {
        if self.get(responder).on_error() {
            warn!(responder = %responder, "error threshold reached, pull pace reset to 1");
        }
    }

    /// Snapshots of every known responder, sorted by responder id.
    pub fn snapshot(&self) -> Vec<PacingSnapshot> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = entries
            .iter()
            .map(|(responder, entry)| entry.snapshot(responder.clone()))
            .collect();
        out.sort_by(|a, b| a.responder.cmp(&b.responder));
        out
    }
}
