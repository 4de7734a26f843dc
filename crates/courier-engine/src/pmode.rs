use std::collections::HashSet;
use std::fs;
use std::path::Path;

use courier_core::{Channel, ExchangeDirection, PModeKey, PartyId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reliability::ReliabilityContract;
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum PModeError {
    #[error("no matching configuration for {0}")]
    NoMatchingConfiguration(String),
    #[error("invalid pmode catalogue: {0}")]
    Invalid(String),
    #[error("failed to read pmode catalogue: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse pmode catalogue: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Resolved business exchange. Derived from configuration on every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExchangeContext {
    pub pmode_key: PModeKey,
    pub initiator: PartyId,
    pub responder: PartyId,
    pub channel: Channel,
    pub direction: ExchangeDirection,
}

/// Rules governing one direction of a business process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegConfig {
    pub name: String,
    pub direction: ExchangeDirection,
    /// `None` means the leg expects no receipt at all.
    #[serde(default)]
    pub reliability: Option<ReliabilityContract>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub key: PModeKey,
    pub initiator: PartyId,
    pub responder: PartyId,
    pub channel: Channel,
    pub leg: LegConfig,
}

impl ProcessConfig {
    pub fn context(&self) -> ExchangeContext {
        ExchangeContext {
            pmode_key: self.key.clone(),
            initiator: self.initiator.clone(),
            responder: self.responder.clone(),
            channel: self.channel.clone(),
            direction: self.leg.direction,
        }
    }
}

/// Read-only processing-mode lookups used by the coordinator.
pub trait PModeProvider: Send + Sync {
    fn resolve_leg(&self, key: &PModeKey) -> Result<LegConfig, PModeError>;
    fn find_process(&self, channel: &Channel) -> Result<ExchangeContext, PModeError>;
    fn context_for(&self, key: &PModeKey) -> Result<ExchangeContext, PModeError>;
}

#[derive(Debug, Default, Deserialize)]
struct Catalogue {
    #[serde(default, rename = "process")]
    processes: Vec<ProcessConfig>,
}

/// PMode provider backed by a TOML catalogue loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticPModeProvider {
    processes: Vec<ProcessConfig>,
}

impl StaticPModeProvider {
    pub fn new(processes: Vec<ProcessConfig>) -> Result<Self, PModeError> {
        validate(&processes)?;
        Ok(Self { processes })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, PModeError> {
        let catalogue: Catalogue = toml::from_str(raw)?;
        Self::new(catalogue.processes)
    }

    pub fn load(path: &Path) -> Result<Self, PModeError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn processes(&self) -> &[ProcessConfig] {
        &self.processes
    }

    /// Channels this node pulls from `responder` on.
    pub fn pull_channels(&self, responder: &PartyId) -> Vec<Channel> {
        self.processes
            .iter()
            .filter(|p| p.leg.direction == ExchangeDirection::Pull && &p.responder == responder)
            .map(|p| p.channel.clone())
            .collect()
    }

    fn by_key(&self, key: &PModeKey) -> Result<&ProcessConfig, PModeError> {
        self.processes
            .iter()
            .find(|p| &p.key == key)
            .ok_or_else(|| PModeError::NoMatchingConfiguration(format!("pmode key {key}")))
    }
}

impl PModeProvider for StaticPModeProvider {
    fn resolve_leg(&self, key: &PModeKey) -> Result<LegConfig, PModeError> {
        self.by_key(key).map(|p| p.leg.clone())
    }

    fn find_process(&self, channel: &Channel) -> Result<ExchangeContext, PModeError> {
        self.processes
            .iter()
            .find(|p| &p.channel == channel)
            .map(ProcessConfig::context)
            .ok_or_else(|| PModeError::NoMatchingConfiguration(format!("channel {channel}")))
    }

    fn context_for(&self, key: &PModeKey) -> Result<ExchangeContext, PModeError> {
        self.by_key(key).map(ProcessConfig::context)
    }
}

fn validate(processes: &[ProcessConfig]) -> Result<(), PModeError> {
    let mut keys = HashSet::new();
    let mut channels = HashSet::new();
    for process in processes {
        let blank = [
            process.key.as_str(),
            process.initiator.as_str(),
            process.responder.as_str(),
            process.channel.as_str(),
        ]
        .iter()
        .any(|v| v.trim().is_empty());
        if blank {
            return Err(PModeError::Invalid(format!(
                "process {:?} has a blank identifier",
                process.key.as_str()
            )));
        }
        if !keys.insert(process.key.as_str()) {
            return Err(PModeError::Invalid(format!("duplicate key {}", process.key)));
        }
        if !channels.insert(process.channel.as_str()) {
            return Err(PModeError::Invalid(format!(
                "channel {} is used by more than one process",
                process.channel
            )));
        }
        if process.leg.retry.max_attempts == 0 {
            return Err(PModeError::Invalid(format!(
                "process {} allows no attempts",
                process.key
            )));
        }
    }
    Ok(())
}
