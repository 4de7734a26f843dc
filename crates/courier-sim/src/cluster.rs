use std::path::{Path, PathBuf};
use std::sync::Arc;

use courier_core::{CoreError, ManualClock, MessageId, NodeId, PModeKey, Timestamp};
use courier_engine::{
    Coordinator, EngineConfig, EngineError, PModeError, RecordingSink, StaticPModeProvider,
    Submission,
};
use courier_store::{MessageRecord, SqliteStore, StoreError};
use tempfile::TempDir;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    PMode(#[from] PModeError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// A set of simulated nodes sharing one SQLite file, one clock and one
/// notification sink.
pub struct SimCluster {
    _dir: TempDir,
    db_path: PathBuf,
    clock: ManualClock,
    pmodes: Arc<StaticPModeProvider>,
    sink: Arc<RecordingSink>,
}

impl SimCluster {
    pub fn new(catalogue: &str, start: Timestamp) -> Result<Self, SimError> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("courier.db");
        // Create the schema once so node connections never race on it.
        SqliteStore::open(&db_path)?;
        Ok(Self {
            _dir: dir,
            db_path,
            clock: ManualClock::starting_at(start),
            pmodes: Arc::new(StaticPModeProvider::from_toml_str(catalogue)?),
            sink: Arc::new(RecordingSink::new()),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn sink(&self) -> &RecordingSink {
        &self.sink
    }

    /// Node with its own connection to the shared database.
    pub fn node(&self, name: &str) -> Result<Coordinator, SimError> {
        let store = SqliteStore::open(&self.db_path)?;
        Ok(self.coordinator(name, store)?)
    }

    /// Node with a private in-memory database, e.g. an initiator that only
    /// pulls.
    pub fn standalone_node(&self, name: &str) -> Result<Coordinator, SimError> {
        let store = SqliteStore::open_in_memory()?;
        Ok(self.coordinator(name, store)?)
    }

    /// Submits `message_id` through `node` with the leg's own channel.
    pub fn submit(
        &self,
        node: &Coordinator,
        message_id: &str,
        pmode: &str,
    ) -> Result<MessageRecord, SimError> {
        Ok(node.submit(Submission {
            message_id: MessageId::new(message_id)?,
            pmode_key: PModeKey::new(pmode)?,
            channel: None,
        })?)
    }

    fn coordinator(&self, name: &str, store: SqliteStore) -> Result<Coordinator, CoreError> {
        Ok(Coordinator::new(
            EngineConfig::new(NodeId::new(name)?),
            Arc::new(store),
            self.pmodes.clone(),
            self.sink.clone(),
            Arc::new(self.clock.clone()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{MessageId, MessageStatus};

    use super::SimCluster;
    use crate::scenarios::SAMPLE_CATALOGUE;

    #[test]
    fn nodes_see_the_same_messages() {
        let cluster = SimCluster::new(SAMPLE_CATALOGUE, 1_000).expect("cluster");
        let a = cluster.node("node-a").expect("node a");
        let b = cluster.node("node-b").expect("node b");

        cluster.submit(&a, "m-1", "invoice-pull").expect("submit");
        let seen = b
            .store()
            .message(&MessageId::new("m-1").expect("id"))
            .expect("read")
            .expect("record");
        assert_eq!(seen.status, MessageStatus::ReadyToPull);
    }
}
