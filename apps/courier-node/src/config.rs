use config::{Config, ConfigError, Environment, File};
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use courier_core::{CoreError, NodeId, PartyId};
use courier_engine::{EngineConfig, PacingConfig};

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub db_path: PathBuf,
    #[serde(with = "humantime_serde")]
    pub db_busy_timeout: Duration,
    pub pmode_path: PathBuf,
    pub spool_dir: PathBuf,
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_scan_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub expiry_scan_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub pull_job_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub inbound_poll_interval: Duration,
    pub scan_batch: usize,
    pub health_bind: String,
    pub health_port: u16,
    pub pull_max_requests_per_cycle: u32,
    pub pull_recovering_time_secs: u32,
    pub pull_error_threshold: u32,
    #[serde(deserialize_with = "deserialize_list")]
    pub pull_responders: Vec<String>,
}

fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ListVisitor;

    impl<'de> Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(split_list(value))
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(element) = seq.next_element()? {
                vec.push(element);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c| c == ',' || c == ';')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl NodeConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("node_id", "courier-node-1")?
            .set_default("db_path", "data/courier.db")?
            .set_default("db_busy_timeout", "5s")?
            .set_default("pmode_path", "config/pmodes.toml")?
            .set_default("spool_dir", "data/spool")?
            .set_default("response_timeout", "60s")?
            .set_default("retry_scan_interval", "5s")?
            .set_default("expiry_scan_interval", "10s")?
            .set_default("pull_job_interval", "2s")?
            .set_default("inbound_poll_interval", "250ms")?
            .set_default("scan_batch", 256)?
            .set_default("health_bind", "127.0.0.1")?
            .set_default("health_port", 9190)?
            .set_default("pull_max_requests_per_cycle", 1)?
            .set_default("pull_recovering_time_secs", 0)?
            .set_default("pull_error_threshold", 10)?
            .set_default("pull_responders", Vec::<String>::new())?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                // Loaded into the process environment so the prefixed source below sees it.
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("COURIER").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    pub fn pacing(&self) -> PacingConfig {
        PacingConfig {
            max_requests_per_cycle: self.pull_max_requests_per_cycle,
            recovering_time_secs: self.pull_recovering_time_secs,
            error_threshold: self.pull_error_threshold,
        }
    }

    pub fn engine_config(&self) -> Result<EngineConfig, CoreError> {
        let mut engine = EngineConfig::new(NodeId::new(self.node_id.as_str())?);
        engine.response_timeout = self.response_timeout;
        engine.scan_batch = self.scan_batch.max(1);
        engine.pacing = self.pacing();
        Ok(engine)
    }

    pub fn responders(&self) -> Result<Vec<PartyId>, CoreError> {
        self.pull_responders
            .iter()
            .map(|r| PartyId::new(r.as_str()))
            .collect()
    }
}
