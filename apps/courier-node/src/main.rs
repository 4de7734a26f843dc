use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod config;
mod http_server;
mod jobs;
mod logger;

use courier_core::{CoreError, SystemClock};
use courier_engine::{
    Coordinator, ExchangeDriver, LoggingSink, PModeError, ProcessConfig, StaticPModeProvider,
};
use courier_store::{SqliteStore, StoreError};
use courier_transport::spool::{SpoolError, SpoolTransport};

use crate::config::NodeConfig;
use crate::http_server::NodeAppState;
use crate::jobs::{JobIntervals, NodeMetrics};
use crate::logger::{LogBuffer, LogBufferLayer};

const LOG_BUFFER_SIZE: usize = 500;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (.toml, .yaml, .json or .env)
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the courier node (default)
    Run,
    /// Load the configuration and the PMode catalogue, then exit
    CheckConfig,
    /// Print the loaded PMode catalogue
    Pmode,
}

#[derive(Debug, Error)]
enum StartupError {
    #[error("config: {0}")]
    Config(#[from] ::config::ConfigError),
    #[error("invalid identifier in config: {0}")]
    Identifier(#[from] CoreError),
    #[error("pmode catalogue: {0}")]
    PMode(#[from] PModeError),
    #[error("message store: {0}")]
    Store(#[from] StoreError),
    #[error("spool: {0}")]
    Spool(#[from] SpoolError),
    #[error("health address {0:?} is not a socket address")]
    BindAddress(String),
    #[error("health server bind failed: {0}")]
    Bind(std::io::Error),
    #[error("catalogue encoding: {0}")]
    Encode(#[from] toml::ser::Error),
}

#[derive(Serialize)]
struct CatalogueOut<'a> {
    process: &'a [ProcessConfig],
}

fn init_tracing(buffer: Arc<LogBuffer>) {
    let filter = std::env::var("COURIER_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .with(LogBufferLayer::new(buffer))
        .init();
}

fn load(cli_config: Option<PathBuf>) -> Result<(NodeConfig, StaticPModeProvider), StartupError> {
    let config = NodeConfig::new(cli_config)?;
    // Surface identifier errors before anything is opened.
    config.engine_config()?;
    config.responders()?;
    let pmodes = StaticPModeProvider::load(&config.pmode_path)?;
    Ok((config, pmodes))
}

#[tokio::main]
async fn main() {
    let log_buffer = Arc::new(LogBuffer::with_capacity(LOG_BUFFER_SIZE));
    init_tracing(Arc::clone(&log_buffer));

    let cli = Cli::parse();

    let (config, pmodes) = match load(cli.config) {
        Ok(loaded) => loaded,
        Err(err) => {
            error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };

    match cli.command {
        Some(Commands::CheckConfig) => {
            info!(
                node_id = %config.node_id,
                processes = pmodes.processes().len(),
                "configuration ok"
            );
            println!("ok");
        }
        Some(Commands::Pmode) => {
            let catalogue = CatalogueOut {
                process: pmodes.processes(),
            };
            match toml::to_string_pretty(&catalogue) {
                Ok(out) => print!("{out}"),
                Err(err) => {
                    error!("{}", StartupError::from(err));
                    std::process::exit(1);
                }
            }
        }
        Some(Commands::Run) | None => {
            if let Err(err) = run(config, pmodes, log_buffer).await {
                error!("courier node failed: {err}");
                std::process::exit(1);
            }
        }
    }
}

async fn run(
    config: NodeConfig,
    pmodes: StaticPModeProvider,
    log_buffer: Arc<LogBuffer>,
) -> Result<(), StartupError> {
    let engine = config.engine_config()?;
    let responders = config.responders()?;
    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    store.set_busy_timeout(config.db_busy_timeout)?;
    let spool = SpoolTransport::open(&config.spool_dir)?;
    info!(
        node_id = %engine.node_id,
        db = %config.db_path.display(),
        spool = %config.spool_dir.display(),
        "courier node starting"
    );

    let targets = jobs::pull_targets(&pmodes, &responders);
    if targets.is_empty() && !responders.is_empty() {
        warn!("no pull processes in the catalogue match the configured responders");
    }

    let coordinator = Arc::new(Coordinator::new(
        engine,
        store,
        Arc::new(pmodes),
        Arc::new(LoggingSink),
        Arc::new(SystemClock),
    ));
    let driver = Arc::new(Mutex::new(ExchangeDriver::new(
        Arc::clone(&coordinator),
        spool,
    )));
    let metrics = Arc::new(NodeMetrics::default());

    let handles = jobs::spawn_jobs(
        Arc::clone(&coordinator),
        driver,
        targets,
        Arc::clone(&metrics),
        JobIntervals {
            retry_scan: config.retry_scan_interval,
            expiry_scan: config.expiry_scan_interval,
            pull_job: config.pull_job_interval,
            inbound_poll: config.inbound_poll_interval,
        },
    );

    let bind = format!("{}:{}", config.health_bind, config.health_port);
    let bind_addr: SocketAddr = bind
        .parse()
        .map_err(|_| StartupError::BindAddress(bind.clone()))?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(StartupError::Bind)?;
    let router = http_server::build_router(NodeAppState {
        coordinator,
        metrics,
        log_buffer,
    });
    info!("health server listening on {bind_addr}");
    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            error!("health server error: {err}");
        }
    });

    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = flag::register(SIGTERM, Arc::clone(&shutdown));
    let _ = flag::register(SIGINT, Arc::clone(&shutdown));

    while !shutdown.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    info!("shutdown requested");
    for handle in handles {
        handle.abort();
    }
    server.abort();
    Ok(())
}
