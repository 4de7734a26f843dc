use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier_core::{Channel, PartyId};
use courier_engine::{Coordinator, ExchangeDriver, StaticPModeProvider};
use courier_transport::adapter::MessageTransport;
use courier_transport::spool::SpoolTransport;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Counters updated by the periodic jobs and served on `/metrics`.
#[derive(Default)]
pub struct NodeMetrics {
    pub dispatched: AtomicU64,
    pub claims_expired: AtomicU64,
    pub receipts_expired: AtomicU64,
    pub pulls_sent: AtomicU64,
    pub inbound_envelopes: AtomicU64,
    pub job_errors: AtomicU64,
    pub spool_send_ok: AtomicU64,
    pub spool_send_err: AtomicU64,
}

pub type SharedDriver = Arc<Mutex<ExchangeDriver<SpoolTransport>>>;

pub struct JobIntervals {
    pub retry_scan: Duration,
    pub expiry_scan: Duration,
    pub pull_job: Duration,
    pub inbound_poll: Duration,
}

/// `(responder, channel)` pairs this node pulls from.
pub fn pull_targets(
    pmodes: &StaticPModeProvider,
    responders: &[PartyId],
) -> Vec<(PartyId, Channel)> {
    responders
        .iter()
        .flat_map(|responder| {
            pmodes
                .pull_channels(responder)
                .into_iter()
                .map(move |channel| (responder.clone(), channel))
        })
        .collect()
}

/// Runs one retry scan: due pull messages become claimable again and due
/// push messages are dispatched.
pub fn retry_scan(driver: &SharedDriver, metrics: &NodeMetrics) {
    let mut driver = driver.lock().unwrap_or_else(|e| e.into_inner());
    match driver.dispatch_due() {
        Ok(sent) => {
            metrics.dispatched.fetch_add(sent as u64, Ordering::Relaxed);
            record_spool_health(driver.transport_mut(), metrics);
        }
        Err(err) => {
            metrics.job_errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %err, "retry scan failed");
        }
    }
}

pub fn expiry_scan(coordinator: &Coordinator, metrics: &NodeMetrics) {
    match coordinator.expire_stale_claims() {
        Ok(0) => {}
        Ok(n) => {
            info!(expired = n, "stale claims expired");
            metrics.claims_expired.fetch_add(n as u64, Ordering::Relaxed);
        }
        Err(err) => {
            metrics.job_errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %err, "claim expiry scan failed");
        }
    }
    match coordinator.expire_overdue_receipts() {
        Ok(0) => {}
        Ok(n) => {
            info!(expired = n, "overdue receipts expired");
            metrics.receipts_expired.fetch_add(n as u64, Ordering::Relaxed);
        }
        Err(err) => {
            metrics.job_errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %err, "receipt timeout scan failed");
        }
    }
}

pub fn pull_cycle(driver: &SharedDriver, targets: &[(PartyId, Channel)], metrics: &NodeMetrics) {
    if targets.is_empty() {
        return;
    }
    let mut driver = driver.lock().unwrap_or_else(|e| e.into_inner());
    let sent = driver.initiate_pulls(targets);
    debug!(sent, "pull cycle");
    metrics.pulls_sent.fetch_add(sent as u64, Ordering::Relaxed);
    record_spool_health(driver.transport_mut(), metrics);
}

pub fn inbound_poll(driver: &SharedDriver, metrics: &NodeMetrics) {
    let mut driver = driver.lock().unwrap_or_else(|e| e.into_inner());
    let processed = driver.pump_inbound();
    if processed > 0 {
        debug!(processed, "inbound envelopes handled");
        metrics
            .inbound_envelopes
            .fetch_add(processed as u64, Ordering::Relaxed);
    }
}

fn record_spool_health(transport: &SpoolTransport, metrics: &NodeMetrics) {
    let health = transport.health_snapshot();
    metrics
        .spool_send_ok
        .store(health.outbound_send_ok, Ordering::Relaxed);
    metrics
        .spool_send_err
        .store(health.outbound_send_err, Ordering::Relaxed);
}

fn every<F>(period: Duration, job: F) -> JoinHandle<()>
where
    F: Fn() + Clone + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let job = job.clone();
            // Store calls block on SQLite.
            if let Err(err) = tokio::task::spawn_blocking(move || job()).await {
                error!(error = %err, "periodic job panicked");
            }
        }
    })
}

/// Spawns the retry scanner, the expiry scanner, the pull job and the
/// inbound poller. Abort the returned handles to stop them.
pub fn spawn_jobs(
    coordinator: Arc<Coordinator>,
    driver: SharedDriver,
    targets: Vec<(PartyId, Channel)>,
    metrics: Arc<NodeMetrics>,
    intervals: JobIntervals,
) -> Vec<JoinHandle<()>> {
    let targets = Arc::new(targets);
    let mut handles = Vec::new();

    {
        let (driver, metrics) = (Arc::clone(&driver), Arc::clone(&metrics));
        handles.push(every(intervals.retry_scan, move || {
            retry_scan(&driver, &metrics)
        }));
    }
    {
        let (coordinator, metrics) = (Arc::clone(&coordinator), Arc::clone(&metrics));
        handles.push(every(intervals.expiry_scan, move || {
            expiry_scan(&coordinator, &metrics)
        }));
    }
    {
        let (driver, metrics) = (Arc::clone(&driver), Arc::clone(&metrics));
        handles.push(every(intervals.pull_job, move || {
            pull_cycle(&driver, &targets, &metrics)
        }));
    }
    handles.push(every(intervals.inbound_poll, move || {
        inbound_poll(&driver, &metrics)
    }));
    handles
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    use courier_core::{MessageId, MessageStatus, NodeId, PModeKey, PartyId, SystemClock};
    use courier_engine::{
        Coordinator, EngineConfig, ExchangeDriver, LoggingSink, StaticPModeProvider, Submission,
    };
    use courier_store::SqliteStore;
    use courier_transport::spool::SpoolTransport;

    use super::{expiry_scan, pull_cycle, pull_targets, retry_scan, NodeMetrics, SharedDriver};

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
key = "order-push"
initiator = "party-b"
responder = "party-a"
channel = "mpc/orders"

[process.leg]
name = "order"
direction = "push"
retry = { timeout = "10m", max_attempts = 3 }
"#;

    fn setup(dir: &std::path::Path) -> (Arc<Coordinator>, SharedDriver, StaticPModeProvider) {
        let pmodes = StaticPModeProvider::from_toml_str(CATALOGUE).expect("catalogue");
        let coordinator = Arc::new(Coordinator::new(
            EngineConfig::new(NodeId::new("node-1").expect("node")),
            Arc::new(SqliteStore::open(&dir.join("courier.db")).expect("store")),
            Arc::new(pmodes.clone()),
            Arc::new(LoggingSink),
            Arc::new(SystemClock),
        ));
        let spool = SpoolTransport::open(dir.join("spool")).expect("spool");
        let driver = Arc::new(Mutex::new(ExchangeDriver::new(Arc::clone(&coordinator), spool)));
        (coordinator, driver, pmodes)
    }

    #[test]
    fn pull_targets_follow_the_catalogue() {
        let pmodes = StaticPModeProvider::from_toml_str(CATALOGUE).expect("catalogue");
        let targets = pull_targets(&pmodes, &[PartyId::new("party-a").expect("party")]);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].1.as_str(), "mpc/invoices");
        assert!(pull_targets(&pmodes, &[PartyId::new("party-z").expect("party")]).is_empty());
    }

    #[test]
    fn jobs_dispatch_and_pull_through_the_spool() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (coordinator, driver, pmodes) = setup(dir.path());
        let metrics = NodeMetrics::default();

        coordinator
            .submit(Submission {
                message_id: MessageId::new("o-1").expect("id"),
                pmode_key: PModeKey::new("order-push").expect("key"),
                channel: None,
            })
            .expect("submit");
        retry_scan(&driver, &metrics);
        assert_eq!(metrics.dispatched.load(Ordering::Relaxed), 1);
        assert_eq!(
            coordinator
                .store()
                .message(&MessageId::new("o-1").expect("id"))
                .expect("read")
                .expect("record")
                .status,
            MessageStatus::WaitingForReceipt
        );

        let targets = pull_targets(&pmodes, &[PartyId::new("party-a").expect("party")]);
        pull_cycle(&driver, &targets, &metrics);
        assert_eq!(metrics.pulls_sent.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.spool_send_ok.load(Ordering::Relaxed), 2);

        let outbox = dir.path().join("spool").join("outbox").join("party-a");
        assert_eq!(std::fs::read_dir(outbox).expect("outbox").count(), 2);

        expiry_scan(&coordinator, &metrics);
        assert_eq!(metrics.job_errors.load(Ordering::Relaxed), 0);
    }
}
