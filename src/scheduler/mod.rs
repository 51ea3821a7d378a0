//! Scheduler module for discovering peers and dispatching their checks.

mod discovery;
mod identity;

pub use discovery::*;
pub use identity::*;

use crate::config::ServerConfig;
use crate::db::{CheckStatus, CheckType, DbError, Host, HostFilter, Network, NewCheck, Store};
use crate::probe::Prober;
use crate::protocol::IdentityDocument;

use futures::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio::task::JoinHandle;

/// Consecutive failed storage writes after which the scheduler gives up.
pub const STORAGE_FAILURE_LIMIT: u32 = 5;

const IDENTITY_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);
const MAX_JITTER_MS: u64 = 100;

/// Scheduler error types.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("{failures} consecutive storage failures, last: {last}")]
    Storage { failures: u32, last: String },
}

/// The scheduler that keeps the host set current and checks every peer.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

struct Shared {
    config: ServerConfig,
    store: Store,
    prober: Prober,
    discoverer: Discoverer,
    semaphore: Arc<Semaphore>,
    in_flight: Mutex<HashSet<i64>>,
    storage_failures: AtomicU32,
    last_storage_error: Mutex<String>,
    fatal: Notify,
}

/// Marks a host as having a job in flight until dropped.
struct InFlight {
    shared: Arc<Shared>,
    host_id: i64,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.shared.in_flight.lock().remove(&self.host_id);
    }
}

impl Scheduler {
    /// Create a new scheduler over the given store and prober.
    pub fn new(config: ServerConfig, store: Store, prober: Prober) -> Self {
        let discoverer = Discoverer::new(
            store.clone(),
            prober.clone(),
            config.discovery.clone(),
            config.service_port,
        );
        let semaphore = Arc::new(Semaphore::new(config.parallel_checks.max(1)));

        Self {
            shared: Arc::new(Shared {
                config,
                store,
                prober,
                discoverer,
                semaphore,
                in_flight: Mutex::new(HashSet::new()),
                storage_failures: AtomicU32::new(0),
                last_storage_error: Mutex::new(String::new()),
                fatal: Notify::new(),
            }),
        }
    }

    /// Spawn the scheduler loop.
    pub fn start(&self, stop: broadcast::Receiver<()>) -> JoinHandle<Result<(), SchedulerError>> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run(stop).await })
    }

    /// Tick immediately, then every check interval, until stopped.
    ///
    /// Returns an error once storage has failed too often in a row.
    pub async fn run(&self, mut stop: broadcast::Receiver<()>) -> Result<(), SchedulerError> {
        let shared = &self.shared;
        tracing::info!(
            "Starting scheduler: interval {:?}, {} parallel checks",
            shared.config.check_interval,
            shared.config.parallel_checks
        );

        let mut ticker = tokio::time::interval(shared.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut refresh = tokio::time::interval_at(
            tokio::time::Instant::now() + IDENTITY_REFRESH_INTERVAL,
            IDENTITY_REFRESH_INTERVAL,
        );

        loop {
            tokio::select! {
                _ = stop.recv() => {
                    tracing::info!("Scheduler stopped");
                    return Ok(());
                }
                _ = shared.fatal.notified() => return Err(self.storage_error()),
                _ = ticker.tick() => {
                    // Jobs run detached; only discovery is awaited here
                    self.tick().await;
                }
                _ = refresh.tick() => self.refresh_identity().await,
            }
        }
    }

    /// Run discovery, then dispatch a check job for every peer without one
    /// in flight. Returns the handles of the dispatched jobs.
    pub async fn tick(&self) -> Vec<JoinHandle<()>> {
        match self.shared.discoverer.discover().await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Discovery admitted {} hosts", n),
            Err(DiscoveryError::Store(e)) => self.storage_failed(&e),
            Err(e) => tracing::warn!("Discovery failed: {}", e),
        }

        let hosts = match self.shared.store.list_hosts(&HostFilter::default()) {
            Ok(hosts) => hosts,
            Err(e) => {
                tracing::error!("Failed to list hosts: {}", e);
                self.storage_failed(&e);
                return Vec::new();
            }
        };

        hosts.into_iter().filter_map(|host| self.dispatch(host)).collect()
    }

    fn dispatch(&self, host: Host) -> Option<JoinHandle<()>> {
        if !self.shared.in_flight.lock().insert(host.id) {
            tracing::debug!("Check of {} still in flight, skipping", host.hostname);
            return None;
        }
        let guard = InFlight {
            shared: self.shared.clone(),
            host_id: host.id,
        };

        let scheduler = self.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            let Ok(_permit) = scheduler.shared.semaphore.clone().acquire_owned().await else {
                return;
            };

            let jitter = rand::thread_rng().gen_range(0..=MAX_JITTER_MS);
            tokio::time::sleep(Duration::from_millis(jitter)).await;

            scheduler.check_host(&host).await;
        }))
    }

    /// Run all probes against every address of `host` and store the results.
    async fn check_host(&self, host: &Host) {
        let prober = &self.shared.prober;
        let probes = Network::ALL
            .into_iter()
            .filter_map(|network| host.address(network).map(|addr| (network, addr)))
            .flat_map(|(network, addr)| {
                CheckType::ALL
                    .into_iter()
                    .map(move |check_type| (network, addr, check_type))
            })
            .map(|(network, addr, check_type)| async move {
                let outcome = prober.probe(check_type, addr, host.service_port).await;
                outcome.into_check(network, check_type)
            });

        let checks = join_all(probes).await;
        for check in &checks {
            self.record(host, check);
        }

        let answered: Vec<&NewCheck> = checks
            .iter()
            .filter(|c| c.check_type == CheckType::Http && c.status == CheckStatus::Success)
            .collect();
        if let Some(body) = answered.iter().find_map(|c| c.response_body.as_deref()) {
            self.observe(host, body);
        }

        if answered.iter().any(|c| c.network == Network::Public) {
            self.shared.discoverer.expand_from(host).await;
        }
    }

    /// Refresh last-seen and the advertised addresses of `host` from the
    /// identity document its web endpoint just returned.
    fn observe(&self, host: &Host, body: &str) {
        let doc: IdentityDocument = match serde_json::from_str(body) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::debug!("Unreadable identity from {}: {}", host.hostname, e);
                return;
            }
        };
        if doc.hostname != host.hostname {
            tracing::debug!(
                "{} now answers as {}, leaving it to discovery",
                host.hostname,
                doc.hostname
            );
            return;
        }

        match self.shared.store.upsert_host(&doc.into_identity("", 0)) {
            Ok(_) => {}
            Err(DbError::NotFound) | Err(DbError::Conflict(_)) => {}
            Err(e) => {
                tracing::warn!("Failed to refresh {}: {}", host.hostname, e);
                self.storage_failed(&e);
            }
        }
    }

    fn record(&self, host: &Host, check: &NewCheck) {
        match self.shared.store.record_check(host.id, check) {
            Ok(_) => self.shared.storage_failures.store(0, Ordering::SeqCst),
            Err(DbError::NotFound) => {
                tracing::debug!("Host {} was deleted during its check", host.hostname);
            }
            Err(e) => {
                tracing::error!(
                    "Dropping {} {} check of {}: {}",
                    check.network,
                    check.check_type,
                    host.hostname,
                    e
                );
                self.storage_failed(&e);
            }
        }
    }

    fn storage_failed(&self, err: &DbError) {
        *self.shared.last_storage_error.lock() = err.to_string();
        let failures = self.shared.storage_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= STORAGE_FAILURE_LIMIT {
            self.shared.fatal.notify_one();
        }
    }

    fn storage_error(&self) -> SchedulerError {
        SchedulerError::Storage {
            failures: self.shared.storage_failures.load(Ordering::SeqCst),
            last: self.shared.last_storage_error.lock().clone(),
        }
    }

    async fn refresh_identity(&self) {
        let identity = resolve_self_identity(&self.shared.config).await;
        if let Err(e) = self.shared.store.refresh_self(&identity) {
            tracing::warn!("Failed to refresh local identity: {}", e);
        }
    }
}
