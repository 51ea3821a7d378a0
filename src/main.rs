//! meshwatch - peer mesh reachability monitor.

use meshwatch::config::ServerConfig;
use meshwatch::db::Store;
use meshwatch::listener::PeerListener;
use meshwatch::logging::{run_log_writer, store_log_layer};
use meshwatch::probe::{detect_pinger, ProbeSettings, Prober};
use meshwatch::scheduler::{resolve_self_identity, Scheduler};

use std::net::{IpAddr, Ipv4Addr};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LOG_CHANNEL_CAPACITY: usize = 10_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (log_layer, log_rx) = store_log_layer(LOG_CHANNEL_CAPACITY);

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(log_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("meshwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load()?;
    tracing::info!(
        "Starting meshwatch: web port {}, service port {}",
        cfg.web_port,
        cfg.service_port
    );
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Store::new(&cfg.db_path)?.with_history_limit(cfg.history_limit);
    tracing::info!("Database initialized successfully");

    let (stop, _) = broadcast::channel(1);
    let log_writer = tokio::spawn(run_log_writer(log_rx, store.clone(), stop.subscribe()));

    let identity = resolve_self_identity(&cfg).await;
    let me = store.register_start(&identity)?;
    tracing::info!("Registered {} (restart {})", me.host.hostname, me.restarts);

    let prober = Prober::new(
        ProbeSettings {
            web_port: cfg.web_port,
            timeout: cfg.check_timeout,
            local_hostname: me.host.hostname.clone(),
        },
        detect_pinger(),
    )?;

    // Start peer listener
    let listener = PeerListener::bind(
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        cfg.web_port,
        cfg.service_port,
        store.clone(),
    )
    .await?;
    let mut listener = listener.spawn(stop.clone());

    // Start scheduler
    let scheduler = Scheduler::new(cfg, store, prober);
    let mut scheduler = scheduler.start(stop.subscribe());

    let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            Ok(())
        }
        res = &mut scheduler => match res? {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!("Scheduler failed: {}", e);
                Err(e.into())
            }
        },
        res = &mut listener => match res? {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!("Peer listener failed: {}", e);
                Err(e.into())
            }
        },
    };

    let _ = stop.send(());
    if !scheduler.is_finished() {
        let _ = scheduler.await;
    }
    if !listener.is_finished() {
        let _ = listener.await;
    }

    let _ = log_writer.await;

    result
}
