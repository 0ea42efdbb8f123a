use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use courtbot::catalog::Catalog;
use courtbot::clock::{Clock, SystemClock};
use courtbot::config::Config;
use courtbot::dispatcher::RequestDispatcher;
use courtbot::engine::RaceExecutor;
use courtbot::ledger::LedgerClient;
use courtbot::notify::NotifyHub;
use courtbot::store::RequestStore;
use courtbot::trigger::DailyTrigger;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    courtbot::observability::init(config.metrics_port);

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(RequestStore::open(&config.wal_path(), config.compact_threshold)?);
    let catalog = Arc::new(match &config.catalog_path {
        Some(path) => Catalog::load(path)?,
        None => Catalog::default(),
    });
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let client = Arc::new(LedgerClient::new(clock.clone(), config.session_ttl));
    let hub = Arc::new(NotifyHub::new());

    let executor = Arc::new(
        RaceExecutor::new(client.clone(), clock.clone())
            .with_max_concurrent(config.max_attempts_per_request)
            .with_late_tolerance(config.schedule.safety_margin),
    );
    let dispatcher = RequestDispatcher::new(
        store.clone(),
        client,
        hub.clone(),
        catalog.clone(),
        executor,
        config.schedule.slot,
    )
    .with_max_concurrent_accounts(config.max_concurrent_accounts);
    let trigger = DailyTrigger::new(config.schedule.clone(), clock, store.clone(), dispatcher, hub.clone());

    info!("courtbot started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  pending requests: {}", store.len());
    info!("  courts: {}", catalog.resources().len());
    info!(
        "  opening: {:02}:00 {} (+{} days), wake {:?} early",
        config.schedule.opening_hour, config.schedule.zone, config.schedule.horizon_days, config.schedule.safety_margin
    );
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let mut notifications = hub.subscribe_all();
    tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(n) => match &n.account {
                    Some(account) => info!("notify {account}: {n}"),
                    None => info!("notify all: {n}"),
                },
                Err(RecvError::Lagged(missed)) => tracing::warn!("notification log lagged, {missed} dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let token = CancellationToken::new();
    let trigger_task = tokio::spawn(trigger.run(token.clone()));

    // Graceful shutdown: stop the trigger on SIGTERM/ctrl-c, let an in-flight run finish
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received, stopping trigger");
    token.cancel();
    if tokio::time::timeout(Duration::from_secs(10), trigger_task).await.is_err() {
        tracing::warn!("drain timeout, abandoning in-flight run");
    }

    info!("courtbot stopped");
    Ok(())
}
