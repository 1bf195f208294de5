//! Wires the engine, synchronizer, statistics and front ends into one
//! long-running process.

use std::sync::Arc;
use std::time::Duration;
use chrono::{Local, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::control::{self, ControlError, ControlState};
use crate::dns::listener::{DnsFilter, ListenerConfig, ServerError};
use crate::filter::engine::PolicyEngine;
use crate::stats::aggregator::{StatsAggregator, StatsError};
use crate::stats::channel::{process_stats_events, stats_channel, StatsSender};
use crate::sync::reload::{ReloadOutcome, ReloadSignal, Synchronizer};
use crate::sync::snapshot::SnapshotSlot;
use crate::sync::store::{ConfigStore, JsonFileTransport, StoreError};

/// How often buffered block counters are written back to the bundle
const COUNTER_FLUSH_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("DNS server error: {0}")]
    Server(#[from] ServerError),

    #[error("Control server error: {0}")]
    Control(#[from] ControlError),

    #[error("Statistics error: {0}")]
    Stats(#[from] StatsError),
}

pub type DaemonResult<T> = Result<T, DaemonError>;

/// Count devices seen recently and hand the number to the statistics sink
fn report_active_devices(slot: &SnapshotSlot, stats: &StatsSender, window_secs: i64) -> u64 {
    let now = Utc::now();
    let snapshot = slot.current();
    let active = snapshot
        .devices()
        .iter()
        .filter(|d| d.is_active(now, window_secs))
        .count() as u64;
    stats.active_devices(active);
    active
}

/// Run until Ctrl-C or a fatal front-end error
pub async fn run(config: EngineConfig) -> DaemonResult<()> {
    let signal = Arc::new(ReloadSignal::new());
    let transport = Arc::new(JsonFileTransport::new(&config.store_path).with_signal(signal.clone()));
    let store = Arc::new(ConfigStore::new(transport.clone()));
    let slot = Arc::new(SnapshotSlot::new());

    let stats = Arc::new(StatsAggregator::load(&config.stats_path, config.top_domains_capacity).await?);
    stats.prune(config.stats_retention_days, Local::now().date_naive());

    let (stats_tx, stats_rx) = stats_channel(config.stats_channel_capacity);
    let engine = Arc::new(PolicyEngine::new(slot.clone()).with_stats(stats_tx.clone()));

    let synchronizer = Arc::new(
        Synchronizer::new(
            transport.clone(),
            slot.clone(),
            signal.clone(),
            Duration::from_secs(config.reload_interval_secs),
        )
        .with_store(store.clone()),
    );

    match synchronizer.reload().await {
        Ok(ReloadOutcome::Published(version)) => info!("Loaded configuration v{}", version),
        Ok(ReloadOutcome::Unchanged(_)) => {
            warn!("No configuration at {} yet, allowing all traffic", config.store_path.display())
        }
        Err(e) => warn!("Could not load configuration, allowing all traffic: {}", e),
    }

    tokio::spawn(synchronizer.clone().run());
    tokio::spawn(process_stats_events(
        stats_rx,
        stats.clone(),
        Some(store.clone()),
        Duration::from_secs(COUNTER_FLUSH_SECS),
    ));

    // Housekeeping: active devices, retention, statistics file
    {
        let slot = slot.clone();
        let stats = stats.clone();
        let stats_tx = stats_tx.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(config.reload_interval_secs));
            loop {
                interval.tick().await;
                report_active_devices(&slot, &stats_tx, config.active_window_secs);
                stats.prune(config.stats_retention_days, Local::now().date_naive());
                if let Err(e) = stats.save(&config.stats_path).await {
                    warn!("Failed to save statistics: {}", e);
                }
            }
        });
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        let signal = signal.clone();
        match unix_signal(SignalKind::hangup()) {
            Ok(mut hangups) => {
                tokio::spawn(async move {
                    while hangups.recv().await.is_some() {
                        info!("SIGHUP received, reloading configuration");
                        signal.raise();
                    }
                });
            }
            Err(e) => warn!("Cannot listen for SIGHUP: {}", e),
        }
    }

    control::start_server(
        config.control_addr,
        ControlState {
            slot: slot.clone(),
            stats: stats.clone(),
            synchronizer: synchronizer.clone(),
        },
    )?;

    let filter = DnsFilter::bind(
        config.listen_addr,
        engine,
        ListenerConfig {
            upstream_servers: config.upstream_servers.clone(),
            upstream_timeout_ms: config.upstream_timeout_ms,
        },
    )
    .await?;

    let result = tokio::select! {
        result = filter.run() => result.map_err(DaemonError::from),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    };

    if let Err(e) = stats.save(&config.stats_path).await {
        error!("Failed to save statistics on shutdown: {}", e);
    }
    if let Err(e) = store.flush().await {
        error!("Failed to flush block counters on shutdown: {}", e);
    }

    result
}
