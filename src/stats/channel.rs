use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::stats::aggregator::StatsAggregator;
use crate::sync::store::ConfigStore;

/// Event emitted by the decision path
#[derive(Clone, Debug, PartialEq)]
pub enum StatsEvent {
    Blocked {
        /// The blocked rule that matched, when a destination rule caused the block
        domain: Option<String>,
        device_id: Option<Uuid>,
        at: DateTime<Utc>,
    },
    ActiveDevices {
        count: u64,
    },
}

/// Non-blocking handle used by decision workers.
///
/// A full or closed channel drops the event; decisions never wait on
/// statistics.
#[derive(Clone, Debug)]
pub struct StatsSender {
    tx: mpsc::Sender<StatsEvent>,
}

/// Create a bounded statistics channel
pub fn stats_channel(capacity: usize) -> (StatsSender, mpsc::Receiver<StatsEvent>) {
    let (tx, rx) = mpsc::channel::<StatsEvent>(capacity.max(1));
    (StatsSender { tx }, rx)
}

impl StatsSender {
    /// Queue an event; returns whether it was accepted
    pub fn send(&self, event: StatsEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Statistics channel full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Statistics channel closed, dropping event");
                false
            }
        }
    }

    pub fn blocked(&self, domain: Option<&str>, device_id: Option<Uuid>) -> bool {
        self.send(StatsEvent::Blocked {
            domain: domain.map(str::to_string),
            device_id,
            at: Utc::now(),
        })
    }

    pub fn active_devices(&self, count: u64) -> bool {
        self.send(StatsEvent::ActiveDevices { count })
    }
}

/// Drain statistics events into the aggregator and, when given, the
/// configuration store's per-entry and per-device counters.
///
/// Store counters are buffered in memory and written back every
/// `flush_interval`, plus once more when the channel closes.
pub async fn process_stats_events(
    mut rx: mpsc::Receiver<StatsEvent>,
    aggregator: Arc<StatsAggregator>,
    store: Option<Arc<ConfigStore>>,
    flush_interval: Duration,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(event) = message else { break };
                match event {
                    StatsEvent::Blocked { domain, device_id, at } => {
                        aggregator.record_block_at(domain.as_deref(), at.with_timezone(&chrono::Local).date_naive());
                        if let Some(store) = &store {
                            store.record_block(domain.as_deref(), device_id, at);
                        }
                    }
                    StatsEvent::ActiveDevices { count } => {
                        aggregator.record_active_devices(count);
                    }
                }
            }
            _ = ticker.tick() => {
                if let Some(store) = &store {
                    if let Err(e) = store.flush().await {
                        warn!("Failed to flush block counters: {}", e);
                    }
                }
            }
        }
    }

    if let Some(store) = &store {
        if let Err(e) = store.flush().await {
            warn!("Failed to flush block counters on shutdown: {}", e);
        }
    }
    debug!("Statistics consumer stopped");
}
