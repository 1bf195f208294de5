use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::Local;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::sync::snapshot::{PolicySnapshot, SnapshotSlot};
use crate::sync::store::{ConfigStore, ConfigTransport, StoreResult};

/// "Configuration may have changed", carrying no payload.
///
/// Raising it several times before the receiver wakes collapses into one
/// wake-up; a raise with nobody waiting is kept until the next wait.
#[derive(Debug, Default)]
pub struct ReloadSignal {
    notify: Notify,
    generation: AtomicU64,
}

impl ReloadSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// How many times the signal has been raised
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Outcome of one reload attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Published(u64),
    Unchanged(u64),
}

/// Keeps the live snapshot in step with the configuration transport
pub struct Synchronizer {
    transport: Arc<dyn ConfigTransport>,
    slot: Arc<SnapshotSlot>,
    signal: Arc<ReloadSignal>,
    poll_interval: Duration,
    store: Option<Arc<ConfigStore>>,
}

impl Synchronizer {
    pub fn new(
        transport: Arc<dyn ConfigTransport>,
        slot: Arc<SnapshotSlot>,
        signal: Arc<ReloadSignal>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport,
            slot,
            signal,
            poll_interval,
            store: None,
        }
    }

    /// Also run the daily usage reset check on every poll
    pub fn with_store(mut self, store: Arc<ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Re-read the full bundle and publish it when its revision is newer.
    ///
    /// An unreadable bundle leaves the live snapshot untouched.
    pub async fn reload(&self) -> StoreResult<ReloadOutcome> {
        let bundle = self.transport.read_bundle().await?;
        let live = self.slot.version();
        if bundle.revision <= live {
            debug!("Bundle revision {} already live", bundle.revision);
            return Ok(ReloadOutcome::Unchanged(live));
        }

        let snapshot = tokio::task::spawn_blocking(move || PolicySnapshot::from_bundle(&bundle)).await?;
        let version = snapshot.version;
        if self.slot.publish(Arc::new(snapshot)) {
            Ok(ReloadOutcome::Published(version))
        } else {
            Ok(ReloadOutcome::Unchanged(self.slot.version()))
        }
    }

    async fn reload_logged(&self) {
        match self.reload().await {
            Ok(ReloadOutcome::Published(version)) => debug!("Reload published v{}", version),
            Ok(ReloadOutcome::Unchanged(_)) => {}
            Err(e) => warn!("Reload failed, keeping snapshot v{}: {}", self.slot.version(), e),
        }
    }

    async fn daily_reset(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.check_daily_reset(Local::now().date_naive()).await {
                warn!("Daily reset check failed: {}", e);
            }
        }
    }

    /// Reload on every signal and on a fixed poll interval until the task is dropped
    pub async fn run(self: Arc<Self>) {
        info!("Configuration synchronizer polling every {:?}", self.poll_interval);
        self.daily_reset().await;
        self.reload_logged().await;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.signal.wait() => {
                    debug!("Reload signal received (generation {})", self.signal.generation());
                }
                _ = ticker.tick() => {
                    self.daily_reset().await;
                }
            }
            self.reload_logged().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::categories::Category;
    use crate::sync::store::MemoryTransport;

    fn setup() -> (Arc<MemoryTransport>, Arc<SnapshotSlot>, Synchronizer) {
        let transport = Arc::new(MemoryTransport::new());
        let slot = Arc::new(SnapshotSlot::new());
        let sync = Synchronizer::new(
            transport.clone(),
            slot.clone(),
            transport.signal(),
            Duration::from_secs(30),
        );
        (transport, slot, sync)
    }

    #[tokio::test]
    async fn test_reload_publishes_newer_revision_once() {
        let (transport, slot, sync) = setup();
        let store = ConfigStore::new(transport.clone());
        store.add_blocked_domain("example.com", Category::Custom).await.unwrap();

        let outcome = sync.reload().await.unwrap();
        assert_eq!(outcome, ReloadOutcome::Published(1));
        assert!(slot.current().matcher.is_blocked("example.com"));

        assert_eq!(sync.reload().await.unwrap(), ReloadOutcome::Unchanged(1));
    }

    #[tokio::test]
    async fn test_malformed_bundle_keeps_previous_snapshot() {
        let (transport, slot, sync) = setup();
        let store = ConfigStore::new(transport.clone());
        store.add_blocked_domain("example.com", Category::Custom).await.unwrap();
        sync.reload().await.unwrap();

        transport.set_raw("{ not json");
        assert!(sync.reload().await.is_err());
        assert_eq!(slot.version(), 1);
        assert!(slot.current().matcher.is_blocked("example.com"));
    }

    #[tokio::test]
    async fn test_signal_is_not_lost_without_waiter() {
        let signal = ReloadSignal::new();
        signal.raise();
        signal.raise();
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .expect("stored permit wakes the waiter");
        assert_eq!(signal.generation(), 2);
    }

    #[tokio::test]
    async fn test_run_picks_up_signalled_change() {
        let (transport, slot, sync) = setup();
        let store = ConfigStore::new(transport.clone());
        let handle = tokio::spawn(Arc::new(sync).run());

        store.add_blocked_domain("example.com", Category::Custom).await.unwrap();

        let mut published = false;
        for _ in 0..100 {
            if slot.version() >= 1 {
                published = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert!(published);
        assert!(slot.current().matcher.is_blocked("example.com"));
    }
}
