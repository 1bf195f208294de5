//! The configuration store and the transports that carry its bundle.
//!
//! Every change is a read-modify-write of the whole bundle through a
//! [`ConfigTransport`], so the enforcing process and any number of
//! management commands can share one bundle without partial updates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::filter::categories::Category;
use crate::filter::matcher::normalize;
use crate::filter::time_budget::{DailyReset, TimeBudgetTracker};
use crate::models::{BlockedEntry, Device, QuietHours, TimeLimit};
use crate::sync::bundle::ConfigBundle;
use crate::sync::reload::ReloadSignal;

static DOMAIN_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$")
        .unwrap_or_else(|e| panic!("invalid domain regex: {}", e))
});

static MAC_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-F]{2}[:-]){5}[0-9A-F]{2}$")
        .unwrap_or_else(|e| panic!("invalid MAC regex: {}", e))
});

/// Configuration store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed bundle: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Snapshot build failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Moves the full bundle between the store and the enforcer
#[async_trait]
pub trait ConfigTransport: Send + Sync {
    /// Read the complete current bundle
    async fn read_bundle(&self) -> StoreResult<ConfigBundle>;

    /// Replace the complete bundle
    async fn write_bundle(&self, bundle: &ConfigBundle) -> StoreResult<()>;

    /// Tell the enforcer the bundle may have changed
    fn signal_reload(&self);
}

/// Write `bytes` to a temp file next to `path` and rename it into place
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Bundle kept as a JSON file on shared storage
pub struct JsonFileTransport {
    path: PathBuf,
    signal: Option<Arc<ReloadSignal>>,
}

impl JsonFileTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            signal: None,
        }
    }

    /// Raise `signal` after every write, for an enforcer in this process
    pub fn with_signal(mut self, signal: Arc<ReloadSignal>) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigTransport for JsonFileTransport {
    async fn read_bundle(&self) -> StoreResult<ConfigBundle> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No bundle at {}, using defaults", self.path.display());
                Ok(ConfigBundle::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_bundle(&self, bundle: &ConfigBundle) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(bundle)?;
        write_atomic(&self.path, &json).await?;
        Ok(())
    }

    fn signal_reload(&self) {
        match &self.signal {
            Some(signal) => signal.raise(),
            None => debug!("No in-process reload receiver for {}", self.path.display()),
        }
    }
}

/// In-process transport; keeps the serialized bundle in memory
pub struct MemoryTransport {
    raw: RwLock<String>,
    signal: Arc<ReloadSignal>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let raw = serde_json::to_string(&ConfigBundle::default()).unwrap_or_default();
        Self {
            raw: RwLock::new(raw),
            signal: Arc::new(ReloadSignal::new()),
        }
    }

    pub fn signal(&self) -> Arc<ReloadSignal> {
        self.signal.clone()
    }

    /// Replace the stored text verbatim, valid or not
    pub fn set_raw(&self, text: &str) {
        *self.raw.write().unwrap_or_else(PoisonError::into_inner) = text.to_string();
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigTransport for MemoryTransport {
    async fn read_bundle(&self) -> StoreResult<ConfigBundle> {
        let raw = self.raw.read().unwrap_or_else(PoisonError::into_inner).clone();
        Ok(serde_json::from_str(&raw)?)
    }

    async fn write_bundle(&self, bundle: &ConfigBundle) -> StoreResult<()> {
        let json = serde_json::to_string(bundle)?;
        *self.raw.write().unwrap_or_else(PoisonError::into_inner) = json;
        Ok(())
    }

    fn signal_reload(&self) {
        self.signal.raise();
    }
}

/// What a mutation did to the bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Unchanged,
    /// Bookkeeping only, no effect on decisions
    Counters,
    /// Decision-relevant: bump the revision and signal a reload
    Policy,
}

#[derive(Debug, Default)]
struct PendingCounters {
    domains: HashMap<String, (u64, DateTime<Utc>)>,
    devices: HashMap<Uuid, u64>,
}

impl PendingCounters {
    fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.devices.is_empty()
    }

    /// Fold `other` back in, e.g. after a flush that could not be written
    fn merge(&mut self, other: PendingCounters) {
        for (domain, (count, last)) in other.domains {
            let slot = self.domains.entry(domain).or_insert((0, last));
            slot.0 += count;
            slot.1 = slot.1.max(last);
        }
        for (id, count) in other.devices {
            *self.devices.entry(id).or_default() += count;
        }
    }
}

/// Owner of the configuration; every mutation goes through here
pub struct ConfigStore {
    transport: Arc<dyn ConfigTransport>,
    write_lock: tokio::sync::Mutex<()>,
    pending: Mutex<PendingCounters>,
}

fn validate_domain(raw: &str) -> StoreResult<String> {
    let domain = normalize(raw);
    if DOMAIN_REGEX.is_match(&domain) && domain.len() <= 253 {
        Ok(domain)
    } else {
        Err(StoreError::InvalidDomain(raw.to_string()))
    }
}

fn normalize_mac(raw: &str) -> String {
    raw.trim().to_uppercase().replace('-', ":")
}

fn validate_mac(raw: &str) -> StoreResult<String> {
    let mac = normalize_mac(raw);
    if MAC_REGEX.is_match(&mac) {
        Ok(mac)
    } else {
        Err(StoreError::InvalidMac(raw.to_string()))
    }
}

impl ConfigStore {
    pub fn new(transport: Arc<dyn ConfigTransport>) -> Self {
        Self {
            transport,
            write_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(PendingCounters::default()),
        }
    }

    pub fn transport(&self) -> Arc<dyn ConfigTransport> {
        self.transport.clone()
    }

    /// The current bundle as stored
    pub async fn bundle(&self) -> StoreResult<ConfigBundle> {
        self.transport.read_bundle().await
    }

    async fn update<T, F>(&self, mutate: F) -> StoreResult<T>
    where
        F: FnOnce(&mut ConfigBundle) -> StoreResult<(Change, T)>,
    {
        let _guard = self.write_lock.lock().await;
        let mut bundle = self.transport.read_bundle().await?;
        let (change, value) = mutate(&mut bundle)?;

        match change {
            Change::Unchanged => {}
            Change::Counters => {
                self.transport.write_bundle(&bundle).await?;
            }
            Change::Policy => {
                bundle.revision += 1;
                self.transport.write_bundle(&bundle).await?;
                debug!("Configuration revision {} written", bundle.revision);
                self.transport.signal_reload();
            }
        }
        Ok(value)
    }

    /// Add a blocked domain, or re-enable and recategorize an existing one
    pub async fn add_blocked_domain(&self, domain: &str, category: Category) -> StoreResult<BlockedEntry> {
        let domain = validate_domain(domain)?;
        self.update(move |bundle| {
            if let Some(entry) = bundle.blocked_domains.iter_mut().find(|e| e.domain == domain) {
                if entry.enabled && entry.category == category {
                    return Ok((Change::Unchanged, entry.clone()));
                }
                entry.enabled = true;
                entry.category = category;
                return Ok((Change::Policy, entry.clone()));
            }

            let entry = BlockedEntry::new(&domain, category);
            bundle.blocked_domains.push(entry.clone());
            info!("Blocked {} ({})", entry.domain, entry.category);
            Ok((Change::Policy, entry))
        })
        .await
    }

    pub async fn remove_blocked_domain(&self, domain: &str) -> StoreResult<()> {
        let domain = normalize(domain);
        self.update(move |bundle| {
            let before = bundle.blocked_domains.len();
            bundle.blocked_domains.retain(|e| e.domain != domain);
            if bundle.blocked_domains.len() == before {
                return Err(StoreError::NotFound(domain));
            }
            info!("Unblocked {}", domain);
            Ok((Change::Policy, ()))
        })
        .await
    }

    pub async fn set_domain_enabled(&self, domain: &str, enabled: bool) -> StoreResult<()> {
        let domain = normalize(domain);
        self.update(move |bundle| {
            let entry = bundle
                .blocked_domains
                .iter_mut()
                .find(|e| e.domain == domain)
                .ok_or_else(|| StoreError::NotFound(domain.clone()))?;
            if entry.enabled == enabled {
                return Ok((Change::Unchanged, ()));
            }
            entry.enabled = enabled;
            Ok((Change::Policy, ()))
        })
        .await
    }

    /// Add the preset domains of `category`; returns how many were new
    pub async fn block_category(&self, category: Category) -> StoreResult<usize> {
        self.update(move |bundle| {
            let mut added = 0;
            for entry in category.preset_entries() {
                if !bundle.blocked_domains.iter().any(|e| e.domain == entry.domain) {
                    bundle.blocked_domains.push(entry);
                    added += 1;
                }
            }
            info!("Blocked category {}: {} new domains", category, added);
            let change = if added > 0 { Change::Policy } else { Change::Unchanged };
            Ok((change, added))
        })
        .await
    }

    /// Remove every entry tagged with `category`; returns how many went
    pub async fn unblock_category(&self, category: Category) -> StoreResult<usize> {
        self.update(move |bundle| {
            let before = bundle.blocked_domains.len();
            bundle.blocked_domains.retain(|e| e.category != category);
            let removed = before - bundle.blocked_domains.len();
            info!("Unblocked category {}: {} domains removed", category, removed);
            let change = if removed > 0 { Change::Policy } else { Change::Unchanged };
            Ok((change, removed))
        })
        .await
    }

    /// Insert a device, or merge it into the one with the same MAC address
    pub async fn upsert_device(&self, device: Device) -> StoreResult<Device> {
        let mac = validate_mac(&device.mac_address)?;
        self.update(move |bundle| {
            if let Some(existing) = bundle.devices.iter_mut().find(|d| normalize_mac(&d.mac_address) == mac) {
                let renamed = !device.name.trim().is_empty() && existing.name != device.name;
                let moved = existing.ip_address != device.ip_address;
                let seen = device.last_seen > existing.last_seen;
                let respelled = existing.mac_address != mac;

                existing.ip_address = device.ip_address;
                if renamed {
                    existing.name = device.name;
                }
                existing.last_seen = existing.last_seen.max(device.last_seen);
                existing.mac_address = mac;

                let change = if renamed || moved {
                    Change::Policy
                } else if seen || respelled {
                    Change::Counters
                } else {
                    Change::Unchanged
                };
                return Ok((change, existing.clone()));
            }

            let mut device = device;
            device.mac_address = mac;
            info!("New device {} at {}", device.display_name(), device.ip_address);
            bundle.devices.push(device.clone());
            Ok((Change::Policy, device))
        })
        .await
    }

    pub async fn set_device_blocked(&self, id: Uuid, blocked: bool) -> StoreResult<()> {
        self.update(move |bundle| {
            let device = bundle
                .devices
                .iter_mut()
                .find(|d| d.id == id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            if device.is_blocked == blocked {
                return Ok((Change::Unchanged, ()));
            }
            device.is_blocked = blocked;
            info!("Device {} {}", device.display_name(), if blocked { "blocked" } else { "unblocked" });
            Ok((Change::Policy, ()))
        })
        .await
    }

    /// Remove a device and any time limit attached to it
    pub async fn remove_device(&self, id: Uuid) -> StoreResult<()> {
        self.update(move |bundle| {
            let before = bundle.devices.len();
            bundle.devices.retain(|d| d.id != id);
            if bundle.devices.len() == before {
                return Err(StoreError::NotFound(id.to_string()));
            }
            bundle.time_limits.retain(|l| l.device_id != Some(id));
            Ok((Change::Policy, ()))
        })
        .await
    }

    /// Mark a device as seen; this does not change any decision
    pub async fn touch_device(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        self.update(move |bundle| {
            let device = bundle
                .devices
                .iter_mut()
                .find(|d| d.id == id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            device.last_seen = device.last_seen.max(at);
            Ok((Change::Counters, ()))
        })
        .await
    }

    /// Insert or replace a time limit by id
    pub async fn set_time_limit(&self, limit: TimeLimit) -> StoreResult<()> {
        self.update(move |bundle| {
            match bundle.time_limits.iter_mut().find(|l| l.id == limit.id) {
                Some(existing) => *existing = limit,
                None => bundle.time_limits.push(limit),
            }
            Ok((Change::Policy, ()))
        })
        .await
    }

    pub async fn remove_time_limit(&self, id: Uuid) -> StoreResult<()> {
        self.update(move |bundle| {
            let before = bundle.time_limits.len();
            bundle.time_limits.retain(|l| l.id != id);
            if bundle.time_limits.len() == before {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Ok((Change::Policy, ()))
        })
        .await
    }

    /// Set or clear the quiet hours applying to every device
    pub async fn set_quiet_hours(&self, quiet_hours: Option<QuietHours>) -> StoreResult<()> {
        self.update(move |bundle| {
            if bundle.quiet_hours == quiet_hours {
                return Ok((Change::Unchanged, ()));
            }
            bundle.quiet_hours = quiet_hours;
            Ok((Change::Policy, ()))
        })
        .await
    }

    pub async fn set_protection_enabled(&self, enabled: bool) -> StoreResult<()> {
        self.update(move |bundle| {
            if bundle.protection_enabled == enabled {
                return Ok((Change::Unchanged, ()));
            }
            bundle.protection_enabled = enabled;
            info!("Protection {}", if enabled { "enabled" } else { "disabled" });
            Ok((Change::Policy, ()))
        })
        .await
    }

    /// Add connected minutes to a device's usage today
    pub async fn record_usage(&self, id: Uuid, minutes: u32) -> StoreResult<u32> {
        self.update(move |bundle| {
            let device = bundle
                .devices
                .iter_mut()
                .find(|d| d.id == id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            if minutes == 0 {
                return Ok((Change::Unchanged, device.time_used_today_minutes));
            }
            TimeBudgetTracker::record_usage(device, minutes);
            Ok((Change::Policy, device.time_used_today_minutes))
        })
        .await
    }

    /// Zero usage counters if `today` is a new day; returns whether it did
    pub async fn check_daily_reset(&self, today: NaiveDate) -> StoreResult<bool> {
        self.update(move |bundle| {
            let mut reset = DailyReset::new(bundle.last_daily_reset);
            if !reset.reset_daily(&mut bundle.devices, today) {
                return Ok((Change::Unchanged, false));
            }
            bundle.last_daily_reset = reset.last_reset();
            Ok((Change::Policy, true))
        })
        .await
    }

    /// Buffer one block against its rule and device; applied by `flush`
    pub fn record_block(&self, domain: Option<&str>, device_id: Option<Uuid>, at: DateTime<Utc>) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(domain) = domain {
            let slot = pending.domains.entry(normalize(domain)).or_insert((0, at));
            slot.0 += 1;
            slot.1 = slot.1.max(at);
        }
        if let Some(id) = device_id {
            *pending.devices.entry(id).or_default() += 1;
        }
    }

    /// Write buffered block counters into the bundle; returns how many
    /// entries and devices were updated. Counters that cannot be written
    /// stay buffered for the next flush.
    pub async fn flush(&self) -> StoreResult<usize> {
        let pending = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending.is_empty() {
                return Ok(0);
            }
            std::mem::take(&mut *pending)
        };

        let result = self
            .update(|bundle| {
                let mut touched = 0;
                for entry in bundle.blocked_domains.iter_mut() {
                    if let Some(&(count, last)) = pending.domains.get(&normalize(&entry.domain)) {
                        entry.record_blocks(count, last);
                        touched += 1;
                    }
                }
                for device in bundle.devices.iter_mut() {
                    if let Some(count) = pending.devices.get(&device.id) {
                        device.total_blocked_attempts = device.total_blocked_attempts.saturating_add(*count);
                        touched += 1;
                    }
                }
                let change = if touched > 0 { Change::Counters } else { Change::Unchanged };
                Ok((change, touched))
            })
            .await;

        if result.is_err() {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .merge(pending);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (Arc<MemoryTransport>, ConfigStore) {
        let transport = Arc::new(MemoryTransport::new());
        (transport.clone(), ConfigStore::new(transport))
    }

    #[tokio::test]
    async fn test_add_domain_normalizes_and_dedups() {
        let (_, store) = store();
        store.add_blocked_domain("  WWW.Example.COM ", Category::Custom).await.unwrap();
        store.add_blocked_domain("example.com", Category::Custom).await.unwrap();

        let bundle = store.bundle().await.unwrap();
        assert_eq!(bundle.blocked_domains.len(), 1);
        assert_eq!(bundle.blocked_domains[0].domain, "example.com");
        // Second add was a no-op
        assert_eq!(bundle.revision, 1);
    }

    #[tokio::test]
    async fn test_invalid_domain_rejected() {
        let (_, store) = store();
        for bad in ["", "not a domain", "localhost", "-bad.com", "a..b"] {
            assert!(
                matches!(store.add_blocked_domain(bad, Category::Custom).await, Err(StoreError::InvalidDomain(_))),
                "{:?} accepted",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_policy_changes_bump_revision_and_signal() {
        let (transport, store) = store();
        let signal = transport.signal();

        store.set_protection_enabled(false).await.unwrap();
        assert_eq!(store.bundle().await.unwrap().revision, 1);
        assert_eq!(signal.generation(), 1);

        store.set_protection_enabled(false).await.unwrap();
        assert_eq!(store.bundle().await.unwrap().revision, 1);
        assert_eq!(signal.generation(), 1);
    }

    #[tokio::test]
    async fn test_categories() {
        let (_, store) = store();
        store.add_blocked_domain("facebook.com", Category::Custom).await.unwrap();

        let added = store.block_category(Category::SocialMedia).await.unwrap();
        let presets = Category::SocialMedia.preset_domains().len();
        assert_eq!(added, presets - 1);
        assert_eq!(store.block_category(Category::SocialMedia).await.unwrap(), 0);

        let removed = store.unblock_category(Category::SocialMedia).await.unwrap();
        assert_eq!(removed, presets - 1);
        let bundle = store.bundle().await.unwrap();
        assert_eq!(bundle.blocked_domains.len(), 1);
        assert_eq!(bundle.blocked_domains[0].category, Category::Custom);
    }

    #[tokio::test]
    async fn test_upsert_device_merges_by_mac() {
        let (_, store) = store();
        let first = store
            .upsert_device(Device::new("tablet", "192.168.1.20".parse().unwrap(), "aa-bb-cc-dd-ee-ff"))
            .await
            .unwrap();
        let merged = store
            .upsert_device(Device::new("", "192.168.1.21".parse().unwrap(), "AA:BB:CC:DD:EE:FF"))
            .await
            .unwrap();

        assert_eq!(merged.id, first.id);
        assert_eq!(merged.name, "tablet");
        assert_eq!(merged.ip_address.to_string(), "192.168.1.21");
        assert_eq!(store.bundle().await.unwrap().devices.len(), 1);

        let bad = Device::new("x", "192.168.1.22".parse().unwrap(), "zz:zz");
        assert!(matches!(store.upsert_device(bad).await, Err(StoreError::InvalidMac(_))));
    }

    #[tokio::test]
    async fn test_unknown_entities() {
        let (_, store) = store();
        assert!(matches!(store.remove_blocked_domain("nope.com").await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.set_device_blocked(Uuid::new_v4(), true).await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.remove_time_limit(Uuid::new_v4()).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_daily_reset_through_store() {
        let (_, store) = store();
        let device = store
            .upsert_device(Device::new("tablet", "192.168.1.20".parse().unwrap(), "aa:bb:cc:dd:ee:ff"))
            .await
            .unwrap();
        assert_eq!(store.record_usage(device.id, 40).await.unwrap(), 40);

        let day = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        assert!(store.check_daily_reset(day).await.unwrap());
        store.record_usage(device.id, 5).await.unwrap();
        assert!(!store.check_daily_reset(day).await.unwrap());

        let bundle = store.bundle().await.unwrap();
        assert_eq!(bundle.devices[0].time_used_today_minutes, 5);
        assert_eq!(bundle.last_daily_reset, Some(day));
    }

    #[tokio::test]
    async fn test_flush_applies_block_counters_without_revision_bump() {
        let (_, store) = store();
        store.add_blocked_domain("example.com", Category::Custom).await.unwrap();
        let device = store
            .upsert_device(Device::new("tv", "192.168.1.30".parse().unwrap(), "11:22:33:44:55:66"))
            .await
            .unwrap();
        let revision = store.bundle().await.unwrap().revision;

        let at = Utc::now();
        store.record_block(Some("example.com"), Some(device.id), at);
        store.record_block(Some("example.com"), None, at);
        store.record_block(None, Some(device.id), at);

        assert_eq!(store.flush().await.unwrap(), 2);
        assert_eq!(store.flush().await.unwrap(), 0);

        let bundle = store.bundle().await.unwrap();
        assert_eq!(bundle.revision, revision);
        assert_eq!(bundle.blocked_domains[0].block_count, 2);
        assert_eq!(bundle.blocked_domains[0].last_blocked, Some(at));
        assert_eq!(bundle.devices[0].total_blocked_attempts, 2);
    }

    /// Memory transport whose next `failures` writes fail
    struct FlakyTransport {
        inner: MemoryTransport,
        failures: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ConfigTransport for FlakyTransport {
        async fn read_bundle(&self) -> StoreResult<ConfigBundle> {
            self.inner.read_bundle().await
        }

        async fn write_bundle(&self, bundle: &ConfigBundle) -> StoreResult<()> {
            use std::sync::atomic::Ordering;
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
            }
            self.inner.write_bundle(bundle).await
        }

        fn signal_reload(&self) {
            self.inner.signal_reload()
        }
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_counters_buffered() {
        let transport = Arc::new(FlakyTransport {
            inner: MemoryTransport::new(),
            failures: std::sync::atomic::AtomicUsize::new(0),
        });
        let store = ConfigStore::new(transport.clone());
        store.add_blocked_domain("example.com", Category::Custom).await.unwrap();

        let at = Utc::now();
        store.record_block(Some("example.com"), None, at);
        store.record_block(Some("example.com"), None, at);

        transport.failures.store(1, std::sync::atomic::Ordering::SeqCst);
        assert!(matches!(store.flush().await, Err(StoreError::Io(_))));
        store.record_block(Some("example.com"), None, at);

        assert_eq!(store.flush().await.unwrap(), 1);
        let bundle = store.bundle().await.unwrap();
        assert_eq!(bundle.blocked_domains[0].block_count, 3);
        assert_eq!(bundle.blocked_domains[0].last_blocked, Some(at));
    }

    #[tokio::test]
    async fn test_flush_counts_unnormalized_stored_entries() {
        let (transport, store) = store();
        let mut entry = BlockedEntry::new("example.com", Category::Custom);
        entry.domain = "WWW.Example.com".into();
        transport
            .write_bundle(&ConfigBundle {
                revision: 1,
                blocked_domains: vec![entry],
                ..ConfigBundle::default()
            })
            .await
            .unwrap();

        store.record_block(Some("example.com"), None, Utc::now());
        assert_eq!(store.flush().await.unwrap(), 1);
        assert_eq!(store.bundle().await.unwrap().blocked_domains[0].block_count, 1);
    }

    #[tokio::test]
    async fn test_disabled_domain_leaves_next_snapshot() {
        let (_, store) = store();
        store.add_blocked_domain("example.com", Category::Custom).await.unwrap();
        store.add_blocked_domain("example.org", Category::Custom).await.unwrap();

        store.set_domain_enabled("www.example.com", false).await.unwrap();
        let bundle = store.bundle().await.unwrap();
        assert_eq!(bundle.revision, 3);
        let snapshot = crate::sync::snapshot::PolicySnapshot::from_bundle(&bundle);
        assert!(!snapshot.matcher.is_blocked("example.com"));
        assert!(snapshot.matcher.is_blocked("example.org"));

        // Already disabled: nothing to write
        store.set_domain_enabled("example.com", false).await.unwrap();
        assert_eq!(store.bundle().await.unwrap().revision, 3);

        store.set_domain_enabled("example.com", true).await.unwrap();
        let bundle = store.bundle().await.unwrap();
        assert!(crate::sync::snapshot::PolicySnapshot::from_bundle(&bundle)
            .matcher
            .is_blocked("example.com"));
        assert!(matches!(store.set_domain_enabled("nope.com", true).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_device_drops_its_time_limit() {
        let (_, store) = store();
        let kid = store
            .upsert_device(Device::new("kid", "192.168.1.40".parse().unwrap(), "aa:bb:cc:00:00:01"))
            .await
            .unwrap();
        let other = store
            .upsert_device(Device::new("tv", "192.168.1.41".parse().unwrap(), "aa:bb:cc:00:00:02"))
            .await
            .unwrap();
        store.set_time_limit(TimeLimit::new(Some(kid.id), 60)).await.unwrap();
        store.set_time_limit(TimeLimit::new(Some(other.id), 90)).await.unwrap();
        store.set_time_limit(TimeLimit::new(None, 120)).await.unwrap();

        store.remove_device(kid.id).await.unwrap();

        let bundle = store.bundle().await.unwrap();
        assert_eq!(bundle.devices.len(), 1);
        assert_eq!(bundle.devices[0].id, other.id);
        assert_eq!(bundle.time_limits.len(), 2);
        assert!(bundle.time_limits.iter().all(|l| l.device_id != Some(kid.id)));
        assert!(matches!(store.remove_device(kid.id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_touch_device_only_moves_forward() {
        let (transport, store) = store();
        let device = store
            .upsert_device(Device::new("tablet", "192.168.1.20".parse().unwrap(), "aa:bb:cc:dd:ee:ff"))
            .await
            .unwrap();
        let revision = store.bundle().await.unwrap().revision;
        let generation = transport.signal().generation();

        let later = device.last_seen + chrono::Duration::minutes(3);
        store.touch_device(device.id, later).await.unwrap();
        store.touch_device(device.id, later - chrono::Duration::hours(1)).await.unwrap();

        let bundle = store.bundle().await.unwrap();
        assert_eq!(bundle.devices[0].last_seen, later);
        assert_eq!(bundle.revision, revision);
        assert_eq!(transport.signal().generation(), generation);
        assert!(matches!(
            store.touch_device(Uuid::new_v4(), later).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_upsert_merges_hand_written_mac() {
        let (transport, store) = store();
        let mut existing = Device::new("laptop", "192.168.1.50".parse().unwrap(), "aa:bb:cc:dd:ee:01");
        existing.mac_address = "aa-bb-cc-dd-ee-01".into();
        let id = existing.id;
        transport
            .write_bundle(&ConfigBundle {
                revision: 4,
                devices: vec![existing],
                ..ConfigBundle::default()
            })
            .await
            .unwrap();

        let merged = store
            .upsert_device(Device::new("", "192.168.1.50".parse().unwrap(), "AA:BB:CC:DD:EE:01"))
            .await
            .unwrap();

        assert_eq!(merged.id, id);
        assert_eq!(merged.mac_address, "AA:BB:CC:DD:EE:01");
        let bundle = store.bundle().await.unwrap();
        assert_eq!(bundle.devices.len(), 1);
        assert_eq!(bundle.revision, 4);
    }

    #[tokio::test]
    async fn test_rediscovery_without_changes_keeps_revision() {
        let (_, store) = store();
        let device = store
            .upsert_device(Device::new("phone", "192.168.1.60".parse().unwrap(), "11:22:33:44:55:77"))
            .await
            .unwrap();
        let revision = store.bundle().await.unwrap().revision;

        let mut again = Device::new("phone", "192.168.1.60".parse().unwrap(), "11:22:33:44:55:77");
        again.last_seen = device.last_seen + chrono::Duration::minutes(1);
        store.upsert_device(again).await.unwrap();

        let bundle = store.bundle().await.unwrap();
        assert_eq!(bundle.revision, revision);
        assert_eq!(bundle.devices[0].last_seen, device.last_seen + chrono::Duration::minutes(1));

        store
            .upsert_device(Device::new("phone", "192.168.1.61".parse().unwrap(), "11:22:33:44:55:77"))
            .await
            .unwrap();
        assert_eq!(store.bundle().await.unwrap().revision, revision + 1);
    }

    #[tokio::test]
    async fn test_json_file_transport_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bundle.json");
        let transport = Arc::new(JsonFileTransport::new(&path));

        assert_eq!(transport.read_bundle().await.unwrap(), ConfigBundle::default());

        let store = ConfigStore::new(transport.clone());
        store.add_blocked_domain("example.com", Category::Gaming).await.unwrap();

        let reread = JsonFileTransport::new(&path).read_bundle().await.unwrap();
        assert_eq!(reread.revision, 1);
        assert_eq!(reread.blocked_domains[0].category, Category::Gaming);
    }
}
