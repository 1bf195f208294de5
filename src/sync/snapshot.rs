use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::filter::matcher::DomainMatcher;
use crate::filter::time_budget::TimeBudgetTracker;
use crate::models::{Device, QuietHours};
use crate::sync::bundle::ConfigBundle;

/// Immutable policy state used by one decision
#[derive(Debug)]
pub struct PolicySnapshot {
    pub version: u64,
    pub protection_enabled: bool,
    pub matcher: DomainMatcher,
    pub blocked_ips: HashSet<IpAddr>,
    pub time_budget: TimeBudgetTracker,
    pub quiet_hours: Option<QuietHours>,
    pub built_at: DateTime<Utc>,
    devices: Vec<Device>,
    by_ip: HashMap<IpAddr, usize>,
    by_id: HashMap<Uuid, usize>,
}

/// What `snapshot` commands and the control endpoint report
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq)]
pub struct SnapshotSummary {
    pub version: u64,
    pub protection_enabled: bool,
    pub blocked_domains: usize,
    pub blocked_ips: usize,
    pub devices: usize,
    pub blocked_devices: usize,
    pub has_global_time_limit: bool,
    pub quiet_hours_configured: bool,
    pub built_at: DateTime<Utc>,
}

impl PolicySnapshot {
    /// Snapshot used before any configuration arrives: protection off.
    pub fn empty() -> Self {
        Self {
            version: 0,
            protection_enabled: false,
            matcher: DomainMatcher::default(),
            blocked_ips: HashSet::new(),
            time_budget: TimeBudgetTracker::default(),
            quiet_hours: None,
            built_at: Utc::now(),
            devices: Vec::new(),
            by_ip: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    /// Build the working state for one bundle. This is the expensive part
    /// and runs off the decision path.
    pub fn from_bundle(bundle: &ConfigBundle) -> Self {
        let matcher = DomainMatcher::from_entries(&bundle.blocked_domains);

        let blocked_ips = bundle
            .blocked_ips
            .iter()
            .filter_map(|raw| match raw.trim().parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!("Skipping invalid blocked IP {:?}", raw);
                    None
                }
            })
            .collect();

        let devices = bundle.devices.clone();
        let mut by_ip = HashMap::with_capacity(devices.len());
        let mut by_id = HashMap::with_capacity(devices.len());
        for (index, device) in devices.iter().enumerate() {
            if by_ip.insert(device.ip_address, index).is_some() {
                debug!("Several devices share {}, last one wins", device.ip_address);
            }
            by_id.insert(device.id, index);
        }

        Self {
            version: bundle.revision,
            protection_enabled: bundle.protection_enabled,
            matcher,
            blocked_ips,
            time_budget: TimeBudgetTracker::new(&bundle.time_limits),
            quiet_hours: bundle.quiet_hours.clone(),
            built_at: Utc::now(),
            devices,
            by_ip,
            by_id,
        }
    }

    pub fn device_by_ip(&self, ip: &IpAddr) -> Option<&Device> {
        self.by_ip.get(ip).map(|&i| &self.devices[i])
    }

    pub fn device(&self, id: &Uuid) -> Option<&Device> {
        self.by_id.get(id).map(|&i| &self.devices[i])
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            version: self.version,
            protection_enabled: self.protection_enabled,
            blocked_domains: self.matcher.len(),
            blocked_ips: self.blocked_ips.len(),
            devices: self.devices.len(),
            blocked_devices: self.devices.iter().filter(|d| d.is_blocked).count(),
            has_global_time_limit: self.time_budget.global_limit().is_some(),
            quiet_hours_configured: self.quiet_hours.is_some(),
            built_at: self.built_at,
        }
    }
}

/// The live snapshot slot shared by every decision worker.
///
/// Readers take an `Arc` to the current snapshot and keep it until their
/// decision completes; `publish` swaps the pointer in O(1).
pub struct SnapshotSlot {
    current: ArcSwap<PolicySnapshot>,
}

impl SnapshotSlot {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(PolicySnapshot::empty()),
        }
    }

    /// Slot seeded with `snapshot` whatever its version
    pub fn with_snapshot(snapshot: PolicySnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    /// The snapshot to use for one decision
    pub fn current(&self) -> Arc<PolicySnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Make `snapshot` live. Versions not newer than the live one are
    /// ignored, so publishing the same revision twice is harmless.
    pub fn publish(&self, snapshot: Arc<PolicySnapshot>) -> bool {
        let version = snapshot.version;
        let previous = self.current.rcu(|live| {
            if version > live.version {
                snapshot.clone()
            } else {
                Arc::clone(live)
            }
        });

        if version <= previous.version {
            if version < previous.version {
                warn!("Refusing to publish snapshot v{} over newer v{}", version, previous.version);
            }
            return false;
        }
        info!("Published policy snapshot v{}", version);
        true
    }
}

impl Default for SnapshotSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::categories::Category;
    use crate::models::BlockedEntry;

    fn bundle(revision: u64) -> ConfigBundle {
        let mut blocked = Device::new("kid", "192.168.1.5".parse().unwrap(), "aa:aa:aa:aa:aa:aa");
        blocked.is_blocked = true;
        ConfigBundle {
            revision,
            blocked_domains: vec![BlockedEntry::new("example.com", Category::Custom)],
            blocked_ips: vec!["203.0.113.9".into(), "not-an-ip".into()],
            devices: vec![blocked],
            ..ConfigBundle::default()
        }
    }

    #[test]
    fn test_starts_fail_open() {
        let slot = SnapshotSlot::new();
        let snapshot = slot.current();
        assert_eq!(snapshot.version, 0);
        assert!(!snapshot.protection_enabled);
    }

    #[test]
    fn test_from_bundle_indexes_devices_and_skips_bad_ips() {
        let snapshot = PolicySnapshot::from_bundle(&bundle(3));
        assert_eq!(snapshot.blocked_ips.len(), 1);
        assert!(snapshot.device_by_ip(&"192.168.1.5".parse().unwrap()).is_some());
        assert!(snapshot.device_by_ip(&"192.168.1.6".parse().unwrap()).is_none());

        let summary = snapshot.summary();
        assert_eq!(summary.version, 3);
        assert_eq!(summary.blocked_domains, 1);
        assert_eq!(summary.blocked_devices, 1);
    }

    #[test]
    fn test_publish_is_monotonic_and_idempotent() {
        let slot = SnapshotSlot::new();
        assert!(slot.publish(Arc::new(PolicySnapshot::from_bundle(&bundle(2)))));
        assert!(!slot.publish(Arc::new(PolicySnapshot::from_bundle(&bundle(2)))));
        assert!(!slot.publish(Arc::new(PolicySnapshot::from_bundle(&bundle(1)))));
        assert_eq!(slot.version(), 2);
    }

    #[test]
    fn test_concurrent_publishers_end_on_newest() {
        let snapshots: Vec<Arc<PolicySnapshot>> = (1..=8)
            .map(|v| Arc::new(PolicySnapshot::from_bundle(&bundle(v))))
            .collect();

        for _ in 0..200 {
            let slot = SnapshotSlot::new();
            let barrier = std::sync::Barrier::new(snapshots.len());
            let accepted: Vec<u64> = std::thread::scope(|s| {
                let handles: Vec<_> = snapshots
                    .iter()
                    .map(|snapshot| {
                        let (slot, barrier) = (&slot, &barrier);
                        s.spawn(move || {
                            barrier.wait();
                            slot.publish(snapshot.clone()).then_some(snapshot.version)
                        })
                    })
                    .collect();
                handles.into_iter().filter_map(|h| h.join().unwrap()).collect()
            });

            assert_eq!(slot.version(), 8);
            assert!(accepted.contains(&8));
        }
    }

    #[test]
    fn test_in_flight_reader_keeps_its_snapshot() {
        let slot = SnapshotSlot::new();
        slot.publish(Arc::new(PolicySnapshot::from_bundle(&bundle(1))));
        let held = slot.current();

        let mut next = bundle(2);
        next.blocked_domains.clear();
        slot.publish(Arc::new(PolicySnapshot::from_bundle(&next)));

        assert_eq!(held.version, 1);
        assert!(held.matcher.is_blocked("example.com"));
        assert!(!slot.current().matcher.is_blocked("example.com"));
    }
}
