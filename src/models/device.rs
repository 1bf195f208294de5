use std::net::IpAddr;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How long a device counts as active after it was last seen
pub const DEFAULT_ACTIVE_WINDOW_SECS: i64 = 300;

/// A device seen on the filtered network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable identifier
    pub id: Uuid,

    /// Friendly name, may be empty
    #[serde(default)]
    pub name: String,

    /// Current network address
    pub ip_address: IpAddr,

    /// Hardware address, the dedup key for discovery merges
    pub mac_address: String,

    /// Block every flow from this device
    #[serde(default)]
    pub is_blocked: bool,

    /// Daily allowance in minutes (`None` means unlimited)
    #[serde(default)]
    pub daily_time_limit_minutes: Option<u32>,

    /// Minutes used since the last daily reset
    #[serde(default)]
    pub time_used_today_minutes: u32,

    pub last_seen: DateTime<Utc>,

    pub first_seen: DateTime<Utc>,

    /// Lifetime count of blocked flows
    #[serde(default)]
    pub total_blocked_attempts: u64,
}

impl Device {
    /// Create a new device first seen now
    pub fn new(name: &str, ip_address: IpAddr, mac_address: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            ip_address,
            mac_address: mac_address.to_uppercase(),
            is_blocked: false,
            daily_time_limit_minutes: None,
            time_used_today_minutes: 0,
            last_seen: now,
            first_seen: now,
            total_blocked_attempts: 0,
        }
    }

    /// Builder-style helper for a daily limit
    pub fn with_daily_limit(mut self, minutes: u32) -> Self {
        self.daily_time_limit_minutes = Some(minutes);
        self
    }

    /// Seen within `window_secs` of `now`
    pub fn is_active(&self, now: DateTime<Utc>, window_secs: i64) -> bool {
        now.signed_duration_since(self.last_seen) < Duration::seconds(window_secs)
    }

    /// Name for display, falls back to the IP address
    pub fn display_name(&self) -> String {
        if self.name.trim().is_empty() {
            self.ip_address.to_string()
        } else {
            self.name.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::new("iPhone", "192.168.1.101".parse().unwrap(), "aa:bb:cc:dd:ee:ff")
    }

    #[test]
    fn test_mac_is_upper_cased() {
        assert_eq!(device().mac_address, "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_active_window() {
        let mut d = device();
        let now = Utc::now();
        d.last_seen = now - Duration::seconds(299);
        assert!(d.is_active(now, DEFAULT_ACTIVE_WINDOW_SECS));

        d.last_seen = now - Duration::seconds(300);
        assert!(!d.is_active(now, DEFAULT_ACTIVE_WINDOW_SECS));
    }

    #[test]
    fn test_display_name_falls_back_to_ip() {
        let mut d = device();
        assert_eq!(d.display_name(), "iPhone");
        d.name = "  ".into();
        assert_eq!(d.display_name(), "192.168.1.101");
    }

    #[test]
    fn test_serde_defaults() {
        let json = r#"{
            "id": "7f1c7f9e-1f59-4b8e-9a43-3f8a5e0c2d11",
            "ip_address": "10.0.0.2",
            "mac_address": "11:22:33:44:55:66",
            "last_seen": "2025-01-01T00:00:00Z",
            "first_seen": "2025-01-01T00:00:00Z"
        }"#;
        let d: Device = serde_json::from_str(json).unwrap();
        assert!(!d.is_blocked);
        assert_eq!(d.daily_time_limit_minutes, None);
        assert_eq!(d.time_used_today_minutes, 0);
    }
}
