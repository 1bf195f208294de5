use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::{BlockedEntry, Device, QuietHours, TimeLimit};

/// Full configuration as transferred between the store and the enforcer.
///
/// Always moved as a whole; there are no partial updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigBundle {
    /// Bumped on every decision-relevant change
    #[serde(default)]
    pub revision: u64,

    #[serde(default = "default_true")]
    pub protection_enabled: bool,

    #[serde(default)]
    pub blocked_domains: Vec<BlockedEntry>,

    #[serde(default)]
    pub blocked_ips: Vec<String>,

    #[serde(default)]
    pub devices: Vec<Device>,

    #[serde(default)]
    pub time_limits: Vec<TimeLimit>,

    /// Quiet hours applying to every device
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,

    #[serde(default)]
    pub last_daily_reset: Option<NaiveDate>,
}

fn default_true() -> bool {
    true
}

impl Default for ConfigBundle {
    fn default() -> Self {
        Self {
            revision: 0,
            protection_enabled: true,
            blocked_domains: Vec::new(),
            blocked_ips: Vec::new(),
            devices: Vec::new(),
            time_limits: Vec::new(),
            quiet_hours: None,
            last_daily_reset: None,
        }
    }
}
