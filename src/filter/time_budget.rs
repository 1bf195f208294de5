use std::collections::HashMap;
use chrono::NaiveDate;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{Device, TimeLimit};

/// Resolves daily limits for devices and answers budget questions.
///
/// Limit precedence for a device: its first enabled per-device
/// `TimeLimit`, then the device's own `daily_time_limit_minutes`, then the
/// first enabled global `TimeLimit`.
#[derive(Debug, Clone, Default)]
pub struct TimeBudgetTracker {
    per_device: HashMap<Uuid, TimeLimit>,
    global: Option<TimeLimit>,
}

impl TimeBudgetTracker {
    pub fn new(limits: &[TimeLimit]) -> Self {
        let mut tracker = Self::default();

        for limit in limits.iter().filter(|l| l.enabled) {
            match limit.device_id {
                Some(device_id) => {
                    tracker.per_device.entry(device_id).or_insert_with(|| limit.clone());
                }
                None if tracker.global.is_none() => {
                    tracker.global = Some(limit.clone());
                }
                None => {
                    warn!(
                        "Ignoring extra global time limit {} ({} min); first global limit wins",
                        limit.id, limit.daily_limit_minutes
                    );
                }
            }
        }

        tracker
    }

    /// The time limit entry governing `device`, or the global one
    pub fn time_limit_for(&self, device: Option<&Device>) -> Option<&TimeLimit> {
        device
            .and_then(|d| self.per_device.get(&d.id))
            .or(self.global.as_ref())
    }

    pub fn global_limit(&self) -> Option<&TimeLimit> {
        self.global.as_ref()
    }

    /// Effective daily limit in minutes, `None` when unlimited
    pub fn limit_for(&self, device: &Device) -> Option<u32> {
        if let Some(limit) = self.per_device.get(&device.id) {
            return Some(limit.daily_limit_minutes);
        }
        device
            .daily_time_limit_minutes
            .or_else(|| self.global.as_ref().map(|l| l.daily_limit_minutes))
    }

    /// Minutes left today, never negative; `None` when unlimited
    pub fn remaining(&self, device: &Device) -> Option<u32> {
        self.limit_for(device)
            .map(|limit| limit.saturating_sub(device.time_used_today_minutes))
    }

    pub fn has_exceeded(&self, device: &Device) -> bool {
        match self.limit_for(device) {
            Some(limit) => device.time_used_today_minutes >= limit,
            None => false,
        }
    }

    /// Add connected minutes to a device's usage for today
    pub fn record_usage(device: &mut Device, minutes: u32) {
        device.time_used_today_minutes = device.time_used_today_minutes.saturating_add(minutes);
    }
}

/// Tracks the last calendar day usage counters were zeroed
#[derive(Debug, Clone, Default)]
pub struct DailyReset {
    last_reset: Option<NaiveDate>,
}

impl DailyReset {
    pub fn new(last_reset: Option<NaiveDate>) -> Self {
        Self { last_reset }
    }

    pub fn last_reset(&self) -> Option<NaiveDate> {
        self.last_reset
    }

    /// Zero every device's usage if `today` is past the last reset day.
    ///
    /// Returns whether a reset happened; later calls on the same day are
    /// no-ops, as are calls with a date before the last reset.
    pub fn reset_daily(&mut self, devices: &mut [Device], today: NaiveDate) -> bool {
        if matches!(self.last_reset, Some(last) if last >= today) {
            return false;
        }

        for device in devices.iter_mut() {
            device.time_used_today_minutes = 0;
        }
        self.last_reset = Some(today);
        info!("Daily usage reset for {} devices ({})", devices.len(), today);
        true
    }
}
