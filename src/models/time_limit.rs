use std::collections::BTreeSet;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Daily time budget, either for one device or for all of them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLimit {
    pub id: Uuid,

    /// `None` applies the limit to every device
    #[serde(default)]
    pub device_id: Option<Uuid>,

    pub daily_limit_minutes: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
}

impl TimeLimit {
    pub fn new(device_id: Option<Uuid>, daily_limit_minutes: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id,
            daily_limit_minutes,
            enabled: true,
            quiet_hours: None,
        }
    }

    pub fn applies_to_all_devices(&self) -> bool {
        self.device_id.is_none()
    }
}

/// Recurring window during which all traffic is blocked.
///
/// Weekdays are numbered 1 = Sunday through 7 = Saturday. Only the time of
/// day of `start` and `end` matters; `end < start` spans midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(with = "time_of_day")]
    pub start: NaiveTime,

    #[serde(with = "time_of_day")]
    pub end: NaiveTime,

    #[serde(default = "every_day")]
    pub days_of_week: BTreeSet<u8>,
}

impl QuietHours {
    /// Enabled every day of the week
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            enabled: true,
            start,
            end,
            days_of_week: every_day(),
        }
    }

    pub fn on_days(mut self, days: impl IntoIterator<Item = u8>) -> Self {
        self.days_of_week = days.into_iter().filter(|d| (1..=7).contains(d)).collect();
        self
    }
}

fn default_true() -> bool {
    true
}

fn every_day() -> BTreeSet<u8> {
    (1..=7).collect()
}

/// `HH:MM` on the wire, `HH:MM:SS` also accepted when reading
mod time_of_day {
    use chrono::NaiveTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(|e| de::Error::custom(format!("invalid time of day {:?}: {}", raw, e)))
    }
}
