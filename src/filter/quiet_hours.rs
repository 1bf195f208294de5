use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike};

use crate::models::QuietHours;

fn minutes_since_midnight(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

impl QuietHours {
    /// Whether `now` (local wall-clock time) falls inside the window.
    ///
    /// Both ends are inclusive at minute resolution. A window whose start
    /// equals its end is zero-width and never active.
    pub fn is_active(&self, now: NaiveDateTime) -> bool {
        if !self.enabled {
            return false;
        }

        let weekday = now.weekday().number_from_sunday() as u8;
        if !self.days_of_week.contains(&weekday) {
            return false;
        }

        let current = minutes_since_midnight(now.time());
        let start = minutes_since_midnight(self.start);
        let end = minutes_since_midnight(self.end);

        if start == end {
            false
        } else if end > start {
            start <= current && current <= end
        } else {
            // Overnight, e.g. 22:00 - 07:00
            current >= start || current <= end
        }
    }
}
