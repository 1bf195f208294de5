use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::filter::categories::Category;
use crate::filter::matcher::normalize;

/// A blocked domain as kept by the configuration store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedEntry {
    /// Normalized domain, the uniqueness key
    pub domain: String,

    pub category: Category,

    /// Only enabled entries take part in matching
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Cumulative number of blocked flows attributed to this entry
    #[serde(default)]
    pub block_count: u64,

    #[serde(default)]
    pub last_blocked: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl BlockedEntry {
    /// Create an enabled entry, normalizing the domain
    pub fn new(domain: &str, category: Category) -> Self {
        Self {
            domain: normalize(domain),
            category,
            enabled: true,
            block_count: 0,
            last_blocked: None,
        }
    }

    /// Add `count` blocked flows, the latest at `at`
    pub fn record_blocks(&mut self, count: u64, at: DateTime<Utc>) {
        self.block_count = self.block_count.saturating_add(count);
        self.last_blocked = Some(self.last_blocked.map_or(at, |prev| prev.max(at)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_normalizes_domain() {
        let entry = BlockedEntry::new("  WWW.Facebook.COM ", Category::SocialMedia);
        assert_eq!(entry.domain, "facebook.com");
        assert!(entry.enabled);
    }

    #[test]
    fn test_record_block_updates_counters() {
        let mut entry = BlockedEntry::new("tiktok.com", Category::SocialMedia);
        let at = Utc::now();
        entry.record_blocks(2, at);
        entry.record_blocks(1, at - chrono::Duration::minutes(5));
        assert_eq!(entry.block_count, 3);
        // An older batch never moves last_blocked back
        assert_eq!(entry.last_blocked, Some(at));
    }
}
