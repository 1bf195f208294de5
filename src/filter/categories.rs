use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::models::blocked_entry::BlockedEntry;

/// Predefined categories for blocked domains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    SocialMedia,
    AdultContent,
    Gambling,
    Gaming,
    Custom,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::SocialMedia,
        Category::AdultContent,
        Category::Gambling,
        Category::Gaming,
        Category::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::SocialMedia => "social_media",
            Category::AdultContent => "adult_content",
            Category::Gambling => "gambling",
            Category::Gaming => "gaming",
            Category::Custom => "custom",
        }
    }

    /// Preset domains shipped for this category.
    ///
    /// Adult content and custom have no shipped list; adult lists are
    /// expected to come from an external source.
    pub fn preset_domains(&self) -> &'static [&'static str] {
        match self {
            Category::SocialMedia => &[
                "facebook.com",
                "instagram.com",
                "twitter.com",
                "x.com",
                "tiktok.com",
                "snapchat.com",
                "reddit.com",
                "linkedin.com",
                "pinterest.com",
                "tumblr.com",
                "youtube.com",
                "twitch.tv",
            ],
            Category::Gaming => &[
                "roblox.com",
                "minecraft.net",
                "fortnite.com",
                "epicgames.com",
                "steam.com",
                "steampowered.com",
                "playstation.com",
                "xbox.com",
                "ea.com",
                "origin.com",
            ],
            Category::Gambling => &[
                "bet365.com",
                "draftkings.com",
                "fanduel.com",
                "pokerstars.com",
                "betfair.com",
                "888casino.com",
                "williamhill.com",
            ],
            Category::AdultContent | Category::Custom => &[],
        }
    }

    /// Preset entries for this category, enabled and with zero counters
    pub fn preset_entries(&self) -> Vec<BlockedEntry> {
        self.preset_domains()
            .iter()
            .map(|domain| BlockedEntry::new(domain, *self))
            .collect()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "social_media" | "social" => Ok(Category::SocialMedia),
            "adult_content" | "adult" => Ok(Category::AdultContent),
            "gambling" => Ok(Category::Gambling),
            "gaming" => Ok(Category::Gaming),
            "custom" => Ok(Category::Custom),
            other => Err(format!("unknown category: {}", other)),
        }
    }
}
