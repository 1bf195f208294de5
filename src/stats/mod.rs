pub mod aggregator;
pub mod channel;

pub use aggregator::{DecisionRecord, StatsAggregator};
pub use channel::{stats_channel, StatsEvent, StatsSender};
