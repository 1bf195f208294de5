use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use chrono::{Duration, Local, NaiveDate};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// How many domains a period summary reports
pub const SUMMARY_TOP_DOMAINS: usize = 10;

/// Statistics persistence errors
#[derive(Error, Debug)]
pub enum StatsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid statistics file: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StatsResult<T> = Result<T, StatsError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainCount {
    pub domain: String,
    pub count: u64,
}

/// One day of statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub date: NaiveDate,
    pub blocked_attempts: u64,
    pub active_devices: u64,
    /// Retained domains, highest count first
    pub top_domains: Vec<DomainCount>,
}

/// Totals over the last few days
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodSummary {
    pub days: u32,
    pub total_blocked: u64,
    pub average_active_devices: f64,
    pub top_domains: Vec<DomainCount>,
}

/// On-disk form of the aggregator
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StatsFile {
    pub total_blocked: u64,
    pub records: Vec<DecisionRecord>,
}

struct DayBucket {
    blocked: AtomicU64,
    active_devices: AtomicU64,
    /// Least recently incremented domain is evicted past capacity
    domains: Mutex<LruCache<String, u64>>,
}

impl DayBucket {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            blocked: AtomicU64::new(0),
            active_devices: AtomicU64::new(0),
            domains: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn bump_domain(&self, domain: &str) {
        let mut domains = self.domains.lock().unwrap_or_else(PoisonError::into_inner);
        match domains.get_mut(domain) {
            Some(count) => *count += 1,
            None => {
                domains.put(domain.to_string(), 1);
            }
        }
    }

    fn record(&self, date: NaiveDate) -> DecisionRecord {
        let domains = self.domains.lock().unwrap_or_else(PoisonError::into_inner);
        let mut top_domains: Vec<DomainCount> = domains
            .iter()
            .map(|(domain, count)| DomainCount { domain: domain.clone(), count: *count })
            .collect();
        drop(domains);
        sort_by_count(&mut top_domains);

        DecisionRecord {
            date,
            blocked_attempts: self.blocked.load(Ordering::Relaxed),
            active_devices: self.active_devices.load(Ordering::Relaxed),
            top_domains,
        }
    }
}

fn sort_by_count(domains: &mut [DomainCount]) {
    domains.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.domain.cmp(&b.domain)));
}

/// Per-day block statistics, safe to update from any number of workers.
///
/// Day buckets are created lazily on the first event of a day. Counters
/// are atomics; only the bounded per-day domain map takes a short lock.
pub struct StatsAggregator {
    total_blocked: AtomicU64,
    days: RwLock<BTreeMap<NaiveDate, Arc<DayBucket>>>,
    domain_capacity: NonZeroUsize,
}

impl StatsAggregator {
    pub fn new(domain_capacity: usize) -> Self {
        Self {
            total_blocked: AtomicU64::new(0),
            days: RwLock::new(BTreeMap::new()),
            domain_capacity: NonZeroUsize::new(domain_capacity).unwrap_or(NonZeroUsize::MIN),
        }
    }

    fn bucket(&self, date: NaiveDate) -> Arc<DayBucket> {
        {
            let days = self.days.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(bucket) = days.get(&date) {
                return bucket.clone();
            }
        }

        let mut days = self.days.write().unwrap_or_else(PoisonError::into_inner);
        days.entry(date)
            .or_insert_with(|| Arc::new(DayBucket::new(self.domain_capacity)))
            .clone()
    }

    /// Count one blocked flow today
    pub fn record_block(&self, domain: Option<&str>) {
        self.record_block_at(domain, Local::now().date_naive());
    }

    pub fn record_block_at(&self, domain: Option<&str>, date: NaiveDate) {
        self.total_blocked.fetch_add(1, Ordering::Relaxed);

        let bucket = self.bucket(date);
        bucket.blocked.fetch_add(1, Ordering::Relaxed);
        if let Some(domain) = domain.filter(|d| !d.is_empty()) {
            bucket.bump_domain(domain);
        }
    }

    /// Latest active-device count for today
    pub fn record_active_devices(&self, count: u64) {
        self.record_active_devices_at(count, Local::now().date_naive());
    }

    pub fn record_active_devices_at(&self, count: u64, date: NaiveDate) {
        self.bucket(date).active_devices.store(count, Ordering::Relaxed);
    }

    /// Lifetime blocked attempts
    pub fn total_blocked(&self) -> u64 {
        self.total_blocked.load(Ordering::Relaxed)
    }

    pub fn today(&self) -> DecisionRecord {
        self.record_for(Local::now().date_naive())
    }

    /// Record for `date`, empty when nothing happened that day
    pub fn record_for(&self, date: NaiveDate) -> DecisionRecord {
        let bucket = {
            let days = self.days.read().unwrap_or_else(PoisonError::into_inner);
            days.get(&date).cloned()
        };

        match bucket {
            Some(bucket) => bucket.record(date),
            None => DecisionRecord {
                date,
                blocked_attempts: 0,
                active_devices: 0,
                top_domains: Vec::new(),
            },
        }
    }

    /// Drop days more than `retention_days` before `today`; returns how many went
    pub fn prune(&self, retention_days: u32, today: NaiveDate) -> usize {
        let cutoff = today - Duration::days(i64::from(retention_days));
        let mut days = self.days.write().unwrap_or_else(PoisonError::into_inner);
        let kept = days.split_off(&cutoff);
        let removed = days.len();
        *days = kept;

        if removed > 0 {
            debug!("Pruned {} statistics days before {}", removed, cutoff);
        }
        removed
    }

    /// Totals for the `days` days ending with `today`
    pub fn period_summary(&self, days: u32, today: NaiveDate) -> PeriodSummary {
        let start = today - Duration::days(i64::from(days.max(1)) - 1);
        let records: Vec<DecisionRecord> = {
            let map = self.days.read().unwrap_or_else(PoisonError::into_inner);
            map.range(start..=today)
                .map(|(date, bucket)| bucket.record(*date))
                .collect()
        };

        let total_blocked = records.iter().map(|r| r.blocked_attempts).sum();
        let average_active_devices = if records.is_empty() {
            0.0
        } else {
            records.iter().map(|r| r.active_devices as f64).sum::<f64>() / records.len() as f64
        };

        let mut merged: HashMap<String, u64> = HashMap::new();
        for record in &records {
            for entry in &record.top_domains {
                *merged.entry(entry.domain.clone()).or_default() += entry.count;
            }
        }
        let mut top_domains: Vec<DomainCount> = merged
            .into_iter()
            .map(|(domain, count)| DomainCount { domain, count })
            .collect();
        sort_by_count(&mut top_domains);
        top_domains.truncate(SUMMARY_TOP_DOMAINS);

        PeriodSummary {
            days: days.max(1),
            total_blocked,
            average_active_devices,
            top_domains,
        }
    }

    /// Every retained day, oldest first
    pub fn records(&self) -> Vec<DecisionRecord> {
        let days = self.days.read().unwrap_or_else(PoisonError::into_inner);
        days.iter().map(|(date, bucket)| bucket.record(*date)).collect()
    }

    pub fn to_file(&self) -> StatsFile {
        StatsFile {
            total_blocked: self.total_blocked(),
            records: self.records(),
        }
    }

    /// Rebuild from a saved file; domains beyond capacity are dropped lowest first
    pub fn from_file(file: StatsFile, domain_capacity: usize) -> Self {
        let aggregator = Self::new(domain_capacity);
        aggregator.total_blocked.store(file.total_blocked, Ordering::Relaxed);

        {
            let mut days = aggregator.days.write().unwrap_or_else(PoisonError::into_inner);
            for record in file.records {
                let bucket = DayBucket::new(aggregator.domain_capacity);
                bucket.blocked.store(record.blocked_attempts, Ordering::Relaxed);
                bucket.active_devices.store(record.active_devices, Ordering::Relaxed);
                {
                    let mut domains = bucket.domains.lock().unwrap_or_else(PoisonError::into_inner);
                    // Lowest first so the highest counts end up most recent
                    for entry in record.top_domains.into_iter().rev() {
                        domains.put(entry.domain, entry.count);
                    }
                }
                days.insert(record.date, Arc::new(bucket));
            }
        }

        aggregator
    }

    /// Load from `path`, or start empty when the file does not exist
    pub async fn load(path: &Path, domain_capacity: usize) -> StatsResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                let file: StatsFile = serde_json::from_str(&text)?;
                info!("Loaded {} statistics days from {}", file.records.len(), path.display());
                Ok(Self::from_file(file, domain_capacity))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new(domain_capacity)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> StatsResult<()> {
        let json = serde_json::to_vec_pretty(&self.to_file())?;
        crate::sync::store::write_atomic(path, &json).await?;
        Ok(())
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new(100)
    }
}
