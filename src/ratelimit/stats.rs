//! Admission statistics.
//!
//! Every decision is folded into a fixed-width time bucket. Snapshots merge
//! the buckets covering a trailing range without mutating them; the cleaner
//! prunes buckets older than the retention horizon.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, TurnstileError};

/// Range used when a caller supplies one that cannot be parsed.
pub const DEFAULT_RANGE_MS: u64 = 3_600_000;

/// Parse a trailing range such as `500ms`, `30s`, `15m`, `1h` or `7d`.
pub fn parse_range(range: &str) -> Result<u64> {
    let range = range.trim();
    let split = range
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| TurnstileError::InvalidRange(format!("missing unit in {:?}", range)))?;
    let (digits, unit) = range.split_at(split);

    let amount: u64 = digits
        .parse()
        .map_err(|_| TurnstileError::InvalidRange(format!("missing amount in {:?}", range)))?;

    let unit_ms: u64 = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        other => {
            return Err(TurnstileError::InvalidRange(format!(
                "unknown unit {:?} in {:?}",
                other, range
            )))
        }
    };

    amount
        .checked_mul(unit_ms)
        .ok_or_else(|| TurnstileError::InvalidRange(format!("{:?} is too large", range)))
}

/// One admission decision, as handed to [`StatisticsCollector::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRecord<'a> {
    pub at_ms: u64,
    pub ip: &'a str,
    /// Caller identity, `ip` or `ip:user`
    pub identifier: &'a str,
    pub endpoint: &'a str,
    /// Rules consulted for this request, in evaluation order
    pub evaluated: &'a [String],
    /// Rule that denied the request, if a rule did
    pub blocked_by: Option<&'a str>,
    pub allowed: bool,
}

/// A key and how often it was blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedCount {
    pub key: String,
    pub count: u64,
}

/// Per-rule totals within a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStatistics {
    pub name: String,
    /// Requests on which the rule was consulted
    pub evaluated: u64,
    /// Requests the rule denied
    pub blocked: u64,
}

/// Statistics over a trailing time range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub range_ms: u64,
    pub generated_at: DateTime<Utc>,
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub top_blocked_ips: Vec<RankedCount>,
    pub top_blocked_identifiers: Vec<RankedCount>,
    pub top_blocked_endpoints: Vec<RankedCount>,
    pub rules: Vec<RuleStatistics>,
}

/// Blocked counts per key, capped at a number of distinct keys.
struct Tally {
    counts: DashMap<String, u64>,
    keys: AtomicUsize,
}

impl Tally {
    fn new() -> Self {
        Self {
            counts: DashMap::new(),
            keys: AtomicUsize::new(0),
        }
    }

    /// Count `key`, or report `false` when it is new and the cap is reached.
    fn bump(&self, key: &str, max_keys: usize) -> bool {
        if let Some(mut count) = self.counts.get_mut(key) {
            *count += 1;
            return true;
        }
        if self.keys.load(Ordering::Relaxed) >= max_keys {
            return false;
        }
        let mut count = self.counts.entry(key.to_string()).or_insert_with(|| {
            self.keys.fetch_add(1, Ordering::Relaxed);
            0
        });
        *count += 1;
        true
    }

    fn merge_into(&self, totals: &mut HashMap<String, u64>) {
        for entry in self.counts.iter() {
            *totals.entry(entry.key().clone()).or_default() += *entry.value();
        }
    }
}

#[derive(Default, Clone, Copy)]
struct RuleTally {
    evaluated: u64,
    blocked: u64,
}

/// Aggregated decisions for one `bucket_ms` slice of time.
struct Bucket {
    total: AtomicU64,
    blocked: AtomicU64,
    /// Blocked decisions whose key did not fit under the key cap
    untracked: AtomicU64,
    ips: Tally,
    identifiers: Tally,
    endpoints: Tally,
    rules: DashMap<String, RuleTally>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            untracked: AtomicU64::new(0),
            ips: Tally::new(),
            identifiers: Tally::new(),
            endpoints: Tally::new(),
            rules: DashMap::new(),
        }
    }

    fn add(&self, record: &RequestRecord<'_>, max_keys: usize) {
        self.total.fetch_add(1, Ordering::Relaxed);
        for name in record.evaluated {
            rule_tally(&self.rules, name, |t| t.evaluated += 1);
        }
        if record.allowed {
            return;
        }

        self.blocked.fetch_add(1, Ordering::Relaxed);
        let ip = self.ips.bump(record.ip, max_keys);
        let identifier = self.identifiers.bump(record.identifier, max_keys);
        let endpoint = self.endpoints.bump(record.endpoint, max_keys);
        if !(ip && identifier && endpoint) {
            self.untracked.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(name) = record.blocked_by {
            rule_tally(&self.rules, name, |t| t.blocked += 1);
        }
    }
}

fn rule_tally(rules: &DashMap<String, RuleTally>, name: &str, f: impl FnOnce(&mut RuleTally)) {
    match rules.get_mut(name) {
        Some(mut tally) => f(&mut *tally),
        None => f(&mut *rules.entry(name.to_string()).or_default()),
    }
}

/// Collects admission outcomes for reporting.
///
/// Decisions are aggregated into time buckets on the way in, so recording
/// touches one bucket's map shards and a snapshot merges only the buckets
/// its range covers. No lock spans more than one bucket.
pub struct StatisticsCollector {
    buckets: DashMap<u64, Arc<Bucket>>,
    lifetime_total: AtomicU64,
    lifetime_blocked: AtomicU64,
    bucket_ms: u64,
    retention_ms: u64,
    top_n: usize,
    max_ranked_keys: usize,
}

impl StatisticsCollector {
    pub fn new(bucket_ms: u64, retention_ms: u64, top_n: usize, max_ranked_keys: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            lifetime_total: AtomicU64::new(0),
            lifetime_blocked: AtomicU64::new(0),
            bucket_ms: bucket_ms.max(1),
            retention_ms,
            top_n,
            max_ranked_keys,
        }
    }

    fn bucket_start(&self, at_ms: u64) -> u64 {
        at_ms - at_ms % self.bucket_ms
    }

    /// Add a decision to the bucket covering `record.at_ms`.
    pub fn record(&self, record: RequestRecord<'_>) {
        self.lifetime_total.fetch_add(1, Ordering::Relaxed);
        if !record.allowed {
            self.lifetime_blocked.fetch_add(1, Ordering::Relaxed);
        }

        let start = self.bucket_start(record.at_ms);
        let bucket = match self.buckets.get(&start) {
            Some(bucket) => bucket.clone(),
            None => self
                .buckets
                .entry(start)
                .or_insert_with(|| Arc::new(Bucket::new()))
                .clone(),
        };
        bucket.add(&record, self.max_ranked_keys);
    }

    /// Requests seen since creation, regardless of retention.
    pub fn lifetime_total(&self) -> u64 {
        self.lifetime_total.load(Ordering::Relaxed)
    }

    /// Requests blocked since creation, regardless of retention.
    pub fn lifetime_blocked(&self) -> u64 {
        self.lifetime_blocked.load(Ordering::Relaxed)
    }

    /// Number of time buckets currently stored.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop buckets that ended before the retention horizon.
    pub fn prune(&self, now_ms: u64) -> usize {
        let Some(horizon) = now_ms.checked_sub(self.retention_ms) else {
            return 0;
        };
        let before = self.buckets.len();
        self.buckets.retain(|start, _| start + self.bucket_ms > horizon);
        before.saturating_sub(self.buckets.len())
    }

    /// Compute a snapshot of the buckets overlapping `range_ms` before `now_ms`.
    ///
    /// The range is honoured to bucket granularity.
    pub fn snapshot(&self, range_ms: u64, now_ms: u64) -> StatisticsSnapshot {
        let first = self.bucket_start(now_ms.saturating_sub(range_ms));

        let buckets: Vec<Arc<Bucket>> = self
            .buckets
            .iter()
            .filter(|entry| *entry.key() >= first && *entry.key() <= now_ms)
            .map(|entry| entry.value().clone())
            .collect();

        let mut total_requests = 0;
        let mut blocked_requests = 0;
        let mut untracked = 0;
        let mut blocked_ips: HashMap<String, u64> = HashMap::new();
        let mut blocked_identifiers: HashMap<String, u64> = HashMap::new();
        let mut blocked_endpoints: HashMap<String, u64> = HashMap::new();
        let mut rules: HashMap<String, RuleStatistics> = HashMap::new();

        for bucket in &buckets {
            total_requests += bucket.total.load(Ordering::Relaxed);
            blocked_requests += bucket.blocked.load(Ordering::Relaxed);
            untracked += bucket.untracked.load(Ordering::Relaxed);
            bucket.ips.merge_into(&mut blocked_ips);
            bucket.identifiers.merge_into(&mut blocked_identifiers);
            bucket.endpoints.merge_into(&mut blocked_endpoints);

            for entry in bucket.rules.iter() {
                let stats = rules
                    .entry(entry.key().clone())
                    .or_insert_with(|| RuleStatistics {
                        name: entry.key().clone(),
                        evaluated: 0,
                        blocked: 0,
                    });
                stats.evaluated += entry.value().evaluated;
                stats.blocked += entry.value().blocked;
            }
        }

        if untracked > 0 {
            debug!(untracked = untracked, "Blocked keys exceeded the ranking cap");
        }

        let mut rules: Vec<RuleStatistics> = rules.into_values().collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name));

        StatisticsSnapshot {
            range_ms,
            generated_at: DateTime::from_timestamp_millis(now_ms as i64).unwrap_or_default(),
            total_requests,
            blocked_requests,
            top_blocked_ips: rank(blocked_ips, self.top_n),
            top_blocked_identifiers: rank(blocked_identifiers, self.top_n),
            top_blocked_endpoints: rank(blocked_endpoints, self.top_n),
            rules,
        }
    }
}

/// Sort by count descending, then key ascending, and keep the first `top_n`.
fn rank(counts: HashMap<String, u64>, top_n: usize) -> Vec<RankedCount> {
    let mut ranked: Vec<RankedCount> = counts
        .into_iter()
        .map(|(key, count)| RankedCount { key, count })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    ranked.truncate(top_n);
    ranked
}
