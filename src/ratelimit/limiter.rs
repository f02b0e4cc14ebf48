//! Core rate limiter implementation.
//!
//! The [`RateLimiter`] owns every registry (rules, access lists, counters,
//! statistics) so independent instances never share state. A decision runs
//! through the access lists first, then every matching rule in priority
//! order; the first rule that denies ends evaluation, and a request is only
//! allowed when all matching rules agree.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::access::AccessList;
use super::backend::CounterBackend;
use super::cleaner::{Cleaner, SweepReport};
use super::clock::{Clock, SystemClock};
use super::counter::{FixedWindowCounter, SlidingWindowCounter, TokenBucketCounter};
use super::events::{EventNotifier, LimitExceeded, LimitListener};
use super::identifier::{CounterKey, Identifier};
use super::rules::{Algorithm, Rule, RuleStore};
use super::stats::{
    parse_range, RequestRecord, StatisticsCollector, StatisticsSnapshot, DEFAULT_RANGE_MS,
};
use crate::config::EngineConfig;

/// An inbound request as seen by the limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub ip: String,
    pub endpoint: String,
    #[serde(default)]
    pub method: String,
    #[serde(default, alias = "userId")]
    pub user_id: Option<String>,
}

impl Request {
    pub fn new(
        ip: impl Into<String>,
        endpoint: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            ip: ip.into(),
            endpoint: endpoint.into(),
            method: method.into(),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// The caller identity quotas are tracked against.
    pub fn identifier(&self) -> Identifier {
        Identifier::new(&self.ip, self.user_id.as_deref())
    }
}

/// Why a decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    Whitelisted,
    IpBlacklisted,
    RateLimitExceeded,
    BurstLimitExceeded,
}

/// The verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Requests left under the tightest matching rule; `None` when unbounded
    pub remaining: Option<u64>,
    pub retry_after_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    /// Rule that denied the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

impl RateLimitResult {
    fn unbounded(reason: Option<Reason>) -> Self {
        Self {
            allowed: true,
            remaining: None,
            retry_after_ms: 0,
            reason,
            rule: None,
        }
    }

    fn within_limit(remaining: i64) -> Self {
        Self {
            allowed: true,
            remaining: Some(remaining.max(0) as u64),
            retry_after_ms: 0,
            reason: None,
            rule: None,
        }
    }

    fn denied(reason: Reason, retry_after_ms: u64, rule: Option<&str>) -> Self {
        Self {
            allowed: false,
            remaining: Some(0),
            retry_after_ms,
            reason: Some(reason),
            rule: rule.map(str::to_string),
        }
    }

    /// `retry_after_ms` rounded up to whole seconds, as used by `Retry-After`.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_ms.div_ceil(1_000)
    }
}

/// The admission-control engine.
///
/// This struct is thread-safe and can be shared across threads and tasks.
pub struct RateLimiter {
    rules: RuleStore,
    access: AccessList,
    sliding: Arc<SlidingWindowCounter>,
    token_bucket: Arc<TokenBucketCounter>,
    fixed: Arc<FixedWindowCounter>,
    stats: Arc<StatisticsCollector>,
    events: EventNotifier,
    cleaner: Cleaner,
    clock: Arc<dyn Clock>,
    destroyed: AtomicBool,
}

impl RateLimiter {
    /// Create a rate limiter with default settings.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create a rate limiter with the given settings and the system clock.
    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a rate limiter reading time from `clock`.
    ///
    /// When called inside a tokio runtime the background cleaner starts
    /// immediately; otherwise [`RateLimiter::sweep`] must be driven by the
    /// caller.
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let sliding = Arc::new(SlidingWindowCounter::new());
        let token_bucket = Arc::new(TokenBucketCounter::new());
        let fixed = Arc::new(FixedWindowCounter::new());
        let stats = Arc::new(StatisticsCollector::new(
            config.stats_bucket_ms,
            config.stats_retention_ms,
            config.top_n,
            config.max_ranked_keys,
        ));

        let counters: Vec<Arc<dyn CounterBackend>> = vec![
            sliding.clone() as Arc<dyn CounterBackend>,
            token_bucket.clone(),
            fixed.clone(),
        ];
        let cleaner = Cleaner::new(
            counters,
            stats.clone(),
            clock.clone(),
            config.cleanup_interval(),
        );
        cleaner.start();

        info!(
            cleanup_interval_ms = config.cleanup_interval_ms,
            stats_bucket_ms = config.stats_bucket_ms,
            "Rate limiter initialized"
        );

        Self {
            rules: RuleStore::new(),
            access: AccessList::new(),
            sliding,
            token_bucket,
            fixed,
            stats,
            events: EventNotifier::new(config.event_channel_capacity),
            cleaner,
            clock,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Store a rule. Never fails; malformed rules are kept but never deny.
    pub fn add_rule(&self, rule: Rule) {
        let name = rule.name.clone();
        if self.rules.add(rule).is_some() {
            self.discard_counters(&name);
        }
    }

    /// Remove a rule and its counters.
    pub fn remove_rule(&self, name: &str) {
        if self.rules.remove(name).is_some() {
            self.discard_counters(name);
        }
    }

    /// All stored rules in insertion order.
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        self.rules.rules()
    }

    pub fn rule(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.get(name)
    }

    pub fn add_to_whitelist(&self, id: &str) {
        self.access.add_to_whitelist(id);
    }

    pub fn remove_from_whitelist(&self, id: &str) {
        self.access.remove_from_whitelist(id);
    }

    pub fn add_to_blacklist(&self, id: &str) {
        self.access.add_to_blacklist(id);
    }

    pub fn remove_from_blacklist(&self, id: &str) {
        self.access.remove_from_blacklist(id);
    }

    pub fn whitelist(&self) -> Vec<String> {
        self.access.whitelist()
    }

    pub fn blacklist(&self) -> Vec<String> {
        self.access.blacklist()
    }

    /// Decide whether `request` may proceed.
    #[instrument(
        level = "trace",
        skip(self, request),
        fields(ip = %request.ip, endpoint = %request.endpoint, method = %request.method)
    )]
    pub fn check_limit(&self, request: &Request) -> RateLimitResult {
        let now_ms = self.clock.now_ms();
        let identifier = request.identifier();

        let (result, evaluated) = self.evaluate(request, &identifier, now_ms);

        let identifier = identifier.to_string_key();
        self.stats.record(RequestRecord {
            at_ms: now_ms,
            ip: &request.ip,
            identifier: &identifier,
            endpoint: &request.endpoint,
            evaluated: &evaluated,
            blocked_by: result.rule.as_deref(),
            allowed: result.allowed,
        });

        result
    }

    /// Run the decision steps, returning the verdict and the rules consulted.
    fn evaluate(
        &self,
        request: &Request,
        identifier: &Identifier,
        now_ms: u64,
    ) -> (RateLimitResult, Vec<String>) {
        let class = self.access.classify(&request.ip);
        if class.blacklisted {
            debug!(ip = %request.ip, "Request denied by blacklist");
            return (RateLimitResult::denied(Reason::IpBlacklisted, 0, None), Vec::new());
        }
        if class.whitelisted {
            trace!(ip = %request.ip, "Request allowed by whitelist");
            return (RateLimitResult::unbounded(Some(Reason::Whitelisted)), Vec::new());
        }

        let rules = self.rules.match_endpoint(&request.endpoint);
        if rules.is_empty() {
            return (RateLimitResult::unbounded(None), Vec::new());
        }

        let mut evaluated = Vec::with_capacity(rules.len());
        let mut remaining = i64::MAX;

        for rule in &rules {
            evaluated.push(rule.name.clone());

            if rule.is_inert() {
                remaining = remaining.min(rule.limit);
                continue;
            }

            if let Some(burst) = &rule.burst_protection {
                let key = CounterKey::burst(&rule.name, identifier);
                let outcome = self.sliding.consume(&key, burst.limit, burst.window_ms, now_ms);
                if !outcome.allowed {
                    debug!(
                        rule = %rule.name,
                        identifier = %identifier,
                        retry_after_ms = outcome.retry_after_ms,
                        "Burst limit exceeded"
                    );
                    return (
                        RateLimitResult::denied(
                            Reason::BurstLimitExceeded,
                            outcome.retry_after_ms,
                            Some(&rule.name),
                        ),
                        evaluated,
                    );
                }
            }

            let Some(backend) = self.backend(&rule.algorithm) else {
                continue;
            };
            let key = CounterKey::primary(&rule.name, identifier);
            let outcome = backend.consume(&key, rule.limit, rule.window_ms, now_ms);

            if !outcome.allowed {
                debug!(
                    rule = %rule.name,
                    identifier = %identifier,
                    algorithm = backend.name(),
                    retry_after_ms = outcome.retry_after_ms,
                    "Rate limit exceeded"
                );
                self.events.publish(LimitExceeded {
                    id: Uuid::new_v4(),
                    rule: rule.name.clone(),
                    identifier: identifier.to_string_key(),
                    endpoint: request.endpoint.clone(),
                    retry_after_ms: outcome.retry_after_ms,
                    at: chrono::DateTime::from_timestamp_millis(now_ms as i64).unwrap_or_default(),
                });
                return (
                    RateLimitResult::denied(
                        Reason::RateLimitExceeded,
                        outcome.retry_after_ms,
                        Some(&rule.name),
                    ),
                    evaluated,
                );
            }

            remaining = remaining.min(outcome.remaining);
        }

        (RateLimitResult::within_limit(remaining), evaluated)
    }

    fn backend(&self, algorithm: &Algorithm) -> Option<&dyn CounterBackend> {
        match algorithm {
            Algorithm::SlidingWindow => Some(self.sliding.as_ref()),
            Algorithm::TokenBucket => Some(self.token_bucket.as_ref()),
            Algorithm::FixedWindow => Some(self.fixed.as_ref()),
            Algorithm::Unrecognized(_) => None,
        }
    }

    fn discard_counters(&self, rule: &str) {
        self.sliding.remove_rule(rule);
        self.token_bucket.remove_rule(rule);
        self.fixed.remove_rule(rule);
    }

    /// Statistics over a trailing range such as `"1h"`.
    ///
    /// An unparseable range falls back to one hour.
    pub fn statistics(&self, range: &str) -> StatisticsSnapshot {
        let range_ms = parse_range(range).unwrap_or_else(|e| {
            warn!(range = %range, error = %e, "Falling back to default statistics range");
            DEFAULT_RANGE_MS
        });
        self.statistics_for(range_ms)
    }

    /// Statistics over the last `range_ms` milliseconds.
    pub fn statistics_for(&self, range_ms: u64) -> StatisticsSnapshot {
        self.stats.snapshot(range_ms, self.clock.now_ms())
    }

    /// Direct access to the statistics collector.
    pub fn statistics_collector(&self) -> &StatisticsCollector {
        &self.stats
    }

    /// Register a limit-exceeded listener. Requires a tokio runtime.
    pub fn on<L: LimitListener>(&self, listener: L) -> bool {
        self.events.on(listener)
    }

    /// Receive limit-exceeded notifications on a channel.
    pub fn subscribe(&self) -> broadcast::Receiver<LimitExceeded> {
        self.events.subscribe()
    }

    /// Wait for listeners to handle every notification published so far.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn flush_events(&self, timeout: Duration) -> bool {
        self.events.flush(timeout).await
    }

    /// Run one cleanup pass now.
    pub fn sweep(&self) -> SweepReport {
        self.cleaner.sweep()
    }

    /// Number of live counter entries across all algorithms.
    pub fn counter_count(&self) -> usize {
        self.sliding.len() + self.token_bucket.len() + self.fixed.len()
    }

    /// Stop background cleanup and release listeners.
    ///
    /// Idempotent. Admission decisions keep working afterwards.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cleaner.stop();
        self.events.shutdown();
        info!("Rate limiter destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn limiter() -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let limiter = RateLimiter::with_clock(EngineConfig::default(), clock.clone());
        (limiter, clock)
    }

    fn req(endpoint: &str) -> Request {
        Request::new("10.0.0.1", endpoint, "GET")
    }

    #[test]
    fn test_rate_limiter_creation() {
        let (limiter, _) = limiter();
        assert_eq!(limiter.counter_count(), 0);
        assert!(limiter.rules().is_empty());
    }

    #[test]
    fn test_no_rule_is_unbounded() {
        let (limiter, _) = limiter();
        let result = limiter.check_limit(&req("/open"));
        assert!(result.allowed);
        assert_eq!(result.remaining, None);
        assert_eq!(result.reason, None);
    }

    #[test]
    fn test_check_limit_creates_counter() {
        let (limiter, _) = limiter();
        limiter.add_rule(Rule::new("r", "/x", 5, 1_000, Algorithm::FixedWindow));

        let result = limiter.check_limit(&req("/x"));
        assert!(result.allowed);
        assert_eq!(result.remaining, Some(4));
        assert_eq!(limiter.counter_count(), 1);
    }

    #[test]
    fn test_burst_checked_before_primary() {
        let (limiter, clock) = limiter();
        limiter.add_rule(
            Rule::new("api", "/api/*", 100, 60_000, Algorithm::SlidingWindow)
                .with_burst_protection(2, 1_000),
        );

        assert!(limiter.check_limit(&req("/api/a")).allowed);
        assert!(limiter.check_limit(&req("/api/a")).allowed);

        let result = limiter.check_limit(&req("/api/a"));
        assert!(!result.allowed);
        assert_eq!(result.reason, Some(Reason::BurstLimitExceeded));
        assert_eq!(result.rule.as_deref(), Some("api"));
        assert_eq!(result.retry_after_ms, 1_000);

        // The burst denial did not consume the primary quota
        clock.advance(1_000);
        assert_eq!(limiter.check_limit(&req("/api/a")).remaining, Some(97));
    }

    #[test]
    fn test_remaining_is_minimum_across_rules() {
        let (limiter, _) = limiter();
        limiter.add_rule(Rule::new("wide", "/*", 100, 60_000, Algorithm::FixedWindow));
        limiter.add_rule(Rule::new("narrow", "/x", 3, 60_000, Algorithm::TokenBucket));

        assert_eq!(limiter.check_limit(&req("/x")).remaining, Some(2));
        // "wide" already counted the request to /x
        assert_eq!(limiter.check_limit(&req("/y")).remaining, Some(98));
    }

    #[test]
    fn test_lower_priority_rule_still_denies() {
        let (limiter, _) = limiter();
        limiter.add_rule(
            Rule::new("loose", "/x", 100, 60_000, Algorithm::SlidingWindow).with_priority(10),
        );
        limiter.add_rule(
            Rule::new("tight", "/x", 1, 60_000, Algorithm::SlidingWindow).with_priority(1),
        );

        assert!(limiter.check_limit(&req("/x")).allowed);
        let result = limiter.check_limit(&req("/x"));
        assert!(!result.allowed);
        assert_eq!(result.rule.as_deref(), Some("tight"));
    }

    #[test]
    fn test_replacing_rule_resets_quota() {
        let (limiter, _) = limiter();
        limiter.add_rule(Rule::new("r", "/x", 1, 60_000, Algorithm::SlidingWindow));
        assert!(limiter.check_limit(&req("/x")).allowed);
        assert!(!limiter.check_limit(&req("/x")).allowed);

        limiter.add_rule(Rule::new("r", "/x", 1, 60_000, Algorithm::SlidingWindow));
        assert!(limiter.check_limit(&req("/x")).allowed);
    }

    #[test]
    fn test_inert_rule_with_zero_window() {
        let (limiter, _) = limiter();
        limiter.add_rule(
            Rule::new("inert", "/x", 5, 0, Algorithm::TokenBucket).with_burst_protection(1, 1_000),
        );

        for _ in 0..10 {
            let result = limiter.check_limit(&req("/x"));
            assert!(result.allowed);
            assert_eq!(result.remaining, Some(5));
        }
        assert_eq!(limiter.counter_count(), 0);
    }

    #[test]
    fn test_blacklist_denies_without_retry() {
        let (limiter, _) = limiter();
        limiter.add_to_blacklist("10.0.0.1");

        let result = limiter.check_limit(&req("/anything"));
        assert!(!result.allowed);
        assert_eq!(result.reason, Some(Reason::IpBlacklisted));
        assert_eq!(result.retry_after_ms, 0);

        limiter.remove_from_blacklist("10.0.0.1");
        assert!(limiter.check_limit(&req("/anything")).allowed);
    }

    #[test]
    fn test_retry_after_secs_rounds_up() {
        let result = RateLimitResult::denied(Reason::RateLimitExceeded, 1_001, None);
        assert_eq!(result.retry_after_secs(), 2);
        assert_eq!(RateLimitResult::unbounded(None).retry_after_secs(), 0);
    }

    #[test]
    fn test_result_serialization() {
        let result = RateLimitResult::denied(Reason::BurstLimitExceeded, 10, Some("r"));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["reason"], "BURST_LIMIT_EXCEEDED");
        assert_eq!(json["rule"], "r");

        let json = serde_json::to_value(RateLimitResult::unbounded(None)).unwrap();
        assert!(json.get("reason").is_none());
        assert!(json["remaining"].is_null());
    }

    #[test]
    fn test_request_deserialize_camel_case_user() {
        let request: Request =
            serde_json::from_str(r#"{"ip":"1.2.3.4","endpoint":"/x","userId":"u1"}"#).unwrap();
        assert_eq!(request.identifier().to_string(), "1.2.3.4:u1");
        assert_eq!(request.method, "");
    }

    #[test]
    fn test_statistics_invalid_range_falls_back() {
        let (limiter, _) = limiter();
        limiter.check_limit(&req("/x"));

        let snapshot = limiter.statistics("forever");
        assert_eq!(snapshot.range_ms, DEFAULT_RANGE_MS);
        assert_eq!(snapshot.total_requests, 1);
    }

    #[tokio::test]
    async fn test_event_published_on_primary_deny_only() {
        let (limiter, _) = limiter();
        let mut rx = limiter.subscribe();
        limiter.add_rule(
            Rule::new("r", "/x", 1, 60_000, Algorithm::FixedWindow).with_burst_protection(5, 1_000),
        );

        limiter.check_limit(&req("/x"));
        limiter.check_limit(&req("/x"));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.rule, "r");
        assert_eq!(event.identifier, "10.0.0.1");
        assert_eq!(event.endpoint, "/x");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_flush_events_before_destroy() {
        let (limiter, _) = limiter();
        let seen = Arc::new(parking_lot::Mutex::new(0));
        let sink = seen.clone();
        limiter.on(move |_: &LimitExceeded| *sink.lock() += 1);
        limiter.add_rule(Rule::new("r", "/x", 1, 60_000, Algorithm::SlidingWindow));

        for _ in 0..4 {
            limiter.check_limit(&req("/x"));
        }
        assert!(limiter.flush_events(Duration::from_secs(1)).await);
        limiter.destroy();
        assert_eq!(*seen.lock(), 3);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (limiter, _) = limiter();
        limiter.on(|_: &LimitExceeded| {});

        limiter.destroy();
        limiter.destroy();
        assert!(limiter.is_destroyed());

        limiter.add_rule(Rule::new("r", "/x", 1, 60_000, Algorithm::FixedWindow));
        assert!(limiter.check_limit(&req("/x")).allowed);
    }
}
