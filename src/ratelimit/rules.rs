//! Rate limit rules, rule storage and endpoint matching.
//!
//! Rules are stored under their literal endpoint pattern. A pattern ending
//! in `/*` is a wildcard matching every endpoint under that prefix, and the
//! pattern `*` matches every endpoint. Numeric fields are never validated on
//! the way in: a malformed rule is stored as-is and simply never denies.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, TurnstileError};

/// Counting algorithm applied by a rule.
///
/// Unknown algorithm names are kept verbatim so a rule loaded from
/// configuration round-trips unchanged, but such a rule is inert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Algorithm {
    #[default]
    SlidingWindow,
    TokenBucket,
    FixedWindow,
    Unrecognized(String),
}

impl Algorithm {
    pub fn as_str(&self) -> &str {
        match self {
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::Unrecognized(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Algorithm::Unrecognized(_))
    }
}

impl From<&str> for Algorithm {
    fn from(name: &str) -> Self {
        match name {
            "sliding_window" => Algorithm::SlidingWindow,
            "token_bucket" => Algorithm::TokenBucket,
            "fixed_window" => Algorithm::FixedWindow,
            other => Algorithm::Unrecognized(other.to_string()),
        }
    }
}

impl From<String> for Algorithm {
    fn from(name: String) -> Self {
        Algorithm::from(name.as_str())
    }
}

impl From<Algorithm> for String {
    fn from(algorithm: Algorithm) -> Self {
        algorithm.as_str().to_string()
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tighter sub-limit checked before the rule's primary limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurstProtection {
    pub limit: i64,
    #[serde(alias = "windowMs")]
    pub window_ms: i64,
}

impl BurstProtection {
    pub fn new(limit: i64, window_ms: i64) -> Self {
        Self { limit, window_ms }
    }

    pub fn is_inert(&self) -> bool {
        self.limit < 0 || self.window_ms <= 0
    }
}

/// A rate limit rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule name
    pub name: String,
    /// Exact endpoint, `/prefix/*` wildcard, or `*`
    #[serde(alias = "endpointPattern")]
    pub endpoint_pattern: String,
    /// Requests allowed per window
    pub limit: i64,
    /// Window length in milliseconds
    #[serde(alias = "windowMs")]
    pub window_ms: i64,
    /// Counting algorithm
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Higher priorities are evaluated first
    #[serde(default)]
    pub priority: i32,
    /// Optional burst sub-limit
    #[serde(default, alias = "burstProtection")]
    pub burst_protection: Option<BurstProtection>,
}

impl Rule {
    /// Create a rule with priority 0 and no burst protection.
    pub fn new(
        name: impl Into<String>,
        endpoint_pattern: impl Into<String>,
        limit: i64,
        window_ms: i64,
        algorithm: Algorithm,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint_pattern: endpoint_pattern.into(),
            limit,
            window_ms,
            algorithm,
            priority: 0,
            burst_protection: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_burst_protection(mut self, limit: i64, window_ms: i64) -> Self {
        self.burst_protection = Some(BurstProtection::new(limit, window_ms));
        self
    }

    /// An inert rule always allows.
    pub fn is_inert(&self) -> bool {
        self.limit < 0 || self.window_ms <= 0 || !self.algorithm.is_known()
    }
}

/// A parsed endpoint pattern.
enum Pattern<'a> {
    Exact(&'a str),
    Prefix(&'a str),
}

impl<'a> Pattern<'a> {
    fn parse(pattern: &'a str) -> Self {
        if pattern == "*" {
            Pattern::Prefix("")
        } else if let Some(stripped) = pattern.strip_suffix('*') {
            if stripped.ends_with('/') {
                Pattern::Prefix(stripped)
            } else {
                Pattern::Exact(pattern)
            }
        } else {
            Pattern::Exact(pattern)
        }
    }
}

/// A set of rules as written in a rules file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RuleSet {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // First, try a bare list of rules
        if let Ok(rules) = serde_yaml::from_str::<Vec<Rule>>(yaml) {
            return Ok(RuleSet { rules });
        }

        // Otherwise, expect a `rules:` mapping
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse rules: {}", e)))
    }
}

#[derive(Debug, Clone)]
struct StoredRule {
    seq: u64,
    rule: Arc<Rule>,
}

#[derive(Debug, Default)]
struct RuleIndex {
    /// Exact patterns -> rules
    exact: HashMap<String, Vec<StoredRule>>,
    /// Wildcard prefixes -> rules
    prefixes: HashMap<String, Vec<StoredRule>>,
    /// Rule name -> literal pattern
    names: HashMap<String, String>,
    next_seq: u64,
}

impl RuleIndex {
    fn bucket_mut(&mut self, pattern: &str) -> &mut Vec<StoredRule> {
        match Pattern::parse(pattern) {
            Pattern::Exact(p) => self.exact.entry(p.to_string()).or_default(),
            Pattern::Prefix(p) => self.prefixes.entry(p.to_string()).or_default(),
        }
    }

    fn remove(&mut self, name: &str) -> Option<Arc<Rule>> {
        let pattern = self.names.remove(name)?;
        let (map, key) = match Pattern::parse(&pattern) {
            Pattern::Exact(p) => (&mut self.exact, p),
            Pattern::Prefix(p) => (&mut self.prefixes, p),
        };

        let bucket = map.get_mut(key)?;
        let position = bucket.iter().position(|s| s.rule.name == name)?;
        let removed = bucket.remove(position);
        if bucket.is_empty() {
            map.remove(key);
        }
        Some(removed.rule)
    }
}

/// Thread-safe rule storage indexed by endpoint pattern.
#[derive(Debug, Default)]
pub struct RuleStore {
    index: RwLock<RuleIndex>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a rule, replacing any rule with the same name.
    ///
    /// Returns the replaced rule, if any.
    pub fn add(&self, rule: Rule) -> Option<Arc<Rule>> {
        if rule.is_inert() {
            warn!(
                rule = %rule.name,
                limit = rule.limit,
                window_ms = rule.window_ms,
                algorithm = %rule.algorithm,
                "Rule is malformed and will always allow"
            );
        }

        let mut index = self.index.write();
        let replaced = index.remove(&rule.name);

        let seq = index.next_seq;
        index.next_seq += 1;
        index
            .names
            .insert(rule.name.clone(), rule.endpoint_pattern.clone());

        debug!(
            rule = %rule.name,
            pattern = %rule.endpoint_pattern,
            priority = rule.priority,
            replaced = replaced.is_some(),
            "Rule stored"
        );

        let pattern = rule.endpoint_pattern.clone();
        index.bucket_mut(&pattern).push(StoredRule {
            seq,
            rule: Arc::new(rule),
        });

        replaced
    }

    /// Remove a rule by name.
    pub fn remove(&self, name: &str) -> Option<Arc<Rule>> {
        let removed = self.index.write().remove(name);
        if removed.is_some() {
            debug!(rule = %name, "Rule removed");
        }
        removed
    }

    /// Get a rule by name.
    pub fn get(&self, name: &str) -> Option<Arc<Rule>> {
        let index = self.index.read();
        let pattern = index.names.get(name)?;
        let bucket = match Pattern::parse(pattern) {
            Pattern::Exact(p) => index.exact.get(p),
            Pattern::Prefix(p) => index.prefixes.get(p),
        }?;
        bucket
            .iter()
            .find(|s| s.rule.name == name)
            .map(|s| s.rule.clone())
    }

    /// All stored rules in insertion order.
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        let index = self.index.read();
        let mut stored: Vec<&StoredRule> = index
            .exact
            .values()
            .chain(index.prefixes.values())
            .flatten()
            .collect();
        stored.sort_by_key(|s| s.seq);
        stored.into_iter().map(|s| s.rule.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.index.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve the rules applicable to `endpoint`.
    ///
    /// Exact matches and wildcard matches are collected, then ordered by
    /// descending priority with ties broken by insertion order. An empty
    /// endpoint matches nothing.
    pub fn match_endpoint(&self, endpoint: &str) -> Vec<Arc<Rule>> {
        if endpoint.is_empty() {
            return Vec::new();
        }

        let index = self.index.read();
        let mut matched: Vec<&StoredRule> = Vec::new();

        if let Some(bucket) = index.exact.get(endpoint) {
            matched.extend(bucket.iter());
        }
        for (prefix, bucket) in &index.prefixes {
            if endpoint.starts_with(prefix.as_str()) {
                matched.extend(bucket.iter());
            }
        }

        matched.sort_by(|a, b| {
            b.rule
                .priority
                .cmp(&a.rule.priority)
                .then(a.seq.cmp(&b.seq))
        });
        matched.into_iter().map(|s| s.rule.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, pattern: &str) -> Rule {
        Rule::new(name, pattern, 10, 60_000, Algorithm::SlidingWindow)
    }

    fn names(rules: &[Arc<Rule>]) -> Vec<&str> {
        rules.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn test_parse_rule_list() {
        let yaml = r#"
- name: login
  endpoint_pattern: /api/auth/*
  limit: 5
  window_ms: 60000
  algorithm: token_bucket
  priority: 10
  burst_protection:
    limit: 2
    window_ms: 1000
- name: default
  endpoint_pattern: "*"
  limit: 1000
  window_ms: 60000
"#;
        let set = RuleSet::from_yaml(yaml).unwrap();
        assert_eq!(set.rules.len(), 2);
        assert_eq!(set.rules[0].algorithm, Algorithm::TokenBucket);
        assert_eq!(set.rules[0].burst_protection, Some(BurstProtection::new(2, 1000)));
        assert_eq!(set.rules[1].algorithm, Algorithm::SlidingWindow);
        assert_eq!(set.rules[1].priority, 0);
    }

    #[test]
    fn test_parse_rules_mapping_camel_case() {
        let yaml = r#"
rules:
  - name: bogus
    endpointPattern: /bogus
    limit: -1
    windowMs: 0
    algorithm: bogus
"#;
        let set = RuleSet::from_yaml(yaml).unwrap();
        let rule = &set.rules[0];
        assert_eq!(rule.algorithm, Algorithm::Unrecognized("bogus".to_string()));
        assert!(rule.is_inert());
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = RuleSet::from_yaml("rules: [ {name: 1");
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_algorithm_round_trip_name() {
        assert_eq!(String::from(Algorithm::from("fixed_window")), "fixed_window");
        assert_eq!(Algorithm::from("weird").as_str(), "weird");
        assert!(!Algorithm::from("weird").is_known());
    }

    #[test]
    fn test_inert_detection() {
        assert!(!rule("a", "/a").is_inert());
        assert!(Rule::new("a", "/a", -1, 1000, Algorithm::FixedWindow).is_inert());
        assert!(Rule::new("a", "/a", 1, 0, Algorithm::FixedWindow).is_inert());
        // A zero limit is valid: it denies everything
        assert!(!Rule::new("a", "/a", 0, 1000, Algorithm::FixedWindow).is_inert());
    }

    #[test]
    fn test_exact_match() {
        let store = RuleStore::new();
        store.add(rule("test", "/test"));

        assert_eq!(names(&store.match_endpoint("/test")), vec!["test"]);
        assert!(store.match_endpoint("/test/other").is_empty());
        assert!(store.match_endpoint("/tes").is_empty());
    }

    #[test]
    fn test_wildcard_match() {
        let store = RuleStore::new();
        store.add(rule("auth", "/api/auth/*"));

        assert_eq!(names(&store.match_endpoint("/api/auth/login")), vec!["auth"]);
        assert_eq!(names(&store.match_endpoint("/api/auth/signup")), vec!["auth"]);
        assert!(store.match_endpoint("/api/users").is_empty());
        assert!(store.match_endpoint("/api/auth").is_empty());
    }

    #[test]
    fn test_catch_all_match() {
        let store = RuleStore::new();
        store.add(rule("all", "*"));

        assert_eq!(names(&store.match_endpoint("/anything")), vec!["all"]);
        assert!(store.match_endpoint("").is_empty());
    }

    #[test]
    fn test_priority_ordering_with_insertion_ties() {
        let store = RuleStore::new();
        store.add(rule("low", "/x").with_priority(1));
        store.add(rule("wild", "/*").with_priority(5));
        store.add(rule("high", "/x").with_priority(10));
        store.add(rule("low2", "/x").with_priority(1));

        assert_eq!(
            names(&store.match_endpoint("/x")),
            vec!["high", "wild", "low", "low2"]
        );
    }

    #[test]
    fn test_add_replaces_same_name() {
        let store = RuleStore::new();
        store.add(rule("r", "/a"));
        let replaced = store.add(rule("r", "/b"));

        assert_eq!(replaced.unwrap().endpoint_pattern, "/a");
        assert_eq!(store.len(), 1);
        assert!(store.match_endpoint("/a").is_empty());
        assert_eq!(names(&store.match_endpoint("/b")), vec!["r"]);
    }

    #[test]
    fn test_remove_rule() {
        let store = RuleStore::new();
        store.add(rule("r", "/a/*"));
        assert!(store.get("r").is_some());

        assert!(store.remove("r").is_some());
        assert!(store.remove("r").is_none());
        assert!(store.get("r").is_none());
        assert!(store.match_endpoint("/a/b").is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_malformed_rule_is_stored() {
        let store = RuleStore::new();
        store.add(Rule::new("bad", "/bad", -1, 0, Algorithm::from("bogus")));

        let stored = store.get("bad").unwrap();
        assert_eq!(stored.limit, -1);
        assert_eq!(stored.window_ms, 0);
        assert_eq!(names(&store.match_endpoint("/bad")), vec!["bad"]);
    }

    #[test]
    fn test_rules_insertion_order() {
        let store = RuleStore::new();
        store.add(rule("b", "/b"));
        store.add(rule("a", "/a/*"));
        store.add(rule("c", "/c"));

        assert_eq!(names(&store.rules()), vec!["b", "a", "c"]);
    }
}
