//! Rate limit counter implementations.
//!
//! Every algorithm keeps a map from [`CounterKey`] to per-key state guarded
//! by its own mutex. The map's shard lock is held only long enough to fetch
//! or create an entry, so unrelated callers never serialize on each other,
//! while two requests for the same key cannot both see the last free slot.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

use super::backend::{is_inert, Consumption, CounterBackend};
use super::identifier::CounterKey;

/// Per-key state shared by every algorithm.
struct StateMap<S> {
    entries: DashMap<CounterKey, Arc<Mutex<S>>>,
}

impl<S> StateMap<S> {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Run `f` with exclusive access to the state for `key`.
    fn with_state<R>(
        &self,
        key: &CounterKey,
        init: impl FnOnce() -> S,
        f: impl FnOnce(&mut S) -> R,
    ) -> R {
        let state = match self.entries.get(key) {
            Some(existing) => existing.value().clone(),
            None => self
                .entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(init())))
                .value()
                .clone(),
        };

        let mut guard = state.lock();
        f(&mut guard)
    }

    /// Remove expired entries, leaving any entry that is being consumed.
    ///
    /// An entry is in use when a caller holds a clone of its `Arc` or its
    /// mutex is locked. Callers only clone the `Arc` while holding the shard
    /// lock, which `retain` also holds, so the check cannot race.
    fn sweep(&self, expired: impl Fn(&S) -> bool) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, state| {
            if Arc::strong_count(state) > 1 {
                return true;
            }
            match state.try_lock() {
                Some(guard) if expired(&guard) => {
                    removed += 1;
                    false
                }
                _ => true,
            }
        });
        removed
    }

    fn remove_rule(&self, rule: &str) {
        self.entries.retain(|key, _| key.rule != rule);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Sliding window log: timestamps of admitted requests in the last window.
struct SlidingLog {
    timestamps: VecDeque<u64>,
    window_ms: u64,
}

impl SlidingLog {
    fn prune(&mut self, now_ms: u64) {
        while let Some(&oldest) = self.timestamps.front() {
            if oldest + self.window_ms <= now_ms {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        match self.timestamps.back() {
            Some(&newest) => newest + self.window_ms <= now_ms,
            None => true,
        }
    }
}

/// Sliding window counter.
///
/// Admits a request when fewer than `limit` requests were admitted during
/// the trailing `window_ms`.
pub struct SlidingWindowCounter {
    states: StateMap<SlidingLog>,
}

impl SlidingWindowCounter {
    pub fn new() -> Self {
        Self {
            states: StateMap::new(),
        }
    }
}

impl Default for SlidingWindowCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterBackend for SlidingWindowCounter {
    fn name(&self) -> &'static str {
        "sliding_window"
    }

    fn consume(&self, key: &CounterKey, limit: i64, window_ms: i64, now_ms: u64) -> Consumption {
        if is_inert(limit, window_ms) {
            return Consumption::allow(limit);
        }
        let window_ms = window_ms as u64;

        let outcome = self.states.with_state(
            key,
            || SlidingLog {
                timestamps: VecDeque::new(),
                window_ms,
            },
            |log| {
                log.window_ms = window_ms;
                log.prune(now_ms);

                let count = log.timestamps.len() as i64;
                if count < limit {
                    log.timestamps.push_back(now_ms);
                    Consumption::allow(limit - count - 1)
                } else {
                    let retry_after_ms = match log.timestamps.front() {
                        Some(&oldest) => (oldest + window_ms).saturating_sub(now_ms).max(1),
                        None => window_ms,
                    };
                    Consumption::deny(retry_after_ms)
                }
            },
        );

        trace!(
            key = %key,
            allowed = outcome.allowed,
            remaining = outcome.remaining,
            "Sliding window consume"
        );
        outcome
    }

    fn sweep(&self, now_ms: u64) -> usize {
        self.states.sweep(|log| log.is_expired(now_ms))
    }

    fn remove_rule(&self, rule: &str) {
        self.states.remove_rule(rule);
    }

    fn len(&self) -> usize {
        self.states.len()
    }
}

/// Token bucket state.
struct Bucket {
    tokens: f64,
    last_refill_ms: u64,
    window_ms: u64,
}

impl Bucket {
    /// A bucket untouched for a whole window has refilled completely.
    fn is_expired(&self, now_ms: u64) -> bool {
        self.last_refill_ms + self.window_ms <= now_ms
    }
}

/// Token bucket counter.
///
/// Capacity is `limit` tokens, refilled continuously at
/// `limit / window_ms` tokens per millisecond. Buckets start full.
pub struct TokenBucketCounter {
    states: StateMap<Bucket>,
}

impl TokenBucketCounter {
    pub fn new() -> Self {
        Self {
            states: StateMap::new(),
        }
    }
}

impl Default for TokenBucketCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterBackend for TokenBucketCounter {
    fn name(&self) -> &'static str {
        "token_bucket"
    }

    fn consume(&self, key: &CounterKey, limit: i64, window_ms: i64, now_ms: u64) -> Consumption {
        if is_inert(limit, window_ms) {
            return Consumption::allow(limit);
        }
        let capacity = limit as f64;
        let window = window_ms as f64;

        let outcome = self.states.with_state(
            key,
            || Bucket {
                tokens: capacity,
                last_refill_ms: now_ms,
                window_ms: window_ms as u64,
            },
            |bucket| {
                bucket.window_ms = window_ms as u64;
                let elapsed = now_ms.saturating_sub(bucket.last_refill_ms) as f64;
                bucket.tokens = (bucket.tokens + elapsed * capacity / window).min(capacity);
                bucket.last_refill_ms = bucket.last_refill_ms.max(now_ms);

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    Consumption::allow(bucket.tokens.floor() as i64)
                } else if limit == 0 {
                    Consumption::deny(window_ms as u64)
                } else {
                    let wait = ((1.0 - bucket.tokens) * window / capacity).ceil();
                    Consumption::deny((wait as u64).max(1))
                }
            },
        );

        trace!(
            key = %key,
            allowed = outcome.allowed,
            remaining = outcome.remaining,
            "Token bucket consume"
        );
        outcome
    }

    fn sweep(&self, now_ms: u64) -> usize {
        self.states.sweep(|bucket| bucket.is_expired(now_ms))
    }

    fn remove_rule(&self, rule: &str) {
        self.states.remove_rule(rule);
    }

    fn len(&self) -> usize {
        self.states.len()
    }
}

/// Fixed window state.
struct FixedSlot {
    window_start_ms: u64,
    count: i64,
    window_ms: u64,
}

impl FixedSlot {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.window_start_ms + self.window_ms <= now_ms
    }
}

fn align(now_ms: u64, window_ms: u64) -> u64 {
    now_ms - now_ms % window_ms
}

/// Fixed window counter.
///
/// Windows are aligned to multiples of `window_ms`; the count resets when
/// a request arrives in a later window.
pub struct FixedWindowCounter {
    states: StateMap<FixedSlot>,
}

impl FixedWindowCounter {
    pub fn new() -> Self {
        Self {
            states: StateMap::new(),
        }
    }
}

impl Default for FixedWindowCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterBackend for FixedWindowCounter {
    fn name(&self) -> &'static str {
        "fixed_window"
    }

    fn consume(&self, key: &CounterKey, limit: i64, window_ms: i64, now_ms: u64) -> Consumption {
        if is_inert(limit, window_ms) {
            return Consumption::allow(limit);
        }
        let window_ms = window_ms as u64;

        let outcome = self.states.with_state(
            key,
            || FixedSlot {
                window_start_ms: align(now_ms, window_ms),
                count: 0,
                window_ms,
            },
            |slot| {
                slot.window_ms = window_ms;
                if slot.is_expired(now_ms) {
                    slot.window_start_ms = align(now_ms, window_ms);
                    slot.count = 0;
                }

                if slot.count < limit {
                    slot.count += 1;
                    Consumption::allow(limit - slot.count)
                } else {
                    let retry_after_ms = (slot.window_start_ms + window_ms).saturating_sub(now_ms);
                    Consumption::deny(retry_after_ms.max(1))
                }
            },
        );

        trace!(
            key = %key,
            allowed = outcome.allowed,
            remaining = outcome.remaining,
            "Fixed window consume"
        );
        outcome
    }

    fn sweep(&self, now_ms: u64) -> usize {
        self.states.sweep(|slot| slot.is_expired(now_ms))
    }

    fn remove_rule(&self, rule: &str) {
        self.states.remove_rule(rule);
    }

    fn len(&self) -> usize {
        self.states.len()
    }
}
