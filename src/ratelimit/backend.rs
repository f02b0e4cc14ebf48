//! Counter trait for abstracting the storage behind each algorithm.

use super::identifier::CounterKey;

/// Outcome of consuming one request against a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumption {
    /// Whether the request fits in the quota
    pub allowed: bool,
    /// Requests still available after this one
    pub remaining: i64,
    /// Milliseconds until a retry could succeed (0 when allowed)
    pub retry_after_ms: u64,
}

impl Consumption {
    pub fn allow(remaining: i64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after_ms: 0,
        }
    }

    pub fn deny(retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after_ms,
        }
    }
}

/// Trait for counter implementations.
///
/// Each algorithm maps a [`CounterKey`] to its own counting state. The trait
/// is object safe so the evaluator can hold any implementation, including
/// one backed by a shared store.
pub trait CounterBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Count one request against `key`.
    ///
    /// A `limit < 0` or `window_ms <= 0` always allows with
    /// `remaining = limit` and creates no state.
    fn consume(&self, key: &CounterKey, limit: i64, window_ms: i64, now_ms: u64) -> Consumption;

    /// Evict entries whose window has fully elapsed and that are not in use.
    ///
    /// Returns the number of entries removed.
    fn sweep(&self, now_ms: u64) -> usize;

    /// Drop every entry belonging to `rule`.
    fn remove_rule(&self, rule: &str);

    /// Number of live entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether limit/window describe a rule that never denies.
pub(crate) fn is_inert(limit: i64, window_ms: i64) -> bool {
    limit < 0 || window_ms <= 0
}
