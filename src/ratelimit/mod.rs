//! Rate limiting logic and state management.

mod access;
mod backend;
mod cleaner;
mod clock;
mod counter;
mod events;
mod identifier;
mod limiter;
mod rules;
mod stats;

pub use access::{AccessList, Classification};
pub use backend::{Consumption, CounterBackend};
pub use cleaner::{Cleaner, SweepReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{FixedWindowCounter, SlidingWindowCounter, TokenBucketCounter};
pub use events::{EventNotifier, LimitExceeded, LimitListener};
pub use identifier::{CounterKey, Identifier};
pub use limiter::{RateLimitResult, RateLimiter, Reason, Request};
pub use rules::{Algorithm, BurstProtection, Rule, RuleSet, RuleStore};
pub use stats::{
    parse_range, RankedCount, RequestRecord, RuleStatistics, StatisticsCollector,
    StatisticsSnapshot, DEFAULT_RANGE_MS,
};
