//! Background eviction of idle counters and stale statistics.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::backend::CounterBackend;
use super::clock::Clock;
use super::stats::StatisticsCollector;

/// What a single sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub counters_removed: usize,
    pub stats_removed: usize,
}

/// The state a sweep walks over.
#[derive(Clone)]
struct Targets {
    counters: Vec<Arc<dyn CounterBackend>>,
    stats: Arc<StatisticsCollector>,
    clock: Arc<dyn Clock>,
}

impl Targets {
    fn sweep(&self, now_ms: u64) -> SweepReport {
        // Each backend walks its map shard by shard, so no lock spans the
        // whole map.
        let counters_removed = self.counters.iter().map(|c| c.sweep(now_ms)).sum();
        let stats_removed = self.stats.prune(now_ms);
        SweepReport {
            counters_removed,
            stats_removed,
        }
    }
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Periodic sweeper bounding memory under many distinct callers.
pub struct Cleaner {
    targets: Targets,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl Cleaner {
    pub fn new(
        counters: Vec<Arc<dyn CounterBackend>>,
        stats: Arc<StatisticsCollector>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            targets: Targets {
                counters,
                stats,
                clock,
            },
            interval,
            running: Mutex::new(None),
        }
    }

    /// Sweep once using the current clock reading.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_once(self.targets.clock.now_ms())
    }

    /// Sweep once as of `now_ms`.
    pub fn sweep_once(&self, now_ms: u64) -> SweepReport {
        self.targets.sweep(now_ms)
    }

    /// Start the background ticker.
    ///
    /// Returns `false` when already running or when called outside a tokio
    /// runtime.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No tokio runtime available, background cleanup disabled");
                return false;
            }
        };

        let (stop, mut stopped) = watch::channel(false);
        let targets = self.targets.clone();
        let period = self.interval;

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = targets.sweep(targets.clock.now_ms());
                        if report != SweepReport::default() {
                            debug!(
                                counters_removed = report.counters_removed,
                                stats_removed = report.stats_removed,
                                "Cleanup sweep completed"
                            );
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Cleaner task exiting");
        });

        info!(interval_ms = period.as_millis() as u64, "Cleaner started");
        *running = Some(Running { stop, handle });
        true
    }

    /// Stop the background ticker. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            let _ = running.stop.send(true);
            drop(running.handle);
            info!("Cleaner stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::counter::{FixedWindowCounter, SlidingWindowCounter};
    use crate::ratelimit::identifier::{CounterKey, Identifier};
    use crate::ratelimit::stats::RequestRecord;

    type Fixture = (Cleaner, Arc<SlidingWindowCounter>, Arc<StatisticsCollector>);

    fn setup(clock: Arc<ManualClock>) -> Fixture {
        let sliding = Arc::new(SlidingWindowCounter::new());
        let fixed = Arc::new(FixedWindowCounter::new());
        let stats = Arc::new(StatisticsCollector::new(1_000, 10_000, 10, 100));
        let counters: Vec<Arc<dyn CounterBackend>> =
            vec![sliding.clone() as Arc<dyn CounterBackend>, fixed];
        let cleaner = Cleaner::new(
            counters,
            stats.clone(),
            clock,
            Duration::from_millis(10),
        );
        (cleaner, sliding, stats)
    }

    fn record(at_ms: u64) -> RequestRecord<'static> {
        RequestRecord {
            at_ms,
            ip: "1.1.1.1",
            identifier: "1.1.1.1",
            endpoint: "/x",
            evaluated: &[],
            blocked_by: None,
            allowed: true,
        }
    }

    #[test]
    fn test_sweep_reports_removals() {
        let clock = Arc::new(ManualClock::new(0));
        let (cleaner, sliding, stats) = setup(clock.clone());

        let key = CounterKey::primary("r", &Identifier::new("1.1.1.1", None));
        sliding.consume(&key, 5, 1_000, 0);
        stats.record(record(0));

        assert_eq!(cleaner.sweep(), SweepReport::default());

        clock.set(20_000);
        assert_eq!(
            cleaner.sweep(),
            SweepReport {
                counters_removed: 1,
                stats_removed: 1
            }
        );
        assert!(sliding.is_empty());
        assert!(stats.is_empty());
    }

    #[test]
    fn test_start_without_runtime() {
        let clock = Arc::new(ManualClock::new(0));
        let (cleaner, _, _) = setup(clock);
        assert!(!cleaner.start());
        assert!(!cleaner.is_running());
    }

    #[tokio::test]
    async fn test_background_sweep_and_stop() {
        let clock = Arc::new(ManualClock::new(0));
        let (cleaner, sliding, _) = setup(clock.clone());

        let key = CounterKey::primary("r", &Identifier::new("1.1.1.1", None));
        sliding.consume(&key, 5, 1_000, 0);
        clock.set(5_000);

        assert!(cleaner.start());
        assert!(!cleaner.start());
        assert!(cleaner.is_running());

        tokio::time::timeout(Duration::from_secs(2), async {
            while !sliding.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cleaner.stop();
        cleaner.stop();
        assert!(!cleaner.is_running());
    }
}
