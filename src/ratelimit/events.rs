//! Limit-exceeded notifications.
//!
//! Publishing goes through a broadcast channel and never blocks the
//! admission path. Listeners registered with [`EventNotifier::on`] run on
//! their own tasks; slow listeners skip events they lagged behind on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};
use uuid::Uuid;

/// Published when a rule's primary limit denies a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitExceeded {
    pub id: Uuid,
    pub rule: String,
    pub identifier: String,
    pub endpoint: String,
    pub retry_after_ms: u64,
    pub at: DateTime<Utc>,
}

/// A consumer of limit-exceeded notifications.
#[async_trait]
pub trait LimitListener: Send + Sync + 'static {
    async fn on_limit_exceeded(&self, event: &LimitExceeded);
}

#[async_trait]
impl<F> LimitListener for F
where
    F: Fn(&LimitExceeded) + Send + Sync + 'static,
{
    async fn on_limit_exceeded(&self, event: &LimitExceeded) {
        (self)(event)
    }
}

/// A spawned listener and how many events it has consumed.
struct ListenerTask {
    handle: JoinHandle<()>,
    handled: Arc<AtomicU64>,
}

/// Fans limit-exceeded notifications out to subscribers.
pub struct EventNotifier {
    sender: broadcast::Sender<LimitExceeded>,
    published: AtomicU64,
    listeners: Mutex<Vec<ListenerTask>>,
}

impl EventNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Publish an event. Dropped silently when nobody is listening.
    pub fn publish(&self, event: LimitExceeded) {
        self.published.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(event);
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LimitExceeded> {
        self.sender.subscribe()
    }

    /// Register a listener on its own task.
    ///
    /// Must be called from within a tokio runtime; otherwise the listener is
    /// not registered and `false` is returned.
    pub fn on<L: LimitListener>(&self, listener: L) -> bool {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No tokio runtime available, listener not registered");
                return false;
            }
        };

        let mut stream = BroadcastStream::new(self.sender.subscribe());
        let handled = Arc::new(AtomicU64::new(self.published.load(Ordering::SeqCst)));
        let progress = handled.clone();
        let handle = runtime.spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => {
                        listener.on_limit_exceeded(&event).await;
                        progress.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Limit listener lagged, events skipped");
                        progress.fetch_add(skipped, Ordering::SeqCst);
                    }
                }
            }
        });

        let mut listeners = self.listeners.lock();
        listeners.retain(|l| !l.handle.is_finished());
        listeners.push(ListenerTask { handle, handled });
        true
    }

    /// Number of registered listener tasks still running.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .iter()
            .filter(|l| !l.handle.is_finished())
            .count()
    }

    /// Wait until every listener has handled the events published so far.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let target = self.published.load(Ordering::SeqCst);
        let pending: Vec<Arc<AtomicU64>> = self
            .listeners
            .lock()
            .iter()
            .filter(|l| !l.handle.is_finished())
            .map(|l| l.handled.clone())
            .collect();

        let caught_up = async {
            while pending.iter().any(|h| h.load(Ordering::SeqCst) < target) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        let flushed = tokio::time::timeout(timeout, caught_up).await.is_ok();
        if !flushed {
            warn!(timeout_ms = timeout.as_millis() as u64, "Limit listeners did not catch up");
        }
        flushed
    }

    /// Stop every listener task.
    pub fn shutdown(&self) {
        let listeners: Vec<ListenerTask> = std::mem::take(&mut *self.listeners.lock());
        if !listeners.is_empty() {
            debug!(count = listeners.len(), "Stopping limit listeners");
        }
        for listener in listeners {
            listener.handle.abort();
        }
    }
}

impl Drop for EventNotifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}
