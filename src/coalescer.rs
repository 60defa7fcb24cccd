//! Invalidation coalescing
//!
//! Servers tend to emit several invalidation messages in quick succession
//! for a burst of writes. The [`NotificationCoalescer`] merges every message
//! received within one throttle window into a single deduplicated
//! [`NotificationBatch`] and hands it to a [`NotificationSink`] once the
//! window closes. At most one timer is pending at any time: the first message
//! after a dispatch opens the next window.

use crate::metrics::SyncMetrics;
use crate::registry::SubscriptionRegistry;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Deduplicated set of server subscription ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationBatch {
    ids: HashSet<String>,
}

impl NotificationBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Add ids, ignoring duplicates
    pub fn merge<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids.extend(ids.into_iter().map(Into::into));
    }

    /// Whether the batch names `server_id`
    pub fn contains(&self, server_id: &str) -> bool {
        self.ids.contains(server_id)
    }

    /// Number of distinct ids
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the batch holds no ids
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Iterate over the ids in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for NotificationBatch {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut batch = Self::new();
        batch.merge(iter);
        batch
    }
}

/// Receives one coalesced batch per throttle window
pub trait NotificationSink: Send + Sync {
    fn dispatch(&self, batch: NotificationBatch);
}

/// Dispatches batches to the live queries registered under each id
pub struct RegistryDispatch {
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<SyncMetrics>,
}

impl RegistryDispatch {
    /// Dispatch to the live queries of `registry`
    pub fn new(registry: Arc<SubscriptionRegistry>, metrics: Arc<SyncMetrics>) -> Self {
        Self { registry, metrics }
    }
}

impl NotificationSink for RegistryDispatch {
    fn dispatch(&self, batch: NotificationBatch) {
        SyncMetrics::incr(&self.metrics.batches_dispatched);
        let mut requested = 0;
        for server_id in batch.iter() {
            for instance in self.registry.instances_for(server_id) {
                // Submitted eagerly; the outcome is not needed here
                let _ = instance.refetch(false);
                requested += 1;
            }
        }
        debug!(
            "Dispatched invalidation batch of {} ids to {} live queries",
            batch.len(),
            requested
        );
    }
}

struct Pending {
    batch: NotificationBatch,
    timer: Option<JoinHandle<()>>,
}

/// Merges invalidation messages per throttle window
pub struct NotificationCoalescer {
    this: Weak<NotificationCoalescer>,
    throttle: Duration,
    sink: Arc<dyn NotificationSink>,
    pending: Mutex<Pending>,
}

impl NotificationCoalescer {
    /// Create a coalescer delivering to `sink` once per `throttle` window
    pub fn new(throttle: Duration, sink: Arc<dyn NotificationSink>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            throttle,
            sink,
            pending: Mutex::new(Pending {
                batch: NotificationBatch::new(),
                timer: None,
            }),
        })
    }

    /// Length of one coalescing window
    pub fn throttle(&self) -> Duration {
        self.throttle
    }

    /// Merge the ids of one inbound message into the pending batch, opening
    /// a throttle window if none is running. Must be called inside a Tokio
    /// runtime.
    pub fn push<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pending = self.pending.lock();
        pending.batch.merge(ids);
        if pending.timer.is_some() || pending.batch.is_empty() {
            return;
        }

        let coalescer = self.this.clone();
        let deadline = Instant::now() + self.throttle;
        pending.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(coalescer) = coalescer.upgrade() {
                coalescer.fire();
            }
        }));
    }

    /// Dispatch the pending batch now, cancelling the running window
    pub fn flush(&self) {
        let batch = {
            let mut pending = self.pending.lock();
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut pending.batch)
        };
        self.deliver(batch);
    }

    /// Snapshot of the ids waiting for the current window to close
    pub fn pending(&self) -> NotificationBatch {
        self.pending.lock().batch.clone()
    }

    fn fire(&self) {
        let batch = {
            let mut pending = self.pending.lock();
            pending.timer = None;
            std::mem::take(&mut pending.batch)
        };
        self.deliver(batch);
    }

    fn deliver(&self, batch: NotificationBatch) {
        if !batch.is_empty() {
            self.sink.dispatch(batch);
        }
    }
}

impl Drop for NotificationCoalescer {
    fn drop(&mut self) {
        if let Some(timer) = self.pending.get_mut().timer.take() {
            timer.abort();
        }
    }
}
