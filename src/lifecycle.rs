//! Connection lifecycle handling
//!
//! When the transport (re)opens, every registered live query discards its
//! operation chain and refetches unconditionally. Operations queued against
//! the dead connection may never settle, so they are dropped rather than
//! awaited. When the transport closes nothing changes: live queries stay
//! registered and simply receive no notifications until the next open.

use crate::metrics::SyncMetrics;
use crate::registry::SubscriptionRegistry;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Resynchronizes live queries on transport open
pub struct ConnectionLifecycleHandler {
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<SyncMetrics>,
}

impl ConnectionLifecycleHandler {
    /// Create a handler resynchronizing the queries of `registry`
    pub fn new(registry: Arc<SubscriptionRegistry>, metrics: Arc<SyncMetrics>) -> Self {
        Self { registry, metrics }
    }

    /// Reset and force-refetch every registered live query.
    /// Returns the number of live queries resynchronized.
    pub fn on_open(&self) -> usize {
        let mut resynced = HashSet::new();
        for server_id in self.registry.server_ids() {
            for instance in self.registry.instances_for(&server_id) {
                if !resynced.insert(instance.local_id()) {
                    continue;
                }
                instance.reset();
                // Submitted eagerly; the outcome reaches the result handler
                let _ = instance.refetch(true);
            }
        }

        SyncMetrics::incr(&self.metrics.resyncs);
        if resynced.is_empty() {
            debug!("Connection opened, no live queries to resynchronize");
        } else {
            info!(
                "Connection opened, resynchronizing {} live queries",
                resynced.len()
            );
        }
        resynced.len()
    }

    /// Log the close; registrations are kept
    pub fn on_close(&self) {
        debug!(
            "Connection closed, keeping {} live queries registered",
            self.registry.len()
        );
    }
}
