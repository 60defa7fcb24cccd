//! Subscription registry
//!
//! Maps a server subscription id to the local live queries registered under
//! it. Several local instances share an id when the same live query is opened
//! more than once. The registry only holds [`Weak`] references: the caller's
//! handle owns each live query.
//!
//! Invariant: a server id is a key only while at least one instance is
//! registered under it. Removing the last instance removes the key.

use crate::subscription::{LocalId, Subscription};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Process-wide table of registered live queries
pub struct SubscriptionRegistry<T = Subscription> {
    entries: DashMap<String, HashMap<LocalId, Weak<T>>>,
}

impl<T> SubscriptionRegistry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register an instance under a server id, replacing any previous
    /// registration of the same local id
    pub fn register(&self, server_id: &str, local_id: LocalId, instance: &Arc<T>) {
        self.entries
            .entry(server_id.to_string())
            .or_default()
            .insert(local_id, Arc::downgrade(instance));
    }

    /// Remove one instance. Returns whether it was registered.
    pub fn unregister(&self, server_id: &str, local_id: LocalId) -> bool {
        let removed = match self.entries.get_mut(server_id) {
            Some(mut instances) => instances.remove(&local_id).is_some(),
            None => false,
        };
        self.entries
            .remove_if(server_id, |_, instances| instances.is_empty());
        removed
    }

    /// Live instances registered under a server id
    pub fn instances_for(&self, server_id: &str) -> Vec<Arc<T>> {
        // Upgraded handles leave the shard lock before they can be dropped
        let instances: Vec<Arc<T>> = match self.entries.get(server_id) {
            Some(instances) => instances.values().filter_map(Weak::upgrade).collect(),
            None => Vec::new(),
        };
        instances
    }

    /// Whether `local_id` is registered and alive under `server_id`
    pub fn contains(&self, server_id: &str, local_id: LocalId) -> bool {
        self.entries
            .get(server_id)
            .map(|instances| {
                instances
                    .get(&local_id)
                    .map_or(false, |weak| weak.strong_count() > 0)
            })
            .unwrap_or(false)
    }

    /// Server ids that currently have registered instances
    pub fn server_ids(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered instances across all server ids
    pub fn len(&self) -> usize {
        self.entries.iter().map(|entry| entry.value().len()).sum()
    }

    /// Whether no server id has registered instances
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for SubscriptionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_server_id() {
        let registry = SubscriptionRegistry::new();
        let first = Arc::new("first");
        let second = Arc::new("second");
        let (a, b) = (LocalId::new(), LocalId::new());

        registry.register("sub-1", a, &first);
        registry.register("sub-1", b, &second);
        assert_eq!(registry.instances_for("sub-1").len(), 2);

        assert!(registry.unregister("sub-1", a));
        let remaining = registry.instances_for("sub-1");
        assert_eq!(remaining.len(), 1);
        assert_eq!(*remaining[0], "second");
        assert!(registry.contains("sub-1", b));
    }

    #[test]
    fn test_last_removal_prunes_key() {
        let registry = SubscriptionRegistry::new();
        let instance = Arc::new(1u32);
        let id = LocalId::new();

        registry.register("sub-1", id, &instance);
        assert_eq!(registry.server_ids(), vec!["sub-1".to_string()]);

        assert!(registry.unregister("sub-1", id));
        assert!(registry.is_empty());
        assert!(registry.server_ids().is_empty());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry: SubscriptionRegistry<u32> = SubscriptionRegistry::new();
        assert!(!registry.unregister("missing", LocalId::new()));

        let instance = Arc::new(7u32);
        let id = LocalId::new();
        registry.register("sub-1", id, &instance);
        assert!(!registry.unregister("sub-1", LocalId::new()));
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister("sub-1", id));
        assert!(!registry.unregister("sub-1", id));
    }

    #[test]
    fn test_register_overwrites_same_local_id() {
        let registry = SubscriptionRegistry::new();
        let old = Arc::new("old");
        let new = Arc::new("new");
        let id = LocalId::new();

        registry.register("sub-1", id, &old);
        registry.register("sub-1", id, &new);

        let instances = registry.instances_for("sub-1");
        assert_eq!(instances.len(), 1);
        assert_eq!(*instances[0], "new");
    }

    #[test]
    fn test_dropped_instances_are_skipped() {
        let registry = SubscriptionRegistry::new();
        let id = LocalId::new();
        {
            let instance = Arc::new(3u8);
            registry.register("sub-1", id, &instance);
        }
        assert!(registry.instances_for("sub-1").is_empty());
        assert!(!registry.contains("sub-1", id));
        assert!(registry.instances_for("unknown").is_empty());
    }
}
