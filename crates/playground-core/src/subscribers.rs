//! Handle-keyed subscriber registry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Opaque handle returned by [`SubscriberRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Registry of callbacks keyed by generated handles.
///
/// Dispatch order is subscription order. Handles are never reused within one
/// registry, so a stale handle can never remove a newer subscriber.
#[derive(Debug)]
pub struct SubscriberRegistry<T> {
    next_id: u64,
    entries: BTreeMap<SubscriptionId, T>,
}

impl<T> Default for SubscriberRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubscriberRegistry<T> {
    /// Create an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_id: 1,
            entries: BTreeMap::new(),
        }
    }

    /// Register a callback.
    pub fn subscribe(&mut self, callback: T) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.entries.insert(id, callback);
        id
    }

    /// Remove a callback. Returns it if the handle was live.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Option<T> {
        self.entries.remove(&id)
    }

    /// Whether `id` is still registered.
    #[must_use]
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.entries.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every subscriber.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterate callbacks in subscription order.
    pub fn iter(&self) -> impl Iterator<Item = (SubscriptionId, &T)> {
        self.entries.iter().map(|(id, cb)| (*id, cb))
    }
}

impl<T: Clone> SubscriberRegistry<T> {
    /// Clone out the current callbacks.
    ///
    /// Dispatch over a snapshot so callbacks may subscribe or unsubscribe
    /// while being notified.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        self.entries.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_order_and_unsubscribe() {
        let mut registry = SubscriberRegistry::new();
        let a = registry.subscribe("a");
        let b = registry.subscribe("b");
        let c = registry.subscribe("c");
        assert_eq!(registry.snapshot(), vec!["a", "b", "c"]);

        assert_eq!(registry.unsubscribe(b), Some("b"));
        assert_eq!(registry.unsubscribe(b), None);
        assert!(registry.contains(a));
        assert!(!registry.contains(b));
        assert_eq!(registry.snapshot(), vec!["a", "c"]);
        assert_eq!(registry.len(), 2);

        registry.unsubscribe(a);
        registry.unsubscribe(c);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handles_are_not_reused() {
        let mut registry = SubscriberRegistry::new();
        let first = registry.subscribe(1);
        registry.unsubscribe(first);
        let second = registry.subscribe(2);
        assert_ne!(first, second);
        assert!(registry.unsubscribe(first).is_none());
        assert_eq!(registry.snapshot(), vec![2]);
    }

    #[test]
    fn test_clear() {
        let mut registry = SubscriberRegistry::new();
        registry.subscribe(());
        registry.subscribe(());
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.iter().count(), 0);
    }
}
