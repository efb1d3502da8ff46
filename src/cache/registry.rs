//! LRU registry of cache entries.
//!
//! Maps each key to its entry and keeps entries ordered by recency of lookup.
//! The running byte total is adjusted by size deltas reported after entry
//! updates; whenever it exceeds the budget, least recently used entries are
//! evicted until it fits again.

use std::sync::{Arc, Mutex};

use lru::LruCache;
use metrics::{counter, gauge};
use tracing::{debug, info};

use super::keys::Key;
use super::lock::mutex_lock;
use super::store::Store;

const SOURCE: &str = "cache::registry";

const METRIC_EVICT_TOTAL: &str = "boardcache_evict_total";
const METRIC_BYTES: &str = "boardcache_bytes";
const METRIC_ENTRIES: &str = "boardcache_entries";

struct Slot {
    store: Arc<Store>,
    /// Sum of the deltas applied through [`Registry::apply_size_delta`].
    ///
    /// Deltas may arrive out of order, so this can be transiently negative.
    size: isize,
}

struct RegistryState {
    entries: LruCache<Key, Slot>,
    total_bytes: isize,
    next_id: u64,
}

impl RegistryState {
    fn enforce_budget(&mut self, max_bytes: isize) -> usize {
        let mut evicted = 0;
        while self.total_bytes > max_bytes {
            let Some((key, slot)) = self.entries.pop_lru() else {
                break;
            };
            self.total_bytes -= slot.size;
            evicted += 1;
            debug!(
                %key,
                size = slot.size,
                total_bytes = self.total_bytes,
                "Evicted least recently used cache entry"
            );
        }
        if self.entries.is_empty() {
            self.total_bytes = 0;
        }
        evicted
    }

    fn record_gauges(&self) {
        gauge!(METRIC_BYTES).set(self.total_bytes as f64);
        gauge!(METRIC_ENTRIES).set(self.entries.len() as f64);
    }
}

/// Central index of cache entries.
///
/// The lock guarding the map and recency list is only held for structural
/// changes and never while a strategy is running.
pub(crate) struct Registry {
    state: Mutex<RegistryState>,
    max_bytes: usize,
}

impl Registry {
    pub(crate) fn new(max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                entries: LruCache::unbounded(),
                total_bytes: 0,
                next_id: 0,
            }),
            max_bytes,
        }
    }

    pub(crate) fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Returns the entry for `key`, creating an empty one on a miss.
    ///
    /// Either way the entry becomes the most recently used one. The entry is
    /// returned unlocked.
    pub(crate) fn get_or_create(&self, key: &Key) -> Arc<Store> {
        let mut guard = mutex_lock(&self.state, SOURCE, "get_or_create");
        let state = &mut *guard;

        if let Some(slot) = state.entries.get(key) {
            return Arc::clone(&slot.store);
        }

        state.next_id += 1;
        let store = Arc::new(Store::new(state.next_id, key.clone()));
        state.entries.push(
            key.clone(),
            Slot {
                store: Arc::clone(&store),
                size: 0,
            },
        );
        state.record_gauges();
        store
    }

    /// Applies a size change reported by entry `store_id` and enforces the budget.
    ///
    /// Deltas for entries that were removed in the meantime, or replaced by a
    /// new entry under the same key, are ignored. Returns the number of
    /// evicted entries.
    pub(crate) fn apply_size_delta(&self, key: &Key, store_id: u64, delta: isize) -> usize {
        let mut guard = mutex_lock(&self.state, SOURCE, "apply_size_delta");
        let state = &mut *guard;

        let Some(slot) = state.entries.peek_mut(key) else {
            debug!(%key, delta, "Size delta for removed cache entry ignored");
            return 0;
        };
        if slot.store.id() != store_id {
            debug!(%key, delta, "Size delta for replaced cache entry ignored");
            return 0;
        }

        slot.size += delta;
        state.total_bytes += delta;

        let max_bytes = isize::try_from(self.max_bytes).unwrap_or(isize::MAX);
        let evicted = state.enforce_budget(max_bytes);
        if evicted > 0 {
            counter!(METRIC_EVICT_TOTAL).increment(evicted as u64);
        }
        state.record_gauges();
        evicted
    }

    /// Removes the entry for `key`, if present.
    pub(crate) fn delete(&self, key: &Key) -> bool {
        let mut guard = mutex_lock(&self.state, SOURCE, "delete");
        let state = &mut *guard;

        let removed = state.entries.pop(key);
        if let Some(slot) = &removed {
            state.total_bytes -= slot.size;
            state.record_gauges();
        }
        removed.is_some()
    }

    /// Removes every entry whose key matches `predicate`.
    ///
    /// This is a linear scan over all entries.
    pub(crate) fn delete_where<P>(&self, op: &'static str, predicate: P) -> usize
    where
        P: Fn(&Key) -> bool,
    {
        let mut guard = mutex_lock(&self.state, SOURCE, op);
        let state = &mut *guard;

        let keys: Vec<Key> = state
            .entries
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            if let Some(slot) = state.entries.pop(key) {
                state.total_bytes -= slot.size;
            }
        }
        state.record_gauges();
        keys.len()
    }

    /// Drops every entry and resets the byte total.
    pub(crate) fn clear(&self) {
        let mut guard = mutex_lock(&self.state, SOURCE, "clear");
        let removed = guard.entries.len();
        guard.entries.clear();
        guard.total_bytes = 0;
        guard.record_gauges();
        info!(removed, "Cache cleared");
    }

    /// Checks for an entry without touching its recency.
    pub(crate) fn contains(&self, key: &Key) -> bool {
        mutex_lock(&self.state, SOURCE, "contains")
            .entries
            .contains(key)
    }

    pub(crate) fn len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "len").entries.len()
    }

    /// Byte total as of the last applied delta, floored at zero.
    pub(crate) fn total_bytes(&self) -> usize {
        let total = mutex_lock(&self.state, SOURCE, "total_bytes").total_bytes;
        usize::try_from(total).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(registry: &Registry, key: &Key, size: usize) -> Arc<Store> {
        let store = registry.get_or_create(key);
        registry.apply_size_delta(key, store.id(), size as isize);
        store
    }

    #[test]
    fn get_or_create_returns_same_entry() {
        let registry = Registry::new(1024);
        let key = Key::thread(1, 0);

        let first = registry.get_or_create(&key);
        let second = registry.get_or_create(&key);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(first.key(), &key);
    }

    #[test]
    fn size_deltas_accumulate() {
        let registry = Registry::new(1024);
        let key = Key::thread(1, 0);
        let store = insert(&registry, &key, 100);

        registry.apply_size_delta(&key, store.id(), 50);
        assert_eq!(registry.total_bytes(), 150);

        registry.apply_size_delta(&key, store.id(), -120);
        assert_eq!(registry.total_bytes(), 30);
    }

    #[test]
    fn out_of_order_deltas_sum_to_final_size() {
        let registry = Registry::new(1024);
        let key = Key::thread(1, 0);
        let store = registry.get_or_create(&key);

        // shrink reported before the growth it follows
        registry.apply_size_delta(&key, store.id(), -60);
        assert_eq!(registry.total_bytes(), 0);
        registry.apply_size_delta(&key, store.id(), 100);
        assert_eq!(registry.total_bytes(), 40);

        insert(&registry, &Key::thread(2, 0), 10);
        assert_eq!(registry.total_bytes(), 50);

        assert!(registry.delete(&key));
        assert_eq!(registry.total_bytes(), 10);
    }

    #[test]
    fn evicts_least_recently_looked_up() {
        let registry = Registry::new(300);
        let a = Key::thread(1, 0);
        let b = Key::thread(2, 0);
        let c = Key::thread(3, 0);
        insert(&registry, &a, 100);
        insert(&registry, &b, 100);
        insert(&registry, &c, 100);

        // a becomes most recently used
        registry.get_or_create(&a);
        let d = Key::thread(4, 0);
        let store = insert(&registry, &d, 100);

        assert_eq!(store.key(), &d);
        assert!(!registry.contains(&b));
        assert!(registry.contains(&a));
        assert!(registry.contains(&c));
        assert!(registry.contains(&d));
        assert_eq!(registry.total_bytes(), 300);
    }

    #[test]
    fn evicts_repeatedly_until_under_budget() {
        let registry = Registry::new(250);
        for id in 1..=5 {
            insert(&registry, &Key::thread(id, 0), 50);
        }

        let big = Key::thread(6, 0);
        insert(&registry, &big, 200);

        assert_eq!(registry.len(), 2);
        assert!(registry.contains(&Key::thread(5, 0)));
        assert!(registry.contains(&big));
        assert_eq!(registry.total_bytes(), 250);
    }

    #[test]
    fn oversized_entry_empties_registry() {
        let registry = Registry::new(10);
        let key = Key::thread(1, 0);
        let evicted = {
            let store = registry.get_or_create(&key);
            registry.apply_size_delta(&key, store.id(), 11)
        };

        assert_eq!(evicted, 1);
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.total_bytes(), 0);
    }

    #[test]
    fn delta_for_deleted_entry_is_ignored() {
        let registry = Registry::new(1024);
        let key = Key::thread(1, 0);
        let store = registry.get_or_create(&key);
        registry.delete(&key);

        assert_eq!(registry.apply_size_delta(&key, store.id(), 100), 0);
        assert_eq!(registry.total_bytes(), 0);
        assert!(!registry.contains(&key));
    }

    #[test]
    fn delta_for_replaced_entry_is_ignored() {
        let registry = Registry::new(1024);
        let key = Key::thread(1, 0);
        let stale = registry.get_or_create(&key);
        registry.delete(&key);
        let current = registry.get_or_create(&key);

        registry.apply_size_delta(&key, stale.id(), 100);
        assert_eq!(registry.total_bytes(), 0);

        registry.apply_size_delta(&key, current.id(), 40);
        assert_eq!(registry.total_bytes(), 40);
    }

    #[test]
    fn delete_by_board_keeps_other_boards() {
        let registry = Registry::new(1024);
        insert(&registry, &Key::board("a", -1, true), 10);
        insert(&registry, &Key::board("a", 0, true), 10);
        insert(&registry, &Key::board("a", 0, false), 10);
        insert(&registry, &Key::board("b", 0, true), 10);
        insert(&registry, &Key::thread(1, 5), 10);

        let removed = registry.delete_where("delete_by_board", |key| key.board == "a");

        assert_eq!(removed, 3);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.total_bytes(), 20);
        assert!(registry.contains(&Key::board("b", 0, true)));
        assert!(registry.contains(&Key::thread(1, 5)));
    }

    #[test]
    fn delete_missing_key_is_no_op() {
        let registry = Registry::new(1024);
        insert(&registry, &Key::thread(1, 0), 10);

        assert!(!registry.delete(&Key::thread(2, 0)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.total_bytes(), 10);
    }

    #[test]
    fn clear_resets_everything() {
        let registry = Registry::new(1024);
        insert(&registry, &Key::thread(1, 0), 10);
        insert(&registry, &Key::board("a", 0, true), 10);

        registry.clear();

        assert_eq!(registry.len(), 0);
        assert_eq!(registry.total_bytes(), 0);
    }

    #[test]
    fn contains_does_not_refresh_recency() {
        let registry = Registry::new(200);
        let a = Key::thread(1, 0);
        let b = Key::thread(2, 0);
        insert(&registry, &a, 100);
        insert(&registry, &b, 100);

        assert!(registry.contains(&a));
        insert(&registry, &Key::thread(3, 0), 100);

        assert!(!registry.contains(&a));
        assert!(registry.contains(&b));
    }
}
