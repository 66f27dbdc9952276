//! Read-mostly concurrent map.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

/// A map from keys to shared values guarded by a reader/writer lock.
///
/// Lookups proceed concurrently; inserts and removals are exclusive. Used for
/// the connection table of stream servers and the server tables of the
/// manager.
pub struct Table<K, V> {
    entries: RwLock<HashMap<K, Arc<V>>>,
}

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V> Table<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the map itself inconsistent,
    // so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, Arc<V>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, Arc<V>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Inserts `value` unless `key` is present. Returns false if it was.
    pub fn try_add(&self, key: K, value: Arc<V>) -> bool {
        let mut entries = self.write();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, value);
        true
    }

    /// Inserts `value`, returning the entry it displaced.
    pub fn replace(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        self.write().insert(key, value)
    }

    /// Removes the entry for `key` only if it is still `value`.
    pub fn remove_if_same(&self, key: &K, value: &Arc<V>) -> bool {
        let mut entries = self.write();
        match entries.get(key) {
            Some(current) if Arc::ptr_eq(current, value) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Removes and returns the entry for `key`.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.write().remove(key)
    }

    /// Removes every entry matching `predicate` and returns them.
    pub fn remove_where(&self, mut predicate: impl FnMut(&K, &V) -> bool) -> Vec<(K, Arc<V>)> {
        let mut entries = self.write();
        let keys: Vec<K> = entries
            .iter()
            .filter(|(key, value)| predicate(key, value))
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| entries.remove(&key).map(|value| (key, value)))
            .collect()
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.read().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.read().contains_key(key)
    }

    /// Returns a snapshot of the keys.
    pub fn keys(&self) -> Vec<K> {
        self.read().keys().cloned().collect()
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<(K, Arc<V>)> {
        self.write().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_returns_displaced() {
        let table = Table::new();
        let first = Arc::new("first");
        let second = Arc::new("second");
        assert!(table.replace(1, first.clone()).is_none());
        let displaced = table.replace(1, second.clone()).unwrap();
        assert!(Arc::ptr_eq(&displaced, &first));
        assert!(Arc::ptr_eq(&table.get(&1).unwrap(), &second));
    }

    #[test]
    fn test_remove_if_same_ignores_replacement() {
        let table = Table::new();
        let old = Arc::new(1);
        let new = Arc::new(1);
        table.replace("peer", old.clone());
        table.replace("peer", new.clone());

        // The stale holder cannot remove the newer entry.
        assert!(!table.remove_if_same(&"peer", &old));
        assert!(table.contains(&"peer"));
        assert!(table.remove_if_same(&"peer", &new));
        assert!(table.is_empty());
    }

    #[test]
    fn test_try_add_and_remove_where() {
        let table = Table::new();
        assert!(table.try_add(1, Arc::new("a")));
        assert!(!table.try_add(1, Arc::new("b")));
        table.replace(2, Arc::new("b"));
        table.replace(3, Arc::new("c"));

        let mut removed: Vec<_> = table
            .remove_where(|key, _| key % 2 == 1)
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        removed.sort();
        assert_eq!(removed, vec![1, 3]);
        assert_eq!(table.keys(), vec![2]);
        assert_eq!(table.drain().len(), 1);
        assert_eq!(table.len(), 0);
    }
}
