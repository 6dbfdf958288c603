use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::alarm::lock_unpoisoned;

/// A family of mutexes addressed by key, created on demand.
///
/// Entries are dropped again once no caller holds or waits on them, so the
/// map only ever contains keys with work in flight.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `critical` while holding the lock for `key`.
    pub fn with_lock<R>(&self, key: &K, critical: impl FnOnce() -> R) -> R {
        let slot = {
            let mut slots = lock_unpoisoned(&self.slots);
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let output = {
            let _guard = lock_unpoisoned(&slot);
            critical()
        };

        let mut slots = lock_unpoisoned(&self.slots);
        // One reference in the map, one here: nobody else is queued.
        if Arc::strong_count(&slot) == 2 {
            slots.remove(key);
        }
        output
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.slots).len()
    }
}
