//! Per-key async locks.
//!
//! Each key gets its own `tokio::sync::Mutex`, created on first use and
//! dropped once no guard or waiter references it. Operations on different
//! keys never contend.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::OwnedMutexGuard;

/// Guard held for the duration of a keyed critical section.
pub type KeyGuard = OwnedMutexGuard<()>;

pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Weak<tokio::sync::Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for `key`, waiting for any current holder.
    pub async fn lock(&self, key: &K) -> KeyGuard {
        let mutex = self.entry(key);
        mutex.lock_owned().await
    }

    fn entry(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = map.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        map.retain(|_, w| w.strong_count() > 0);
        let fresh = Arc::new(tokio::sync::Mutex::new(()));
        map.insert(key.clone(), Arc::downgrade(&fresh));
        fresh
    }

    /// Number of keys with a live lock.
    pub fn active(&self) -> usize {
        let map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        map.values().filter(|w| w.strong_count() > 0).count()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}
