//! Per-key async mutual exclusion.
//!
//! `KeyedLock` hands out one tokio mutex per key. Unrelated keys never wait
//! on each other, and a key's entry is dropped from the map as soon as the
//! last holder or waiter lets go of it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap<K> = Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>;

/// A set of mutexes addressed by key.
pub struct KeyedLock<K: Eq + Hash + Clone> {
    locks: LockMap<K>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> Clone for KeyedLock<K> {
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn entry(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let mutex = self.entry(&key);
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            key,
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Like `lock`, but give up after `timeout`.
    pub async fn lock_timeout(&self, key: K, timeout: Duration) -> Option<KeyedGuard<K>> {
        tokio::time::timeout(timeout, self.lock(key)).await.ok()
    }

    /// Number of keys currently held or waited on.
    pub fn active_keys(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Exclusive access to one key; released on drop.
pub struct KeyedGuard<K: Eq + Hash + Clone> {
    key: K,
    locks: LockMap<K>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Map entry + our guard: nobody else is waiting.
        if let Some(mutex) = map.get(&self.key) {
            if Arc::strong_count(mutex) <= 2 {
                map.remove(&self.key);
            }
        }
        self.guard.take();
    }
}
