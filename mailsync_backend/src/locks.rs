//! Per-key async locks.
//!
//! Cursor updates are serialized per account and reply transitions per
//! (conversation, item). Both go through a `KeyedLocks` registry; entries are
//! dropped from the map once nobody holds or waits on them.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap<K> = Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>;

pub struct KeyedLocks<K> {
    entries: LockMap<K>,
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn entry(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait until `key` is free, then hold it until the guard drops.
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let mutex = self.entry(&key);
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            key,
            guard: Some(guard),
            entries: self.entries.clone(),
        }
    }

    /// Take `key` only if nobody else holds it right now.
    pub fn try_lock(&self, key: K) -> Option<KeyedGuard<K>> {
        let mutex = self.entry(&key);
        match mutex.try_lock_owned() {
            Ok(guard) => Some(KeyedGuard {
                key,
                guard: Some(guard),
                entries: self.entries.clone(),
            }),
            Err(_) => None,
        }
    }

    pub fn is_locked(&self, key: &K) -> bool {
        let map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        map.get(key).map(|m| m.try_lock().is_err()).unwrap_or(false)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

pub struct KeyedGuard<K>
where
    K: Eq + Hash,
{
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    entries: LockMap<K>,
}

impl<K> Drop for KeyedGuard<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        // Release first so the strong count below reflects waiters only.
        drop(self.guard.take());
        let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if map.get(&self.key).map(Arc::strong_count) == Some(1) {
            map.remove(&self.key);
        }
    }
}
