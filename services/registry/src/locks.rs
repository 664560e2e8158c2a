//! Per-key serialization of record mutations.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type ArcLockMap<K> = Arc<DashMap<K, Arc<Mutex<()>>>>;

/// A set of async mutexes addressed by key.
///
/// Mutations of the same key run one at a time; different keys never contend.
/// Entries are dropped once the last guard for a key is released, so the map
/// only holds keys with a mutation in flight.
#[derive(Debug)]
pub(crate) struct KeyedLocks<K: Eq + Hash> {
    locks: ArcLockMap<K>,
}

impl<K: Eq + Hash> Clone for KeyedLocks<K> {
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
        }
    }
}

impl<K: Eq + Hash> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Default::default(),
        }
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    /// Wait for exclusive access to `key`.
    pub(crate) async fn lock(&self, key: K) -> KeyGuard<K> {
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: self.locks.clone(),
            key: Some(key),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive access to one key of a [`KeyedLocks`].
#[derive(Debug)]
pub(crate) struct KeyGuard<K: Eq + Hash> {
    locks: ArcLockMap<K>,
    key: Option<K>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        // Release the mutex first, so the strong count reflects waiters only.
        drop(self.guard.take());
        if let Some(key) = self.key.take() {
            self.locks
                .remove_if(&key, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }
}
