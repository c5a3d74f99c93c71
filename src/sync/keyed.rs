//! Keyed mutual exclusion.
//!
//! A pool of async locks created on demand per key. Acquisitions on
//! different keys never contend; acquisitions on the same key serialize in
//! FIFO order (tokio's mutex is fair).
//!
//! Each key's slot is lease-counted: every pending or held acquisition owns a
//! lease, and the slot is removed from the pool when the last lease drops.
//! A waiter that is cancelled (its future dropped, e.g. by a timeout) drops
//! only its lease, never a lock it did not get.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::{MuninnError, Result};

struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    leases: usize,
}

type Slots<K> = Arc<Mutex<HashMap<K, Slot>>>;

/// Pool of per-key async locks.
pub struct KeyedMutex<K> {
    slots: Slots<K>,
}

impl<K> KeyedMutex<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for exclusive access to `key`.
    ///
    /// Cancel-safe: dropping the returned future before it resolves leaves
    /// the key's state intact.
    pub async fn acquire(&self, key: K) -> KeyedGuard<K> {
        let (lock, lease) = self.lease(key);
        let guard = lock.lock_owned().await;
        KeyedGuard {
            _guard: guard,
            lease,
        }
    }

    /// Like [`acquire`](Self::acquire), giving up after `timeout`.
    pub async fn acquire_timeout(&self, key: K, timeout: Duration) -> Result<KeyedGuard<K>> {
        let label = format!("{key:?}");
        tokio::time::timeout(timeout, self.acquire(key))
            .await
            .map_err(|_| MuninnError::LockTimeout { key: label })
    }

    /// Acquire with an optional timeout; `None` waits indefinitely.
    pub async fn acquire_within(
        &self,
        key: K,
        timeout: Option<Duration>,
    ) -> Result<KeyedGuard<K>> {
        match timeout {
            Some(timeout) => self.acquire_timeout(key, timeout).await,
            None => Ok(self.acquire(key).await),
        }
    }

    /// Acquire `key` only if nobody holds it right now.
    pub fn try_acquire(&self, key: K) -> Option<KeyedGuard<K>> {
        let (lock, lease) = self.lease(key);
        match lock.try_lock_owned() {
            Ok(guard) => Some(KeyedGuard {
                _guard: guard,
                lease,
            }),
            // `lease` drops here and releases the slot if we were alone
            Err(_) => None,
        }
    }

    /// Whether `key` is currently held or awaited.
    pub fn is_contended(&self, key: &K) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Number of keys with at least one holder or waiter.
    pub fn active_keys(&self) -> usize {
        self.slots.lock().len()
    }

    fn lease(&self, key: K) -> (Arc<tokio::sync::Mutex<()>>, Lease<K>) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            leases: 0,
        });
        slot.leases += 1;
        let lock = Arc::clone(&slot.lock);
        drop(slots);

        (
            lock,
            Lease {
                slots: Arc::clone(&self.slots),
                key: Some(key),
            },
        )
    }
}

impl<K> Default for KeyedMutex<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

struct Lease<K: Eq + Hash> {
    slots: Slots<K>,
    key: Option<K>,
}

impl<K: Eq + Hash> Drop for Lease<K> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&key) {
            slot.leases -= 1;
            if slot.leases == 0 {
                slots.remove(&key);
            }
        }
    }
}

/// Exclusive access to one key of a [`KeyedMutex`].
///
/// Dropping the guard releases the lock first, then the slot lease.
pub struct KeyedGuard<K: Eq + Hash> {
    _guard: OwnedMutexGuard<()>,
    lease: Lease<K>,
}

impl<K: Eq + Hash> KeyedGuard<K> {
    pub fn key(&self) -> &K {
        // the key is only taken in `Lease::drop`
        self.lease
            .key
            .as_ref()
            .expect("lease key is present while the guard is alive")
    }
}

impl<K: Eq + Hash + fmt::Debug> fmt::Debug for KeyedGuard<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedGuard")
            .field("key", &self.lease.key)
            .finish()
    }
}
