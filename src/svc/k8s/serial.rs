//! # Serial module
//!
//! This module provide a per-key serializer, at most one pass runs for a given
//! key at any time. A request received while a pass is in flight is coalesced
//! into a single re-run of that pass once it completes, so nothing is dropped.

use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{Mutex, MutexGuard, PoisonError},
};

// -----------------------------------------------------------------------------
// Slot structure

/// releases the key if the pass is cancelled
struct Slot<'a, K>
where
    K: Eq + Hash,
{
    slots: &'a Mutex<HashMap<K, bool>>,
    key: Option<K>,
}

impl<'a, K> Drop for Slot<'a, K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
        }
    }
}

// -----------------------------------------------------------------------------
// Serializer structure

#[derive(Debug)]
pub struct Serializer<K> {
    /// keys with a pass in flight, the flag tells if a re-run was requested
    slots: Mutex<HashMap<K, bool>>,
}

impl<K> Default for Serializer<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> Serializer<K>
where
    K: Eq + Hash + Clone,
{
    fn lock(&self) -> MutexGuard<'_, HashMap<K, bool>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    /// runs `f` for the given key, returns `None` if a pass is already in
    /// flight, in which case that pass runs `f` once more before releasing the
    /// key. The returned value is the output of the last run.
    pub async fn run<F, Fut, T>(&self, key: K, mut f: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = T>,
    {
        {
            let mut slots = self.lock();
            if let Some(pending) = slots.get_mut(&key) {
                *pending = true;
                return None;
            }

            slots.insert(key.to_owned(), false);
        }

        let mut slot = Slot {
            slots: &self.slots,
            key: Some(key.to_owned()),
        };

        loop {
            let output = f().await;

            let done = {
                let mut slots = self.lock();
                if slots.get(&key).copied().unwrap_or(false) {
                    slots.insert(key.to_owned(), false);
                    false
                } else {
                    slots.remove(&key);
                    true
                }
            };

            if done {
                slot.key = None;
                return Some(output);
            }
        }
    }
}
