// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-local per-key mutex.
//!
//! Each key gets its own async mutex, created on first use and removed once
//! nobody holds or waits for it, so idle keys cost nothing. Reference counts
//! are changed under the map's shard lock, which closes the race between a
//! releaser removing a slot and a new locker picking it up.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-key exclusive lock with reference-counted slots.
#[derive(Clone, Default)]
pub struct KeyMutex {
    slots: Arc<DashMap<String, Slot>>,
}

struct Slot {
    lock: Arc<Mutex<()>>,
    refs: usize,
}

/// Exclusive hold on one key. Dropping it unlocks.
pub struct KeyGuard {
    // Declared first so the lock is released before the slot reference.
    _guard: OwnedMutexGuard<()>,
    slot: SlotRef,
}

impl KeyGuard {
    /// Key held by this guard.
    pub fn key(&self) -> &str {
        &self.slot.key
    }
}

impl std::fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.slot.key).finish()
    }
}

struct SlotRef {
    owner: KeyMutex,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        self.owner.release(&self.key);
    }
}

impl KeyMutex {
    /// Create an empty key mutex.
    pub fn new() -> Self {
        Self::default()
    }

    fn reserve(&self, key: &str) -> SlotRef {
        let lock = {
            let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
                lock: Arc::new(Mutex::new(())),
                refs: 0,
            });
            slot.refs += 1;
            slot.lock.clone()
        };
        SlotRef {
            owner: self.clone(),
            key: key.to_string(),
            lock,
        }
    }

    fn release(&self, key: &str) {
        let remaining = match self.slots.get_mut(key) {
            Some(mut slot) => {
                slot.refs -= 1;
                slot.refs
            }
            None => panic!("key mutex released for '{key}' which was never locked"),
        };
        if remaining == 0 {
            self.slots.remove_if(key, |_, slot| slot.refs == 0);
        }
    }

    /// Wait for exclusive access to `key`.
    ///
    /// Cancel-safe: dropping the future before it resolves gives up the
    /// reservation.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let slot = self.reserve(key);
        let guard = slot.lock.clone().lock_owned().await;
        KeyGuard {
            _guard: guard,
            slot,
        }
    }

    /// Lock `key` only if nobody holds it.
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        let slot = self.reserve(key);
        let guard = slot.lock.clone().try_lock_owned().ok()?;
        Some(KeyGuard {
            _guard: guard,
            slot,
        })
    }

    /// Whether `key` is currently held.
    pub fn is_locked(&self, key: &str) -> bool {
        self.slots
            .get(key)
            .is_some_and(|slot| slot.lock.try_lock().is_err())
    }

    /// Number of keys with live slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no key has a live slot.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_slot_removed_after_unlock() {
        let mutex = KeyMutex::new();
        let guard = mutex.lock("a").await;
        assert_eq!(guard.key(), "a");
        assert!(mutex.is_locked("a"));
        assert_eq!(mutex.len(), 1);

        drop(guard);
        assert!(!mutex.is_locked("a"));
        assert!(mutex.is_empty());
    }

    #[tokio::test]
    async fn test_try_lock_fails_while_held() {
        let mutex = KeyMutex::new();
        let guard = mutex.try_lock("a").unwrap();
        assert!(mutex.try_lock("a").is_none());
        assert!(mutex.try_lock("b").is_some());
        assert_eq!(mutex.len(), 1, "failed and released attempts leave no slots");

        drop(guard);
        assert!(mutex.try_lock("a").is_some());
        assert!(mutex.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_reservation() {
        let mutex = KeyMutex::new();
        let guard = mutex.lock("a").await;

        let waiting = tokio::time::timeout(Duration::from_millis(20), mutex.lock("a")).await;
        assert!(waiting.is_err());

        drop(guard);
        assert!(mutex.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exclusive_per_key() {
        let mutex = KeyMutex::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let mutex = mutex.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                tokio::spawn(async move {
                    let _guard = mutex.lock("shared").await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(mutex.is_empty());
    }
}
