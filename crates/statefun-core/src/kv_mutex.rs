// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster-wide lease mutex on a versioned key-value bucket.
//!
//! A mutex lives under `<key>.mutex`. Its value is the lock time as an 8-byte
//! big-endian nanosecond timestamp, `0` meaning unlocked. Every write goes
//! through create-if-absent or compare-and-swap on the revision, and the
//! revision returned by a successful write is the holder's proof of
//! ownership for [`KvMutex::renew`] and [`KvMutex::unlock`].
//!
//! A holder that stops renewing loses the lock once `lifetime` has elapsed
//! since its last write. This is lease-based exclusion, not consensus: under a
//! partition a stale holder may still act until it notices its lease is gone.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, trace};

use crate::broker::{BrokerError, KeyValueBucket};
use crate::error::{Result, StatefunError};

/// Distributed mutex over one bucket.
#[derive(Clone)]
pub struct KvMutex {
    bucket: Arc<dyn KeyValueBucket>,
    poll_interval: Duration,
}

impl KvMutex {
    /// Create a mutex helper over `bucket`.
    pub fn new(bucket: Arc<dyn KeyValueBucket>, poll_interval: Duration) -> Self {
        Self {
            bucket,
            poll_interval,
        }
    }

    /// Bucket key backing the mutex for `key`.
    pub fn mutex_key(key: &str) -> String {
        format!("{key}.mutex")
    }

    /// Acquire the mutex for `key`, returning the holder's revision.
    ///
    /// With `error_on_locked`, a live lock fails fast with
    /// [`StatefunError::MutexLocked`]; otherwise the call polls until the lock
    /// is released or expires.
    pub async fn lock(&self, key: &str, lifetime: Duration, error_on_locked: bool) -> Result<u64> {
        let mutex_key = Self::mutex_key(key);

        loop {
            let now = now_nanos();
            match self.bucket.get(&mutex_key).await? {
                None => match self.bucket.create(&mutex_key, encode(now)).await {
                    Ok(revision) => {
                        debug!(key = %key, revision, "Mutex acquired");
                        return Ok(revision);
                    }
                    Err(BrokerError::KeyExists(_)) => continue,
                    Err(e) => return Err(e.into()),
                },
                Some(entry) => {
                    let locked_at = decode(&entry.value);
                    if locked_at != 0 && !expired(locked_at, lifetime, now) {
                        if error_on_locked {
                            return Err(StatefunError::MutexLocked {
                                key: key.to_string(),
                            });
                        }
                        trace!(key = %key, "Mutex held, waiting");
                        tokio::time::sleep(self.poll_interval).await;
                        continue;
                    }
                    match self
                        .bucket
                        .update(&mutex_key, encode(now), entry.revision)
                        .await
                    {
                        Ok(revision) => {
                            debug!(key = %key, revision, takeover = (locked_at != 0), "Mutex acquired");
                            return Ok(revision);
                        }
                        Err(BrokerError::WrongLastRevision { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Refresh the lock time of a held mutex, returning the new revision.
    pub async fn renew(&self, key: &str, revision: u64) -> Result<u64> {
        let mutex_key = Self::mutex_key(key);
        self.check_holder(key, &mutex_key, revision).await?;

        self.bucket
            .update(&mutex_key, encode(now_nanos()), revision)
            .await
            .map_err(|e| holder_error(key, revision, e))
    }

    /// Release a held mutex.
    ///
    /// A stale revision is reported as [`StatefunError::RevisionMismatch`] and
    /// leaves the current holder's lock in place.
    pub async fn unlock(&self, key: &str, revision: u64) -> Result<()> {
        let mutex_key = Self::mutex_key(key);
        self.check_holder(key, &mutex_key, revision).await?;

        self.bucket
            .update(&mutex_key, encode(0), revision)
            .await
            .map_err(|e| holder_error(key, revision, e))?;
        debug!(key = %key, revision, "Mutex released");
        Ok(())
    }

    async fn check_holder(&self, key: &str, mutex_key: &str, revision: u64) -> Result<()> {
        let Some(entry) = self.bucket.get(mutex_key).await? else {
            return Err(StatefunError::AlreadyUnlocked {
                key: key.to_string(),
            });
        };
        if entry.revision != revision {
            return Err(StatefunError::RevisionMismatch {
                key: key.to_string(),
                expected: revision,
                actual: entry.revision,
            });
        }
        if decode(&entry.value) == 0 {
            return Err(StatefunError::AlreadyUnlocked {
                key: key.to_string(),
            });
        }
        Ok(())
    }
}

fn holder_error(key: &str, revision: u64, err: BrokerError) -> StatefunError {
    match err {
        BrokerError::WrongLastRevision { current, .. } => StatefunError::RevisionMismatch {
            key: key.to_string(),
            expected: revision,
            actual: current,
        },
        other => other.into(),
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn expired(locked_at: i64, lifetime: Duration, now: i64) -> bool {
    let lifetime = i64::try_from(lifetime.as_nanos()).unwrap_or(i64::MAX);
    locked_at.saturating_add(lifetime) <= now
}

fn encode(nanos: i64) -> Vec<u8> {
    nanos.to_be_bytes().to_vec()
}

fn decode(value: &[u8]) -> i64 {
    <[u8; 8]>::try_from(value).map_or(0, i64::from_be_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBucket;

    fn mutex() -> KvMutex {
        KvMutex::new(
            Arc::new(MemoryBucket::new("test")),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_timestamp_encoding() {
        assert_eq!(decode(&encode(42)), 42);
        assert_eq!(decode(&[]), 0);
        assert_eq!(decode(b"garbage"), 0);
        assert!(expired(0, Duration::from_secs(1), 2_000_000_000));
        assert!(!expired(1_500_000_000, Duration::from_secs(1), 2_000_000_000));
    }

    #[tokio::test]
    async fn test_lock_unlock_relock() {
        let mutex = mutex();
        let rev = mutex.lock("obj-1", Duration::from_secs(60), true).await.unwrap();

        let err = mutex
            .lock("obj-1", Duration::from_secs(60), true)
            .await
            .unwrap_err();
        assert!(matches!(err, StatefunError::MutexLocked { .. }));

        mutex.unlock("obj-1", rev).await.unwrap();
        let again = mutex.lock("obj-1", Duration::from_secs(60), true).await.unwrap();
        assert!(again > rev);
    }

    #[tokio::test]
    async fn test_stale_unlock_keeps_current_holder() {
        let mutex = mutex();
        let stale = mutex.lock("k", Duration::from_millis(20), true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let current = mutex.lock("k", Duration::from_secs(60), true).await.unwrap();
        let err = mutex.unlock("k", stale).await.unwrap_err();
        assert!(matches!(
            err,
            StatefunError::RevisionMismatch { expected, actual, .. } if expected == stale && actual == current
        ));

        // Still held by the current holder.
        assert!(matches!(
            mutex.lock("k", Duration::from_secs(60), true).await,
            Err(StatefunError::MutexLocked { .. })
        ));
        mutex.unlock("k", current).await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_and_double_unlock() {
        let mutex = mutex();
        let rev = mutex.lock("k", Duration::from_secs(60), true).await.unwrap();
        let renewed = mutex.renew("k", rev).await.unwrap();
        assert!(renewed > rev);

        assert!(matches!(
            mutex.renew("k", rev).await,
            Err(StatefunError::RevisionMismatch { .. })
        ));

        mutex.unlock("k", renewed).await.unwrap();
        let released_rev = mutex.bucket.get("k.mutex").await.unwrap().unwrap().revision;
        assert!(matches!(
            mutex.unlock("k", released_rev).await,
            Err(StatefunError::AlreadyUnlocked { .. })
        ));
        assert!(matches!(
            mutex.renew("missing", 1).await,
            Err(StatefunError::AlreadyUnlocked { .. })
        ));
    }

    #[tokio::test]
    async fn test_blocking_lock_waits_for_release() {
        let mutex = mutex();
        let rev = mutex.lock("k", Duration::from_secs(60), false).await.unwrap();

        let waiter = {
            let mutex = mutex.clone();
            tokio::spawn(async move { mutex.lock("k", Duration::from_secs(60), false).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        mutex.unlock("k", rev).await.unwrap();
        let second = waiter.await.unwrap().unwrap();
        assert!(second > rev);
    }
}
