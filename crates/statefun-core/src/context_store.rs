// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted per-ID JSON contexts.
//!
//! Function contexts live at `<type>.<id>`, object contexts at `<id>`. Each
//! entry is stored as `{"value": ..., "expires_at": <unix ms> | null}`;
//! expired entries read as absent and are removed by [`ContextStore::sweep_expired`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::broker::KeyValueBucket;
use crate::error::Result;

/// Storage for function and object contexts.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Read a context, `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write a context. `None` deletes it.
    async fn set(&self, key: &str, value: Option<Value>) -> Result<()>;

    /// Expire an existing context `after` from now. Absent keys are ignored.
    async fn set_expiration_after(&self, key: &str, after: Duration) -> Result<()>;

    /// Delete expired contexts, returning how many were removed.
    async fn sweep_expired(&self) -> Result<usize>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredContext {
    value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
}

impl StoredContext {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }
}

/// [`ContextStore`] backed by the domain's key-value bucket.
pub struct KvContextStore {
    bucket: Arc<dyn KeyValueBucket>,
}

impl KvContextStore {
    /// Store contexts in `bucket`.
    pub fn new(bucket: Arc<dyn KeyValueBucket>) -> Self {
        Self { bucket }
    }

    async fn read(&self, key: &str) -> Result<Option<StoredContext>> {
        let Some(entry) = self.bucket.get(key).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&entry.value)?))
    }

    async fn write(&self, key: &str, stored: &StoredContext) -> Result<()> {
        self.bucket.put(key, serde_json::to_vec(stored)?).await?;
        Ok(())
    }
}

#[async_trait]
impl ContextStore for KvContextStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self
            .read(key)
            .await?
            .filter(|stored| !stored.is_expired(now_ms()))
            .map(|stored| stored.value))
    }

    async fn set(&self, key: &str, value: Option<Value>) -> Result<()> {
        match value {
            Some(value) => {
                self.write(
                    key,
                    &StoredContext {
                        value,
                        expires_at: None,
                    },
                )
                .await
            }
            None => Ok(self.bucket.delete(key).await?),
        }
    }

    async fn set_expiration_after(&self, key: &str, after: Duration) -> Result<()> {
        let Some(mut stored) = self.read(key).await? else {
            return Ok(());
        };
        let after_ms = i64::try_from(after.as_millis()).unwrap_or(i64::MAX);
        stored.expires_at = Some(now_ms().saturating_add(after_ms));
        self.write(key, &stored).await
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let now = now_ms();
        let mut removed = 0;
        for key in self.bucket.keys().await? {
            // Mutex entries share the bucket.
            if key.ends_with(".mutex") {
                continue;
            }
            let Some(entry) = self.bucket.get(&key).await? else {
                continue;
            };
            // Foreign values sharing the bucket are left alone.
            let Ok(stored) = serde_json::from_slice::<StoredContext>(&entry.value) else {
                continue;
            };
            if stored.is_expired(now) {
                self.bucket.delete(&key).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Swept expired contexts");
        }
        Ok(removed)
    }
}

/// Bucket key of a function context.
pub fn function_context_key(typename: &str, id: &str) -> String {
    format!("{typename}.{id}")
}

/// Bucket key of an object context.
pub fn object_context_key(id: &str) -> String {
    id.to_string()
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
