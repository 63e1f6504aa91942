// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for statefun-core integration tests.
//!
//! Every test runs its runtimes on a fresh in-memory cluster, so tests never
//! share streams, buckets or subscriptions.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use statefun_core::broker::memory::{MemoryBroker, MemoryCluster};
use statefun_core::broker::{
    Broker, BrokerError, ConsumerConfig, KeyValueBucket, KeyValueConfig, PublishAck,
    StreamConfig, Subscription,
};
use statefun_core::kv_mutex::KvMutex;
use statefun_core::{
    FunctionTypeConfig, FunctionTypeDefinition, Runtime, RuntimeConfig, WorkerPoolConfig,
};

/// Runtime configuration with short intervals suited to tests.
pub fn test_config(name: &str) -> RuntimeConfig {
    RuntimeConfig {
        name: name.to_string(),
        hub_domain: "hub".to_string(),
        kv_mutex_lifetime: Duration::from_millis(600),
        kv_mutex_poll_interval: Duration::from_millis(10),
        id_lifetime: Duration::from_secs(30),
        request_timeout: Duration::from_secs(2),
        gc_interval: Duration::from_millis(50),
        ..RuntimeConfig::default()
    }
}

/// Small explicit pool, independent of `WP_*` variables.
pub fn small_pool(max_workers: usize) -> WorkerPoolConfig {
    WorkerPoolConfig {
        min_workers: 1,
        max_workers,
        idle_timeout: Duration::from_secs(1),
        task_queue_len: 16,
    }
}

/// Function type config served by every runtime that registers it.
pub fn shared_type(max_workers: usize) -> FunctionTypeConfig {
    FunctionTypeConfig::new()
        .with_worker_pool(small_pool(max_workers))
        .with_multiple_instances_allowed(true)
}

/// Start a runtime on `cluster` in `domain`.
pub async fn start_runtime(
    cluster: &MemoryCluster,
    domain: &str,
    config: RuntimeConfig,
    function_types: Vec<FunctionTypeDefinition>,
) -> Runtime {
    let mut builder = Runtime::builder()
        .config(config)
        .broker(cluster.connect(domain));
    for definition in function_types {
        builder = builder.function_type(definition);
    }
    builder
        .build()
        .expect("runtime config")
        .start()
        .await
        .expect("runtime start")
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Shared log written by handlers.
pub type Recorded<T> = Arc<Mutex<Vec<T>>>;

pub fn recorded<T>() -> Recorded<T> {
    Arc::new(Mutex::new(Vec::new()))
}

/// Overwrite the mutex entry of `key` with a fresh lock time, as if another
/// process had taken it.
pub async fn steal_mutex(runtime: &Runtime, key: &str) {
    let now = chrono::Utc::now().timestamp_nanos_opt().unwrap();
    runtime
        .domain()
        .kv()
        .unwrap()
        .put(&KvMutex::mutex_key(key), now.to_be_bytes().to_vec())
        .await
        .unwrap();
}

/// Whether the mutex entry of `key` is present and released.
pub async fn mutex_released(runtime: &Runtime, key: &str) -> bool {
    let entry = runtime
        .domain()
        .kv()
        .unwrap()
        .get(&KvMutex::mutex_key(key))
        .await
        .unwrap();
    entry.is_some_and(|entry| entry.value == 0i64.to_be_bytes())
}

/// Memory broker whose persistent publishes fail on subjects starting with a
/// configurable prefix.
pub struct FailingBroker {
    inner: Arc<MemoryBroker>,
    fail_prefix: Mutex<Option<String>>,
}

impl FailingBroker {
    pub fn new(inner: Arc<MemoryBroker>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_prefix: Mutex::new(None),
        })
    }

    pub fn fail_persistent(&self, prefix: &str) {
        *self.fail_prefix.lock().unwrap() = Some(prefix.to_string());
    }
}

#[async_trait]
impl Broker for FailingBroker {
    fn account_domain(&self) -> Option<String> {
        self.inner.account_domain()
    }

    async fn publish(&self, subject: &str, data: Vec<u8>) -> Result<(), BrokerError> {
        self.inner.publish(subject, data).await
    }

    async fn publish_persistent(
        &self,
        subject: &str,
        data: Vec<u8>,
    ) -> Result<PublishAck, BrokerError> {
        let failing = self
            .fail_prefix
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|prefix| subject.starts_with(prefix));
        if failing {
            return Err(BrokerError::Closed);
        }
        self.inner.publish_persistent(subject, data).await
    }

    async fn request(
        &self,
        subject: &str,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BrokerError> {
        self.inner.request(subject, data, timeout).await
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BrokerError> {
        self.inner.subscribe(subject).await
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<Subscription, BrokerError> {
        self.inner.queue_subscribe(subject, group).await
    }

    async fn stream_names(&self) -> Result<Vec<String>, BrokerError> {
        self.inner.stream_names().await
    }

    async fn add_stream(&self, config: StreamConfig) -> Result<(), BrokerError> {
        self.inner.add_stream(config).await
    }

    async fn consumer_names(&self, stream: &str) -> Result<Vec<String>, BrokerError> {
        self.inner.consumer_names(stream).await
    }

    async fn add_consumer(&self, stream: &str, config: ConsumerConfig) -> Result<(), BrokerError> {
        self.inner.add_consumer(stream, config).await
    }

    async fn bind_consumer(&self, stream: &str, consumer: &str) -> Result<Subscription, BrokerError> {
        self.inner.bind_consumer(stream, consumer).await
    }

    async fn key_value(&self, bucket: &str) -> Result<Arc<dyn KeyValueBucket>, BrokerError> {
        self.inner.key_value(bucket).await
    }

    async fn create_key_value(
        &self,
        config: KeyValueConfig,
    ) -> Result<Arc<dyn KeyValueBucket>, BrokerError> {
        self.inner.create_key_value(config).await
    }
}
