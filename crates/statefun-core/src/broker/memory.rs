// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory broker backend.
//!
//! A [`MemoryCluster`] models one broker cluster: a core subject space shared
//! by every connection, plus streams and buckets namespaced per domain.
//! Streams capture any published subject matching their filters, sourcing
//! streams copy from upstream streams (optionally in another domain), and
//! durable consumers deliver with ack/nak, ack-wait redelivery and
//! `max_deliver` limits.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::subject::matches;
use super::{
    Broker, BrokerError, ConsumerConfig, Delivery, DeliveryControl, KeyValueBucket,
    KeyValueConfig, KvEntry, PublishAck, StreamConfig, Subscription,
};
use crate::lock_unpoisoned as lock;

/// Sourcing chains deeper than this are not followed.
const MAX_SOURCE_DEPTH: usize = 8;

/// Shared in-memory cluster.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

#[derive(Default)]
struct ClusterInner {
    core_subs: Mutex<Vec<CoreSub>>,
    queue_cursor: AtomicUsize,
    domains: Mutex<HashMap<String, DomainState>>,
}

#[derive(Default)]
struct DomainState {
    streams: HashMap<String, Arc<MemoryStream>>,
    buckets: HashMap<String, Arc<MemoryBucket>>,
}

struct CoreSub {
    pattern: String,
    group: Option<String>,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl MemoryCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection whose account belongs to `domain`.
    pub fn connect(&self, domain: impl Into<String>) -> Arc<MemoryBroker> {
        Arc::new(MemoryBroker {
            cluster: self.inner.clone(),
            domain: domain.into(),
        })
    }
}

impl ClusterInner {
    fn fanout(
        &self,
        subject: &str,
        data: &[u8],
        control: Option<Arc<dyn DeliveryControl>>,
    ) -> usize {
        let mut subs = lock(&self.core_subs);
        subs.retain(|s| !s.sender.is_closed());

        let mut delivered = 0;
        let mut groups: BTreeMap<&str, Vec<&CoreSub>> = BTreeMap::new();
        for sub in subs.iter().filter(|s| matches(&s.pattern, subject)) {
            match &sub.group {
                Some(group) => groups.entry(group.as_str()).or_default().push(sub),
                None => {
                    let delivery = Delivery::new(subject, data.to_vec(), control.clone());
                    if sub.sender.send(delivery).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }
        for members in groups.values() {
            let pick = self.queue_cursor.fetch_add(1, Ordering::Relaxed) % members.len();
            let delivery = Delivery::new(subject, data.to_vec(), control.clone());
            if members[pick].sender.send(delivery).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Store in every capturing stream, following sources. Returns the ack of
    /// the first capturing stream.
    fn capture(&self, subject: &str, data: &[u8]) -> Option<PublishAck> {
        let capturing: Vec<Arc<MemoryStream>> = {
            let domains = lock(&self.domains);
            domains
                .values()
                .flat_map(|d| d.streams.values())
                .filter(|s| s.config.subjects.iter().any(|p| matches(p, subject)))
                .cloned()
                .collect()
        };

        let mut first = None;
        for stream in capturing {
            let sequence = self.store(&stream, subject, data, 0);
            if first.is_none() {
                first = Some(PublishAck {
                    stream: stream.config.name.clone(),
                    sequence,
                });
            }
        }
        first
    }

    fn store(&self, stream: &Arc<MemoryStream>, subject: &str, data: &[u8], depth: usize) -> u64 {
        let sequence = stream.append(subject, data);
        if depth >= MAX_SOURCE_DEPTH {
            warn!(stream = %stream.config.name, "Stream sourcing chain too deep, not following");
            return sequence;
        }
        for downstream in self.downstream_of(stream, subject) {
            self.store(&downstream, subject, data, depth + 1);
        }
        sequence
    }

    fn downstream_of(&self, upstream: &MemoryStream, subject: &str) -> Vec<Arc<MemoryStream>> {
        let domains = lock(&self.domains);
        domains
            .values()
            .flat_map(|d| d.streams.values())
            .filter(|s| {
                s.config.sources.iter().any(|src| {
                    let source_domain = src.external_domain.as_deref().unwrap_or(&s.domain);
                    src.name == upstream.config.name
                        && source_domain == upstream.domain
                        && src
                            .filter_subject
                            .as_deref()
                            .is_none_or(|f| matches(f, subject))
                })
            })
            .cloned()
            .collect()
    }

    fn with_domain<T>(&self, domain: &str, f: impl FnOnce(&mut DomainState) -> T) -> T {
        let mut domains = lock(&self.domains);
        f(domains.entry(domain.to_string()).or_default())
    }
}

struct MemoryStream {
    config: StreamConfig,
    domain: String,
    sequence: AtomicU64,
    consumers: Mutex<HashMap<String, Arc<MemoryConsumer>>>,
}

impl MemoryStream {
    fn append(&self, subject: &str, data: &[u8]) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let consumers: Vec<Arc<MemoryConsumer>> = lock(&self.consumers).values().cloned().collect();
        for consumer in consumers {
            let wanted = consumer
                .config
                .filter_subject
                .as_deref()
                .is_none_or(|f| matches(f, subject));
            if wanted {
                consumer.enqueue(StoredMessage {
                    subject: subject.to_string(),
                    data: data.to_vec(),
                    deliveries: 0,
                });
            }
        }
        sequence
    }
}

#[derive(Clone)]
struct StoredMessage {
    subject: String,
    data: Vec<u8>,
    deliveries: u32,
}

struct MemoryConsumer {
    config: ConsumerConfig,
    state: Mutex<ConsumerState>,
}

#[derive(Default)]
struct ConsumerState {
    pending: VecDeque<StoredMessage>,
    subscribers: Vec<mpsc::UnboundedSender<Delivery>>,
    cursor: usize,
    in_flight: usize,
}

impl MemoryConsumer {
    fn enqueue(self: &Arc<Self>, message: StoredMessage) {
        lock(&self.state).pending.push_back(message);
        self.pump();
    }

    fn attach(self: &Arc<Self>, sender: mpsc::UnboundedSender<Delivery>) {
        lock(&self.state).subscribers.push(sender);
        self.pump();
    }

    fn pump(self: &Arc<Self>) {
        let mut state = lock(&self.state);
        loop {
            if self.config.max_ack_pending > 0 && state.in_flight >= self.config.max_ack_pending {
                break;
            }
            state.subscribers.retain(|s| !s.is_closed());
            if state.subscribers.is_empty() {
                break;
            }
            let Some(mut message) = state.pending.pop_front() else {
                break;
            };
            message.deliveries += 1;

            let control = Arc::new(ConsumerDelivery {
                consumer: Arc::downgrade(self),
                message: message.clone(),
                settled: AtomicBool::new(false),
            });
            let pick = state.cursor % state.subscribers.len();
            state.cursor = state.cursor.wrapping_add(1);

            let delivery = Delivery::new(
                message.subject.clone(),
                message.data.clone(),
                Some(control.clone() as Arc<dyn DeliveryControl>),
            );
            if state.subscribers[pick].send(delivery).is_err() {
                control.settled.store(true, Ordering::SeqCst);
                message.deliveries -= 1;
                state.pending.push_front(message);
                continue;
            }
            state.in_flight += 1;

            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let ack_wait = self.config.ack_wait;
                handle.spawn(async move {
                    tokio::time::sleep(ack_wait).await;
                    if !control.settled.swap(true, Ordering::SeqCst) {
                        debug!(subject = %control.message.subject, "Ack wait elapsed, redelivering");
                        control.redeliver();
                    }
                });
            }
        }
    }

    fn settle(self: &Arc<Self>, redeliver: Option<StoredMessage>) {
        {
            let mut state = lock(&self.state);
            state.in_flight = state.in_flight.saturating_sub(1);
            if let Some(message) = redeliver {
                let exhausted = self
                    .config
                    .max_deliver
                    .is_some_and(|max| message.deliveries >= max);
                if exhausted {
                    warn!(
                        consumer = %self.config.name,
                        subject = %message.subject,
                        deliveries = message.deliveries,
                        "Message reached max deliveries, dropping"
                    );
                } else {
                    state.pending.push_front(message);
                }
            }
        }
        self.pump();
    }
}

struct ConsumerDelivery {
    consumer: Weak<MemoryConsumer>,
    message: StoredMessage,
    settled: AtomicBool,
}

impl ConsumerDelivery {
    fn redeliver(&self) {
        if let Some(consumer) = self.consumer.upgrade() {
            consumer.settle(Some(self.message.clone()));
        }
    }
}

impl DeliveryControl for ConsumerDelivery {
    fn ack(&self) {
        if !self.settled.swap(true, Ordering::SeqCst)
            && let Some(consumer) = self.consumer.upgrade()
        {
            consumer.settle(None);
        }
    }

    fn nak(&self) {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.redeliver();
        }
    }
}

struct RequestReply {
    reply: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
}

impl DeliveryControl for RequestReply {
    fn ack(&self) {}

    fn nak(&self) {}

    fn respond(&self, data: Vec<u8>) -> Result<(), BrokerError> {
        if let Some(reply) = lock(&self.reply).take() {
            // The requester may have timed out already.
            let _ = reply.send(data);
        }
        Ok(())
    }
}

/// Connection to a [`MemoryCluster`] scoped to one domain.
pub struct MemoryBroker {
    cluster: Arc<ClusterInner>,
    domain: String,
}

impl MemoryBroker {
    fn stream(&self, name: &str) -> Result<Arc<MemoryStream>, BrokerError> {
        self.cluster.with_domain(&self.domain, |d| {
            d.streams
                .get(name)
                .cloned()
                .ok_or_else(|| BrokerError::StreamNotFound(name.to_string()))
        })
    }

    fn core_subscribe(&self, subject: &str, group: Option<&str>) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.cluster.core_subs).push(CoreSub {
            pattern: subject.to_string(),
            group: group.map(str::to_string),
            sender,
        });
        Subscription::new(receiver)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn account_domain(&self) -> Option<String> {
        Some(self.domain.clone())
    }

    async fn publish(&self, subject: &str, data: Vec<u8>) -> Result<(), BrokerError> {
        self.cluster.capture(subject, &data);
        self.cluster.fanout(subject, &data, None);
        Ok(())
    }

    async fn publish_persistent(
        &self,
        subject: &str,
        data: Vec<u8>,
    ) -> Result<PublishAck, BrokerError> {
        let ack = self
            .cluster
            .capture(subject, &data)
            .ok_or_else(|| BrokerError::NoStreamResponse(subject.to_string()))?;
        self.cluster.fanout(subject, &data, None);
        Ok(ack)
    }

    async fn request(
        &self,
        subject: &str,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BrokerError> {
        let (tx, rx) = oneshot::channel();
        let control: Arc<dyn DeliveryControl> = Arc::new(RequestReply {
            reply: Mutex::new(Some(tx)),
        });
        if self.cluster.fanout(subject, &data, Some(control)) == 0 {
            return Err(BrokerError::NoResponders);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BrokerError::NoResponders),
            Err(_) => Err(BrokerError::Timeout),
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BrokerError> {
        Ok(self.core_subscribe(subject, None))
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<Subscription, BrokerError> {
        Ok(self.core_subscribe(subject, Some(group)))
    }

    async fn stream_names(&self) -> Result<Vec<String>, BrokerError> {
        Ok(self
            .cluster
            .with_domain(&self.domain, |d| d.streams.keys().cloned().collect()))
    }

    async fn add_stream(&self, config: StreamConfig) -> Result<(), BrokerError> {
        let domain = self.domain.clone();
        self.cluster.with_domain(&self.domain, |d| {
            if let Some(existing) = d.streams.get(&config.name) {
                if existing.config == config {
                    return Ok(());
                }
                return Err(BrokerError::Other(format!(
                    "stream name '{}' already in use with a different configuration",
                    config.name
                )));
            }
            d.streams.insert(
                config.name.clone(),
                Arc::new(MemoryStream {
                    config,
                    domain,
                    sequence: AtomicU64::new(0),
                    consumers: Mutex::new(HashMap::new()),
                }),
            );
            Ok(())
        })
    }

    async fn consumer_names(&self, stream: &str) -> Result<Vec<String>, BrokerError> {
        let stream = self.stream(stream)?;
        let names = lock(&stream.consumers).keys().cloned().collect();
        Ok(names)
    }

    async fn add_consumer(&self, stream: &str, config: ConsumerConfig) -> Result<(), BrokerError> {
        let stream = self.stream(stream)?;
        let mut consumers = lock(&stream.consumers);
        consumers.entry(config.name.clone()).or_insert_with(|| {
            Arc::new(MemoryConsumer {
                config,
                state: Mutex::new(ConsumerState::default()),
            })
        });
        Ok(())
    }

    async fn bind_consumer(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<Subscription, BrokerError> {
        let stream = self.stream(stream)?;
        let consumer = lock(&stream.consumers)
            .get(consumer)
            .cloned()
            .ok_or_else(|| BrokerError::ConsumerNotFound(consumer.to_string()))?;
        let (sender, receiver) = mpsc::unbounded_channel();
        consumer.attach(sender);
        Ok(Subscription::new(receiver))
    }

    async fn key_value(&self, bucket: &str) -> Result<Arc<dyn KeyValueBucket>, BrokerError> {
        self.cluster.with_domain(&self.domain, |d| {
            d.buckets
                .get(bucket)
                .cloned()
                .map(|b| b as Arc<dyn KeyValueBucket>)
                .ok_or_else(|| BrokerError::BucketNotFound(bucket.to_string()))
        })
    }

    async fn create_key_value(
        &self,
        config: KeyValueConfig,
    ) -> Result<Arc<dyn KeyValueBucket>, BrokerError> {
        Ok(self.cluster.with_domain(&self.domain, |d| {
            d.buckets
                .entry(config.bucket.clone())
                .or_insert_with(|| Arc::new(MemoryBucket::new(config.bucket)))
                .clone() as Arc<dyn KeyValueBucket>
        }))
    }
}

/// In-memory versioned bucket.
pub struct MemoryBucket {
    name: String,
    state: Mutex<BucketState>,
}

#[derive(Default)]
struct BucketState {
    entries: BTreeMap<String, (Vec<u8>, u64)>,
    revision: u64,
}

impl MemoryBucket {
    /// Create an empty bucket.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(BucketState::default()),
        }
    }
}

impl BucketState {
    fn write(&mut self, key: &str, value: Vec<u8>) -> u64 {
        self.revision += 1;
        self.entries.insert(key.to_string(), (value, self.revision));
        self.revision
    }
}

#[async_trait]
impl KeyValueBucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<KvEntry>, BrokerError> {
        Ok(lock(&self.state)
            .entries
            .get(key)
            .map(|(value, revision)| KvEntry {
                key: key.to_string(),
                value: value.clone(),
                revision: *revision,
            }))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, BrokerError> {
        Ok(lock(&self.state).write(key, value))
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64, BrokerError> {
        let mut state = lock(&self.state);
        if state.entries.contains_key(key) {
            return Err(BrokerError::KeyExists(key.to_string()));
        }
        Ok(state.write(key, value))
    }

    async fn update(
        &self,
        key: &str,
        value: Vec<u8>,
        last_revision: u64,
    ) -> Result<u64, BrokerError> {
        let mut state = lock(&self.state);
        let current = state.entries.get(key).map_or(0, |(_, r)| *r);
        if current != last_revision {
            return Err(BrokerError::WrongLastRevision {
                key: key.to_string(),
                expected: last_revision,
                current,
            });
        }
        Ok(state.write(key, value))
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        lock(&self.state).entries.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, BrokerError> {
        Ok(lock(&self.state).entries.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::StreamSource;

    fn consumer(name: &str, filter: Option<&str>) -> ConsumerConfig {
        ConsumerConfig {
            name: name.to_string(),
            filter_subject: filter.map(str::to_string),
            ack_wait: Duration::from_secs(30),
            max_deliver: None,
            max_ack_pending: 100,
            deliver_group: Some(name.to_string()),
        }
    }

    fn stream(name: &str, subjects: &[&str]) -> StreamConfig {
        StreamConfig {
            name: name.to_string(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            sources: Vec::new(),
            replicas: 1,
        }
    }

    #[tokio::test]
    async fn test_persistent_publish_requires_stream() {
        let cluster = MemoryCluster::new();
        let broker = cluster.connect("hub");

        let err = broker.publish_persistent("x.y", b"1".to_vec()).await.unwrap_err();
        assert_eq!(err, BrokerError::NoStreamResponse("x.y".to_string()));

        broker.add_stream(stream("s", &["x.>"])).await.unwrap();
        let ack = broker.publish_persistent("x.y", b"1".to_vec()).await.unwrap();
        assert_eq!(ack.stream, "s");
        assert_eq!(ack.sequence, 1);
    }

    #[tokio::test]
    async fn test_consumer_ack_and_nak() {
        let cluster = MemoryCluster::new();
        let broker = cluster.connect("hub");
        broker.add_stream(stream("s", &["x.>"])).await.unwrap();
        broker.add_consumer("s", consumer("c", None)).await.unwrap();
        let mut sub = broker.bind_consumer("s", "c").await.unwrap();

        broker.publish("x.1", b"a".to_vec()).await.unwrap();
        let first = sub.next().await.unwrap();
        assert_eq!(first.subject, "x.1");
        first.nak();

        let again = sub.next().await.unwrap();
        assert_eq!(again.data, b"a".to_vec());
        again.ack();

        broker.publish("x.2", b"b".to_vec()).await.unwrap();
        assert_eq!(sub.next().await.unwrap().subject, "x.2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_wait_redelivers_until_max_deliver() {
        let cluster = MemoryCluster::new();
        let broker = cluster.connect("hub");
        broker.add_stream(stream("s", &["x.>"])).await.unwrap();
        let mut config = consumer("c", None);
        config.ack_wait = Duration::from_millis(100);
        config.max_deliver = Some(2);
        broker.add_consumer("s", config).await.unwrap();
        let mut sub = broker.bind_consumer("s", "c").await.unwrap();

        broker.publish("x.1", b"a".to_vec()).await.unwrap();
        let _first = sub.next().await.unwrap();
        let _second = sub.next().await.unwrap();

        let third = tokio::time::timeout(Duration::from_secs(1), sub.next()).await;
        assert!(third.is_err(), "no delivery after max_deliver");
    }

    #[tokio::test]
    async fn test_sourcing_across_domains() {
        let cluster = MemoryCluster::new();
        let hub = cluster.connect("hub");
        let leaf = cluster.connect("leaf");

        hub.add_stream(stream("hub_events", &["signal.>"])).await.unwrap();
        leaf.add_stream(StreamConfig {
            name: "domain_ingress".to_string(),
            subjects: Vec::new(),
            sources: vec![StreamSource {
                name: "hub_events".to_string(),
                filter_subject: Some("signal.leaf.>".to_string()),
                external_domain: Some("hub".to_string()),
            }],
            replicas: 1,
        })
        .await
        .unwrap();
        leaf.add_consumer("domain_ingress", consumer("ingress", None))
            .await
            .unwrap();
        let mut sub = leaf.bind_consumer("domain_ingress", "ingress").await.unwrap();

        hub.publish_persistent("signal.other.t.1", b"no".to_vec())
            .await
            .unwrap();
        leaf.publish_persistent("signal.leaf.t.1", b"yes".to_vec())
            .await
            .unwrap();

        let delivery = sub.next().await.unwrap();
        assert_eq!(delivery.subject, "signal.leaf.t.1");
        assert_eq!(delivery.data, b"yes".to_vec());
    }

    #[tokio::test]
    async fn test_request_reply_and_no_responders() {
        let cluster = MemoryCluster::new();
        let broker = cluster.connect("hub");

        let err = broker
            .request("request.hub.echo.1", b"{}".to_vec(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::NoResponders);

        let mut sub = broker.queue_subscribe("request.hub.echo.*", "echo").await.unwrap();
        tokio::spawn(async move {
            while let Some(delivery) = sub.next().await {
                let data = delivery.data.clone();
                delivery.respond(data).unwrap();
            }
        });

        let reply = broker
            .request("request.hub.echo.1", b"ping".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, b"ping".to_vec());
    }

    #[tokio::test]
    async fn test_queue_group_delivers_once() {
        let cluster = MemoryCluster::new();
        let broker = cluster.connect("hub");
        let mut a = broker.queue_subscribe("q.>", "g").await.unwrap();
        let mut b = broker.queue_subscribe("q.>", "g").await.unwrap();

        broker.publish("q.1", Vec::new()).await.unwrap();
        broker.publish("q.2", Vec::new()).await.unwrap();

        let mut received = 0;
        for sub in [&mut a, &mut b] {
            while let Ok(Some(_)) =
                tokio::time::timeout(Duration::from_millis(20), sub.next()).await
            {
                received += 1;
            }
        }
        assert_eq!(received, 2);
    }

    #[tokio::test]
    async fn test_bucket_cas() {
        let bucket = MemoryBucket::new("b");

        let r1 = bucket.create("k", b"1".to_vec()).await.unwrap();
        assert!(matches!(
            bucket.create("k", b"2".to_vec()).await,
            Err(BrokerError::KeyExists(_))
        ));

        let r2 = bucket.update("k", b"2".to_vec(), r1).await.unwrap();
        assert!(r2 > r1);
        assert!(matches!(
            bucket.update("k", b"3".to_vec(), r1).await,
            Err(BrokerError::WrongLastRevision { .. })
        ));

        let entry = bucket.get("k").await.unwrap().unwrap();
        assert_eq!(entry.value, b"2".to_vec());
        assert_eq!(entry.revision, r2);

        bucket.delete("k").await.unwrap();
        assert!(bucket.get("k").await.unwrap().is_none());
        assert!(bucket.keys().await.unwrap().is_empty());
    }
}
