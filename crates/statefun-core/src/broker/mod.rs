// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message-broker and key-value interfaces consumed by the runtime.
//!
//! The runtime never talks to a concrete broker. It needs:
//! - core publish, request/reply and (queue) subscriptions on a subject space
//!   shared by every domain of the cluster,
//! - persistent streams with durable consumers (ack/nak/redelivery),
//! - versioned key-value buckets with compare-and-swap updates.
//!
//! [`memory::MemoryCluster`] is the in-process backend used by tests and the
//! standalone node.

pub mod memory;
pub mod subject;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Broker and key-value store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum BrokerError {
    /// Nobody is subscribed to the request subject.
    #[error("no responders available for request")]
    NoResponders,

    /// The operation did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// A persistent publish was not captured by any stream.
    #[error("no stream response for subject '{0}'")]
    NoStreamResponse(String),

    /// Stream does not exist.
    #[error("stream '{0}' not found")]
    StreamNotFound(String),

    /// Consumer does not exist.
    #[error("consumer '{0}' not found")]
    ConsumerNotFound(String),

    /// Bucket does not exist.
    #[error("key-value bucket '{0}' not found")]
    BucketNotFound(String),

    /// `create` on a key that already holds a value.
    #[error("key '{0}' already exists")]
    KeyExists(String),

    /// Compare-and-swap failed.
    #[error("wrong last revision for key '{key}': expected {expected}, current {current}")]
    WrongLastRevision {
        /// Key being updated.
        key: String,
        /// Revision presented by the caller.
        expected: u64,
        /// Revision in the bucket (0 when absent).
        current: u64,
    },

    /// The delivery has no reply subject.
    #[error("delivery has no reply subject")]
    NoReplySubject,

    /// The connection is closed.
    #[error("connection closed")]
    Closed,

    /// Other backend failure.
    #[error("{0}")]
    Other(String),
}

/// Acknowledgement for a persistent publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Stream that captured the message.
    pub stream: String,
    /// Sequence number within that stream.
    pub sequence: u64,
}

/// Upstream stream a stream copies messages from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSource {
    /// Name of the source stream.
    pub name: String,
    /// Only messages matching this subject are copied.
    pub filter_subject: Option<String>,
    /// Domain hosting the source stream when it is not the local one.
    pub external_domain: Option<String>,
}

/// Persistent stream definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Stream name, unique within a domain.
    pub name: String,
    /// Subjects captured from the shared subject space.
    pub subjects: Vec<String>,
    /// Streams this one sources from.
    pub sources: Vec<StreamSource>,
    /// Replication factor.
    pub replicas: usize,
}

/// Durable consumer definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Durable consumer name.
    pub name: String,
    /// Only messages on matching subjects are delivered.
    pub filter_subject: Option<String>,
    /// Redeliver when not acknowledged within this time.
    pub ack_wait: Duration,
    /// Maximum delivery attempts (`None` = unlimited).
    pub max_deliver: Option<u32>,
    /// Maximum unacknowledged deliveries in flight.
    pub max_ack_pending: usize,
    /// Queue group the bound subscribers belong to.
    pub deliver_group: Option<String>,
}

/// Key-value bucket definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValueConfig {
    /// Bucket name.
    pub bucket: String,
    /// Replication factor.
    pub replicas: usize,
}

/// A value read from a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// Key.
    pub key: String,
    /// Raw value.
    pub value: Vec<u8>,
    /// Revision assigned by the bucket on the last write.
    pub revision: u64,
}

/// Settles a delivery.
pub trait DeliveryControl: Send + Sync {
    /// Acknowledge processing.
    fn ack(&self);
    /// Negative-acknowledge, asking for redelivery.
    fn nak(&self);
    /// Reply to a request delivery.
    fn respond(&self, _data: Vec<u8>) -> Result<(), BrokerError> {
        Err(BrokerError::NoReplySubject)
    }
}

/// Cloneable handle settling one delivery.
#[derive(Clone, Default)]
pub struct Acker {
    control: Option<Arc<dyn DeliveryControl>>,
}

impl Acker {
    /// Acknowledge. No-op for core deliveries.
    pub fn ack(&self) {
        if let Some(control) = &self.control {
            control.ack();
        }
    }

    /// Negative-acknowledge. No-op for core deliveries.
    pub fn nak(&self) {
        if let Some(control) = &self.control {
            control.nak();
        }
    }

    /// Reply to the requester.
    pub fn respond(&self, data: Vec<u8>) -> Result<(), BrokerError> {
        match &self.control {
            Some(control) => control.respond(data),
            None => Err(BrokerError::NoReplySubject),
        }
    }
}

/// A message handed to a subscriber.
pub struct Delivery {
    /// Subject the message was published on.
    pub subject: String,
    /// Raw payload.
    pub data: Vec<u8>,
    acker: Acker,
}

impl Delivery {
    /// Create a delivery settled through `control`.
    pub fn new(
        subject: impl Into<String>,
        data: Vec<u8>,
        control: Option<Arc<dyn DeliveryControl>>,
    ) -> Self {
        Self {
            subject: subject.into(),
            data,
            acker: Acker { control },
        }
    }

    /// Handle that can settle this delivery after it has been consumed.
    pub fn acker(&self) -> Acker {
        self.acker.clone()
    }

    /// Acknowledge.
    pub fn ack(&self) {
        self.acker.ack();
    }

    /// Negative-acknowledge.
    pub fn nak(&self) {
        self.acker.nak();
    }

    /// Reply to the requester.
    pub fn respond(&self, data: Vec<u8>) -> Result<(), BrokerError> {
        self.acker.respond(data)
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Stream of deliveries. Dropping it unsubscribes.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    /// Wrap a receiving channel.
    pub fn new(receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { receiver }
    }

    /// Next delivery, `None` once the broker side is gone.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

/// Versioned key-value bucket.
#[async_trait]
pub trait KeyValueBucket: Send + Sync {
    /// Bucket name.
    fn name(&self) -> &str;

    /// Read a key. Deleted keys read as `None`.
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, BrokerError>;

    /// Write unconditionally, returning the new revision.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, BrokerError>;

    /// Write only if the key is absent.
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64, BrokerError>;

    /// Write only if the current revision equals `last_revision`.
    async fn update(&self, key: &str, value: Vec<u8>, last_revision: u64)
    -> Result<u64, BrokerError>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), BrokerError>;

    /// All live keys.
    async fn keys(&self) -> Result<Vec<String>, BrokerError>;
}

/// Connection to the message broker, scoped to one account domain.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Domain of the connected account, if the server reports one.
    fn account_domain(&self) -> Option<String>;

    /// Core publish. Streams capturing the subject store it as well.
    async fn publish(&self, subject: &str, data: Vec<u8>) -> Result<(), BrokerError>;

    /// Publish that must be stored by a stream.
    async fn publish_persistent(&self, subject: &str, data: Vec<u8>)
    -> Result<PublishAck, BrokerError>;

    /// Core request/reply.
    async fn request(
        &self,
        subject: &str,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BrokerError>;

    /// Core subscription.
    async fn subscribe(&self, subject: &str) -> Result<Subscription, BrokerError>;

    /// Core subscription in a queue group; each message goes to one member.
    async fn queue_subscribe(&self, subject: &str, group: &str)
    -> Result<Subscription, BrokerError>;

    /// Names of streams in this domain.
    async fn stream_names(&self) -> Result<Vec<String>, BrokerError>;

    /// Create a stream.
    async fn add_stream(&self, config: StreamConfig) -> Result<(), BrokerError>;

    /// Names of durable consumers on a stream.
    async fn consumer_names(&self, stream: &str) -> Result<Vec<String>, BrokerError>;

    /// Create a durable consumer.
    async fn add_consumer(&self, stream: &str, config: ConsumerConfig) -> Result<(), BrokerError>;

    /// Start receiving from a durable consumer.
    async fn bind_consumer(&self, stream: &str, consumer: &str)
    -> Result<Subscription, BrokerError>;

    /// Open an existing bucket.
    async fn key_value(&self, bucket: &str) -> Result<Arc<dyn KeyValueBucket>, BrokerError>;

    /// Create a bucket.
    async fn create_key_value(
        &self,
        config: KeyValueConfig,
    ) -> Result<Arc<dyn KeyValueBucket>, BrokerError>;
}
