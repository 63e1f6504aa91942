// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain routers: move signals between the hub and a domain's function
//! streams.
//!
//! - The **ingress** router consumes `domain_ingress` (everything the hub holds
//!   for `signal.<domain>.>`) and republishes it as `$SI.<domain>.<subject>`.
//! - The **egress** router consumes `domain_egress` (`$SE.<domain>.>`). A
//!   signal whose source and target domains match goes straight to
//!   `$SI.<domain>.…`; any other is stripped back to `signal.<target>.…` and
//!   lands in the hub.
//!
//! A message that cannot be forwarded is recorded on `dlq.<domain>`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::subject::INGRESS_PREFIX;
use crate::broker::{Broker, ConsumerConfig, Delivery};
use crate::domain::{DOMAIN_EGRESS_STREAM, DOMAIN_INGRESS_STREAM, dlq_subject};
use crate::error::{Result, StatefunError};

/// Router consumers wait this long for an ack before redelivering.
pub const ROUTER_ACK_WAIT: Duration = Duration::from_millis(2000);

/// Unacknowledged messages a router may hold.
const ROUTER_MAX_ACK_PENDING: usize = 2;

/// Direction of a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterKind {
    /// Hub → domain.
    Ingress,
    /// Domain → hub or back into the domain.
    Egress,
}

impl RouterKind {
    fn stream(self) -> &'static str {
        match self {
            Self::Ingress => DOMAIN_INGRESS_STREAM,
            Self::Egress => DOMAIN_EGRESS_STREAM,
        }
    }
}

/// Dead-letter record published on `dlq.<domain>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Subject of the message that failed.
    pub original_subject: String,
    /// Stream it was consumed from, empty when no stream captured it.
    pub stream: String,
    /// Domain of the router.
    pub domain: String,
    /// Why it could not be forwarded.
    pub error: String,
    /// When it failed.
    pub timestamp: DateTime<Utc>,
    /// Original payload.
    pub data: Vec<u8>,
}

/// `signal.<d>.…` → `$SI.<d>.signal.<d>.…`
pub fn ingress_target(domain: &str, subject: &str) -> String {
    format!("{INGRESS_PREFIX}.{domain}.{subject}")
}

/// Target of a message consumed from `domain_egress`.
///
/// `$SE.<src>.signal.<dst>.…` goes to `$SI.<src>.signal.<dst>.…` when
/// `src == dst`, otherwise to `signal.<dst>.…`.
pub fn egress_target(subject: &str) -> Result<String> {
    let tokens: Vec<&str> = subject.split('.').collect();
    if tokens.len() < 5 {
        return Err(StatefunError::InvalidSubject {
            subject: subject.to_string(),
            reason: "egress subject needs at least 5 tokens",
        });
    }
    if tokens[1] == tokens[3] {
        let mut routed = tokens;
        routed[0] = INGRESS_PREFIX;
        Ok(routed.join("."))
    } else {
        Ok(tokens[2..].join("."))
    }
}

/// One router of a domain.
pub(crate) struct Router {
    kind: RouterKind,
    broker: Arc<dyn Broker>,
    domain: String,
}

impl Router {
    pub(crate) fn new(kind: RouterKind, broker: Arc<dyn Broker>, domain: &str) -> Self {
        Self {
            kind,
            broker,
            domain: domain.to_string(),
        }
    }

    fn consumer_name(&self) -> String {
        format!("{}-{}-consumer", self.kind.stream(), self.domain)
    }

    fn filter_subject(&self) -> String {
        match self.kind {
            RouterKind::Ingress => format!("signal.{}.>", self.domain),
            RouterKind::Egress => format!("$SE.{}.>", self.domain),
        }
    }

    /// Create the durable consumer unless it exists.
    pub(crate) async fn provision(&self) -> Result<()> {
        let stream = self.kind.stream();
        let name = self.consumer_name();
        if self.broker.consumer_names(stream).await?.contains(&name) {
            return Ok(());
        }
        debug!(stream, consumer = %name, "Creating router consumer");
        self.broker
            .add_consumer(
                stream,
                ConsumerConfig {
                    deliver_group: Some(format!("{name}-group")),
                    name,
                    filter_subject: Some(self.filter_subject()),
                    ack_wait: ROUTER_ACK_WAIT,
                    max_deliver: None,
                    max_ack_pending: ROUTER_MAX_ACK_PENDING,
                },
            )
            .await?;
        Ok(())
    }

    /// Bind to the consumer and forward until `cancel` fires.
    pub(crate) async fn spawn(self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let mut subscription = self
            .broker
            .bind_consumer(self.kind.stream(), &self.consumer_name())
            .await?;

        Ok(tokio::spawn(async move {
            info!(domain = %self.domain, router = ?self.kind, "Router started");
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    delivery = subscription.next() => {
                        let Some(delivery) = delivery else {
                            warn!(domain = %self.domain, router = ?self.kind, "Router subscription closed");
                            break;
                        };
                        self.forward(delivery).await;
                    }
                }
            }
            info!(domain = %self.domain, router = ?self.kind, "Router stopped");
        }))
    }

    async fn forward(&self, delivery: Delivery) {
        let target = match self.kind {
            RouterKind::Ingress => Ok(ingress_target(&self.domain, &delivery.subject)),
            RouterKind::Egress => egress_target(&delivery.subject),
        };
        let target = match target {
            Ok(target) => target,
            Err(e) => {
                error!(subject = %delivery.subject, error = %e, "Cannot route message");
                delivery.nak();
                return;
            }
        };

        match self.broker.publish_persistent(&target, delivery.data.clone()).await {
            Ok(_) => delivery.ack(),
            Err(e) => self.dead_letter(delivery, &target, e.to_string()).await,
        }
    }

    async fn dead_letter(&self, delivery: Delivery, target: &str, reason: String) {
        warn!(
            domain = %self.domain,
            subject = %delivery.subject,
            target = %target,
            error = %reason,
            "Failed to forward message"
        );

        let record = DeadLetter {
            original_subject: delivery.subject.clone(),
            stream: self.kind.stream().to_string(),
            domain: self.domain.clone(),
            error: reason,
            timestamp: Utc::now(),
            data: delivery.data.clone(),
        };
        let dlq_published = match serde_json::to_vec(&record) {
            Ok(payload) => self
                .broker
                .publish_persistent(&dlq_subject(&self.domain), payload)
                .await
                .is_ok(),
            Err(_) => false,
        };

        if dlq_published && self.kind == RouterKind::Ingress {
            delivery.ack();
            return;
        }

        // Put it back at the end of the line.
        match self
            .broker
            .publish_persistent(&delivery.subject, delivery.data.clone())
            .await
        {
            Ok(_) => delivery.ack(),
            Err(e) => {
                error!(subject = %delivery.subject, error = %e, "Failed to requeue message");
                delivery.nak();
            }
        }
    }
}
