// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker sources feeding a function type.
//!
//! Signals come from a durable queue consumer on the type's stream and are
//! acked only once handled. Requests come from a core queue subscription on
//! `request.<domain>.<type>.*` and are answered on the reply subject; an empty
//! reply tells the requester the message was refused.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Envelope, FunctionType, Refusal};
use crate::broker::{ConsumerConfig, Delivery, subject};
use crate::error::Result;
use crate::runtime::RuntimeCore;

/// `<domain>-<type without dots>`
pub(crate) fn consumer_name(domain: &str, typename: &str) -> String {
    format!("{}-{}", domain, typename.replace('.', ""))
}

/// Object ID of a delivery: the last subject token.
fn id_from_subject(subject: &str) -> &str {
    subject.rsplit('.').next().unwrap_or(subject)
}

fn decode(function_type: &FunctionType, delivery: &Delivery) -> Option<Envelope> {
    match serde_json::from_slice::<Envelope>(&delivery.data) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            error!(
                function_type = %function_type.name(),
                subject = %delivery.subject,
                error = %e,
                "Message is not a valid envelope"
            );
            None
        }
    }
}

pub(crate) async fn spawn_signal_source(
    function_type: Arc<FunctionType>,
    runtime: &RuntimeCore,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let broker = runtime.domain().broker().clone();
    let domain = runtime.domain().name();
    let stream = function_type.stream_name(domain);
    let name = consumer_name(domain, function_type.name());

    if !broker.consumer_names(&stream).await?.contains(&name) {
        debug!(stream = %stream, consumer = %name, "Creating signal consumer");
        broker
            .add_consumer(
                &stream,
                ConsumerConfig {
                    deliver_group: Some(format!("{name}-group")),
                    name: name.clone(),
                    filter_subject: Some(function_type.signal_subject(domain)),
                    ack_wait: function_type.config().ack_wait,
                    max_deliver: function_type.config().max_deliver,
                    max_ack_pending: function_type.tokens().capacity(),
                },
            )
            .await?;
    }
    let mut subscription = broker.bind_consumer(&stream, &name).await?;

    Ok(tokio::spawn(async move {
        info!(function_type = %function_type.name(), consumer = %name, "Signal source started");
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                delivery = subscription.next() => {
                    let Some(delivery) = delivery else {
                        warn!(function_type = %function_type.name(), "Signal subscription closed");
                        break;
                    };
                    let Some(envelope) = decode(&function_type, &delivery) else {
                        // Redelivery cannot fix a malformed payload.
                        delivery.ack();
                        continue;
                    };

                    let id = id_from_subject(&delivery.subject).to_string();
                    let ack = delivery.acker();
                    let refusal = delivery.acker();
                    let message = envelope
                        .into_message()
                        .with_ack(move |ok| if ok { ack.ack() } else { ack.nak() })
                        .with_refusal(move |refusal_kind| match refusal_kind {
                            Refusal::Final => refusal.ack(),
                            Refusal::Redeliverable => refusal.nak(),
                        });
                    // Refusals are settled through the callback.
                    let _ = function_type.send(&id, message);
                }
            }
        }
        info!(function_type = %function_type.name(), "Signal source stopped");
    }))
}

pub(crate) async fn spawn_request_source(
    function_type: Arc<FunctionType>,
    runtime: &RuntimeCore,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let broker = runtime.domain().broker().clone();
    let domain = runtime.domain().name();
    let filter = subject::request(domain, function_type.name(), "*");
    let group = format!("{}-requests", consumer_name(domain, function_type.name()));
    let mut subscription = broker.queue_subscribe(&filter, &group).await?;

    Ok(tokio::spawn(async move {
        info!(function_type = %function_type.name(), subject = %filter, "Request source started");
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                delivery = subscription.next() => {
                    let Some(delivery) = delivery else {
                        warn!(function_type = %function_type.name(), "Request subscription closed");
                        break;
                    };
                    let Some(envelope) = decode(&function_type, &delivery) else {
                        if let Err(e) = delivery.respond(Vec::new()) {
                            warn!(error = %e, "Failed to refuse malformed request");
                        }
                        continue;
                    };

                    let id = id_from_subject(&delivery.subject).to_string();
                    let reply = delivery.acker();
                    let refusal = delivery.acker();
                    let message = envelope
                        .into_message()
                        .with_reply(move |value| {
                            let result = serde_json::to_vec(&value)
                                .map_err(|e| e.to_string())
                                .and_then(|data| reply.respond(data).map_err(|e| e.to_string()));
                            if let Err(e) = result {
                                warn!(error = %e, "Failed to send reply");
                            }
                        })
                        .with_refusal(move |_| {
                            if let Err(e) = refusal.respond(Vec::new()) {
                                warn!(error = %e, "Failed to send refusal");
                            }
                        });
                    let _ = function_type.send(&id, message);
                }
            }
        }
        info!(function_type = %function_type.name(), "Request source stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_name() {
        assert_eq!(consumer_name("leaf", "app.counter.v1"), "leaf-appcounterv1");
    }

    #[test]
    fn test_id_from_subject() {
        assert_eq!(id_from_subject("$SI.a.signal.a.app.counter.obj-1"), "obj-1");
        assert_eq!(id_from_subject("request.a.t.x"), "x");
        assert_eq!(id_from_subject("plain"), "plain");
    }
}
