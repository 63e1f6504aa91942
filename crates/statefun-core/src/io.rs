// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Signal, request and egress delivery.
//!
//! | Target | Signal subject | Request subject |
//! |--------|----------------|-----------------|
//! | this domain | `$SI.<this>.signal.<this>.<type>.<id>` | `request.<this>.<type>.<id>` |
//! | other domain | `$SE.<this>.signal.<target>.<type>.<id>` (egress router) | `request.<target>.<type>.<id>` |
//! | shadow `<any>/<home>#<id>` | `$SI.<home>.signal.<home>.<type>.<home>/<id>` | `request.<home>.<type>.<home>/<id>` |
//!
//! When a shadow object is addressed, the caller ID is rewritten to
//! `<home>/<caller domain>#<caller id>` so the receiver can answer through
//! its own shadow of the caller. Setting `shadow_object.can_receive` in the
//! options delivers to the shadow ID itself.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::broker::{BrokerError, subject};
use crate::domain::{Domain, dlq_subject};
use crate::error::{Result, StatefunError};
use crate::function_type::{
    Address, Envelope, FunctionMessage, FunctionType, Refusal, RequestProvider, SignalProvider,
};
use crate::lock_unpoisoned as lock;
use crate::router::DeadLetter;
use crate::runtime::RuntimeCore;
use crate::trace::TraceContext;

/// Caller type used for messages entering from outside any function.
pub const INGRESS_CALLER_TYPENAME: &str = "ingress";

/// Options path that delivers to a shadow ID instead of its home object.
pub const SHADOW_OBJECT_CAN_RECEIVE: &str = "/shadow_object/can_receive";

fn shadow_can_receive(options: &Value) -> bool {
    options
        .pointer(SHADOW_OBJECT_CAN_RECEIVE)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Where a broker delivery goes and who it claims to come from.
#[derive(Debug, PartialEq, Eq)]
struct Route {
    subject: String,
    caller_id: String,
}

impl RuntimeCore {
    fn shadow_route(&self, caller: &Address, id: &str) -> Result<(String, String)> {
        let (home, base) = Domain::shadow_object_domain_and_id(id)?;
        let remote_id = Domain::create_object_id_with_domain(&home, &base, true);
        let caller_id = Domain::create_custom_shadow_id(
            &home,
            &self.domain().get_domain_from_object_id(&caller.id),
            Domain::id_without_domain(&caller.id),
        );
        Ok((remote_id, caller_id))
    }

    fn signal_route(&self, caller: &Address, typename: &str, id: &str, options: &Value) -> Result<Route> {
        let domain = self.domain();
        if !shadow_can_receive(options) && Domain::is_shadow_object(id) {
            let (remote_id, caller_id) = self.shadow_route(caller, id)?;
            let home = domain.get_domain_from_object_id(&remote_id);
            return Ok(Route {
                subject: subject::ingress(&home, &subject::signal(&home, typename, &remote_id)),
                caller_id,
            });
        }

        let target_domain = domain.get_domain_from_object_id(id);
        let signal = subject::signal(&target_domain, typename, id);
        let subject = if target_domain == domain.name() {
            subject::ingress(domain.name(), &signal)
        } else {
            subject::egress(domain.name(), &signal)
        };
        Ok(Route {
            subject,
            caller_id: caller.id.clone(),
        })
    }

    fn request_route(&self, caller: &Address, typename: &str, id: &str, options: &Value) -> Result<Route> {
        if !shadow_can_receive(options) && Domain::is_shadow_object(id) {
            let (remote_id, caller_id) = self.shadow_route(caller, id)?;
            let home = self.domain().get_domain_from_object_id(&remote_id);
            return Ok(Route {
                subject: subject::request(&home, typename, &remote_id),
                caller_id,
            });
        }
        Ok(Route {
            subject: subject::request(&self.domain().get_domain_from_object_id(id), typename, id),
            caller_id: caller.id.clone(),
        })
    }

    /// Local function type able to take `id` in-process.
    fn in_process_target(&self, typename: &str, id: &str) -> Result<&Arc<FunctionType>> {
        let id_domain = self.domain().get_domain_from_object_id(id);
        if id_domain != self.domain().name() {
            return Err(StatefunError::NotRegistered(format!("{typename}@{id_domain}")));
        }
        let function_type = self
            .function_type(typename)
            .ok_or_else(|| StatefunError::NotRegistered(typename.to_string()))?;
        if !function_type.is_active() {
            return Err(StatefunError::Inactive(typename.to_string()));
        }
        Ok(function_type)
    }

    /// Local registration of `typename`, when `id` lives in this domain.
    fn local_config_target(&self, typename: &str, id: &str) -> Option<&Arc<FunctionType>> {
        (self.domain().get_domain_from_object_id(id) == self.domain().name())
            .then(|| self.function_type(typename))
            .flatten()
    }

    /// Deliver a signal. Broker failures surface through the fatal hook, never
    /// here.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn signal_from(
        self: &Arc<Self>,
        provider: SignalProvider,
        caller: &Address,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
        trace: TraceContext,
    ) -> Result<()> {
        let in_process = match provider {
            SignalProvider::Broker => {
                if let Some(target) = self.local_config_target(typename, id)
                    && !target.config().allows_signal(SignalProvider::Broker)
                {
                    return Err(StatefunError::ProviderNotAllowed {
                        function_type: typename.to_string(),
                        provider: provider.label(),
                    });
                }
                None
            }
            SignalProvider::InProcess => {
                let target = self.in_process_target(typename, id)?;
                if !target.config().allows_signal(SignalProvider::InProcess) {
                    return Err(StatefunError::ProviderNotAllowed {
                        function_type: typename.to_string(),
                        provider: provider.label(),
                    });
                }
                Some(target.clone())
            }
            SignalProvider::Auto => {
                let deliverable = shadow_can_receive(&options) || !Domain::is_shadow_object(id);
                self.in_process_target(typename, id)
                    .ok()
                    .filter(|t| deliverable && t.config().allows_signal(SignalProvider::InProcess))
                    .cloned()
            }
        };

        match in_process {
            Some(target) => {
                self.signal_in_process(&target, caller, typename, id, payload, options, trace)
            }
            None => self.signal_via_broker(caller, typename, id, payload, options, trace),
        }
    }

    /// Hand a signal to a local type. A refusal is redirected to the broker
    /// when the target accepts broker signals, otherwise it is returned.
    #[allow(clippy::too_many_arguments)]
    fn signal_in_process(
        self: &Arc<Self>,
        target: &FunctionType,
        caller: &Address,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
        trace: TraceContext,
    ) -> Result<()> {
        if !target.config().allows_signal(SignalProvider::Broker) {
            let message = FunctionMessage::new(caller.clone(), payload, options).with_trace(trace);
            return target.send(id, message);
        }

        let fallback = {
            let runtime = self.clone();
            let caller = caller.clone();
            let typename = typename.to_string();
            let id = id.to_string();
            let payload = payload.clone();
            let options = options.clone();
            let trace = trace.clone();
            move |refusal: Refusal| {
                warn!(
                    function_type = %typename,
                    id = %id,
                    ?refusal,
                    "In-process signal refused, redirecting to broker"
                );
                if let Err(e) =
                    runtime.signal_via_broker(&caller, &typename, &id, payload, options, trace)
                {
                    runtime.fatal(e);
                }
            }
        };

        let message = FunctionMessage::new(caller.clone(), payload, options)
            .with_trace(trace)
            .with_refusal(fallback);
        // A refused message was already redirected.
        let _ = target.send(id, message);
        Ok(())
    }

    /// Publish a signal in the background.
    fn signal_via_broker(
        self: &Arc<Self>,
        caller: &Address,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
        trace: TraceContext,
    ) -> Result<()> {
        let route = self.signal_route(caller, typename, id, &options)?;
        let envelope = Envelope::new(
            &Address::new(&caller.typename, route.caller_id),
            payload,
            options,
            trace,
        );
        let data = serde_json::to_vec(&envelope)?;

        let runtime = self.clone();
        tokio::spawn(async move {
            debug!(subject = %route.subject, "Publishing signal");
            let broker = runtime.domain().broker();
            let stored = match broker.publish_persistent(&route.subject, data.clone()).await {
                Ok(_) => Ok(()),
                // Nobody ever provisioned the target type.
                Err(BrokerError::NoStreamResponse(_)) => {
                    runtime.dead_letter_signal(&route.subject, data).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = stored {
                runtime.fatal(StatefunError::ConsistencyBreach(format!(
                    "signal on '{}' was not stored: {e}",
                    route.subject
                )));
            }
        });
        Ok(())
    }

    /// Record a signal no stream captured on `dlq.<domain>`.
    async fn dead_letter_signal(
        &self,
        subject: &str,
        data: Vec<u8>,
    ) -> std::result::Result<(), BrokerError> {
        let domain = self.domain().name();
        warn!(subject = %subject, domain = %domain, "No stream for signal, dead-lettering");
        let record = DeadLetter {
            original_subject: subject.to_string(),
            stream: String::new(),
            domain: domain.to_string(),
            error: BrokerError::NoStreamResponse(subject.to_string()).to_string(),
            timestamp: Utc::now(),
            data,
        };
        let payload = serde_json::to_vec(&record).map_err(|e| BrokerError::Other(e.to_string()))?;
        self.domain()
            .broker()
            .publish_persistent(&dlq_subject(domain), payload)
            .await
            .map(|_| ())
    }

    /// Deliver a request and wait for its reply.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn request_from(
        self: &Arc<Self>,
        provider: RequestProvider,
        caller: &Address,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
        timeout: Option<Duration>,
        trace: TraceContext,
    ) -> Result<Value> {
        let timeout = timeout.unwrap_or(self.config().request_timeout);
        let provider = match provider {
            RequestProvider::Auto => {
                let deliverable = shadow_can_receive(&options) || !Domain::is_shadow_object(id);
                let local = self
                    .in_process_target(typename, id)
                    .is_ok_and(|t| t.config().allows_request(RequestProvider::InProcess));
                if deliverable && local {
                    RequestProvider::InProcess
                } else {
                    RequestProvider::Broker
                }
            }
            explicit => explicit,
        };

        if let Some(target) = self.local_config_target(typename, id)
            && !target.config().allows_request(provider)
        {
            return Err(StatefunError::ProviderNotAllowed {
                function_type: typename.to_string(),
                provider: provider.label(),
            });
        }

        match provider {
            RequestProvider::InProcess => {
                let target = self.in_process_target(typename, id)?;
                request_in_process(target, caller, id, payload, options, timeout, trace).await
            }
            _ => {
                self.request_via_broker(caller, typename, id, payload, options, timeout, trace)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn request_via_broker(
        &self,
        caller: &Address,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
        timeout: Duration,
        trace: TraceContext,
    ) -> Result<Value> {
        let route = self.request_route(caller, typename, id, &options)?;
        let envelope = Envelope::new(
            &Address::new(&caller.typename, route.caller_id),
            payload,
            options,
            trace,
        );
        let data = serde_json::to_vec(&envelope)?;

        match self
            .domain()
            .broker()
            .request(&route.subject, data, timeout)
            .await
        {
            Ok(reply) if reply.is_empty() => Err(StatefunError::RequestRefused {
                target: route.subject,
            }),
            Ok(reply) => Ok(serde_json::from_slice(&reply)?),
            Err(BrokerError::Timeout) => Err(StatefunError::RequestTimeout {
                target: route.subject,
                timeout,
            }),
            Err(BrokerError::NoResponders) => Err(StatefunError::RequestRefused {
                target: route.subject,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Publish `payload` on `egress.<type>.<id>` in the background.
    pub(crate) fn egress(&self, typename: &str, id: &str, payload: Value) -> Result<()> {
        let subject = subject::egress_out(typename, id);
        let data = serde_json::to_vec(&payload)?;
        let broker = self.domain().broker().clone();
        tokio::spawn(async move {
            if let Err(e) = broker.publish(&subject, data).await {
                warn!(subject = %subject, error = %e, "Failed to publish egress");
            }
        });
        Ok(())
    }

    /// Signal from outside any function.
    pub(crate) async fn ingress_signal(
        self: &Arc<Self>,
        provider: SignalProvider,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
    ) -> Result<()> {
        let id = self.domain().valid_object_id(id);
        self.signal_from(
            provider,
            &Address::new(INGRESS_CALLER_TYPENAME, "signal"),
            typename,
            &id,
            payload,
            options,
            TraceContext::root(),
        )
        .await
    }

    /// Request from outside any function.
    pub(crate) async fn ingress_request(
        self: &Arc<Self>,
        provider: RequestProvider,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = self.domain().valid_object_id(id);
        self.request_from(
            provider,
            &Address::new(INGRESS_CALLER_TYPENAME, "request"),
            typename,
            &id,
            payload,
            options,
            timeout,
            TraceContext::root(),
        )
        .await
    }
}

async fn request_in_process(
    target: &FunctionType,
    caller: &Address,
    id: &str,
    payload: Value,
    options: Value,
    timeout: Duration,
    trace: TraceContext,
) -> Result<Value> {
    let (sender, receiver) = oneshot::channel::<Option<Value>>();
    let sender = Arc::new(Mutex::new(Some(sender)));
    let reply_sender = sender.clone();

    let message = FunctionMessage::new(caller.clone(), payload, options)
        .with_trace(trace)
        .with_reply(move |value| {
            if let Some(sender) = lock(&reply_sender).take() {
                let _ = sender.send(Some(value));
            }
        })
        .with_refusal(move |_| {
            if let Some(sender) = lock(&sender).take() {
                let _ = sender.send(None);
            }
        });
    target.send(id, message)?;

    let target_name = format!("{}:{id}", target.name());
    match tokio::time::timeout(timeout, receiver).await {
        Ok(Ok(Some(value))) => Ok(value),
        Ok(Ok(None)) | Ok(Err(_)) => Err(StatefunError::RequestRefused {
            target: target_name,
        }),
        Err(_) => Err(StatefunError::RequestTimeout {
            target: target_name,
            timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shadow_can_receive() {
        assert!(shadow_can_receive(&json!({"shadow_object": {"can_receive": true}})));
        assert!(!shadow_can_receive(&json!({"shadow_object": {"can_receive": "yes"}})));
        assert!(!shadow_can_receive(&json!({})));
    }
}
