// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messages handed to a function type.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::trace::TraceContext;

/// Address of one stateful function instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Address {
    /// Function type name.
    pub typename: String,
    /// Object ID.
    pub id: String,
}

impl Address {
    /// Build an address.
    pub fn new(typename: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            typename: typename.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.typename, self.id)
    }
}

/// Why a message was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// Try again later, capacity exists.
    Redeliverable,
    /// Do not retry.
    Final,
}

/// Wire envelope of signals and requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Envelope {
    #[serde(default)]
    pub caller_typename: String,
    #[serde(default)]
    pub caller_id: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
    #[serde(default = "empty_object")]
    pub options: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

fn empty_object() -> Value {
    json!({})
}

impl Envelope {
    pub(crate) fn new(caller: &Address, payload: Value, options: Value, trace: TraceContext) -> Self {
        Self {
            caller_typename: caller.typename.clone(),
            caller_id: caller.id.clone(),
            payload,
            options,
            trace: Some(trace),
        }
    }

    /// Non-object payloads and options read as `{}`.
    pub(crate) fn into_message(self) -> FunctionMessage {
        let payload = if self.payload.is_object() {
            self.payload
        } else {
            empty_object()
        };
        let options = if self.options.is_object() {
            self.options
        } else {
            empty_object()
        };
        let mut message = FunctionMessage::new(
            Address::new(self.caller_typename, self.caller_id),
            payload,
            options,
        );
        message.trace = self.trace;
        message
    }
}

/// Settles a broker delivery once the handler has run: `true` acks, `false` naks.
pub type AckCallback = Box<dyn FnOnce(bool) + Send>;
/// Tells the sender the message was not accepted.
pub type RefusalCallback = Box<dyn FnOnce(Refusal) + Send>;
/// Carries a request's reply back to the requester.
pub type ReplyCallback = Box<dyn FnOnce(Value) + Send>;

/// One message for one ID, with the callbacks of the transport it came on.
pub struct FunctionMessage {
    /// Sender.
    pub caller: Address,
    /// Payload.
    pub payload: Value,
    /// Options, merged over the function type's defaults before handling.
    pub options: Value,
    /// Incoming trace, if any.
    pub trace: Option<TraceContext>,
    ack: Option<AckCallback>,
    refusal: Option<RefusalCallback>,
    reply: Option<ReplyCallback>,
}

impl FunctionMessage {
    /// A message without callbacks.
    pub fn new(caller: Address, payload: Value, options: Value) -> Self {
        Self {
            caller,
            payload,
            options,
            trace: None,
            ack: None,
            refusal: None,
            reply: None,
        }
    }

    /// Attach an acknowledgement callback.
    pub fn with_ack(mut self, ack: impl FnOnce(bool) + Send + 'static) -> Self {
        self.ack = Some(Box::new(ack));
        self
    }

    /// Attach a refusal callback.
    pub fn with_refusal(mut self, refusal: impl FnOnce(Refusal) + Send + 'static) -> Self {
        self.refusal = Some(Box::new(refusal));
        self
    }

    /// Attach a reply callback, making this a request.
    pub fn with_reply(mut self, reply: impl FnOnce(Value) + Send + 'static) -> Self {
        self.reply = Some(Box::new(reply));
        self
    }

    /// Attach a trace.
    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Whether a reply is expected.
    pub fn is_request(&self) -> bool {
        self.reply.is_some()
    }

    /// Refuse the message, consuming it.
    pub fn refuse(mut self, refusal: Refusal) {
        if let Some(callback) = self.refusal.take() {
            callback(refusal);
        }
    }

    pub(crate) fn take_ack(&mut self) -> Option<AckCallback> {
        self.ack.take()
    }

    pub(crate) fn take_reply(&mut self) -> Option<ReplyCallback> {
        self.reply.take()
    }
}

impl fmt::Debug for FunctionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionMessage")
            .field("caller", &self.caller)
            .field("request", &self.reply.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_envelope_defaults() {
        let envelope: Envelope = serde_json::from_str(r#"{"caller_id": "a", "payload": 5}"#).unwrap();
        let message = envelope.into_message();
        assert_eq!(message.caller, Address::new("", "a"));
        assert_eq!(message.payload, json!({}));
        assert_eq!(message.options, json!({}));
        assert!(message.trace.is_none());
    }

    #[test]
    fn test_envelope_wire_names() {
        let envelope = Envelope::new(
            &Address::new("ingress", "signal"),
            json!({"v": 1}),
            json!({}),
            TraceContext::root(),
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["caller_typename"], "ingress");
        assert_eq!(value["caller_id"], "signal");
        assert_eq!(value["payload"], json!({"v": 1}));
        assert!(value["trace"]["trace_id"].is_string());
    }

    #[test]
    fn test_refuse_invokes_callback_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let message = FunctionMessage::new(Address::default(), json!({}), json!({})).with_refusal({
            let seen = seen.clone();
            move |refusal| seen.lock().unwrap().push(refusal)
        });
        assert!(!message.is_request());
        message.refuse(Refusal::Final);
        assert_eq!(*seen.lock().unwrap(), vec![Refusal::Final]);
    }
}
