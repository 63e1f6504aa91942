// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trace context carried along signal and request chains.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::broker::{Broker, subject};

/// Position of one hop in a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// Shared by every hop of the chain.
    pub trace_id: String,
    /// This hop.
    pub span_id: String,
    /// Previous hop, `None` at the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    /// When this hop started.
    pub start_time: DateTime<Utc>,
}

impl TraceContext {
    /// Start a new trace.
    pub fn root() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: new_span_id(),
            parent_span_id: None,
            start_time: Utc::now(),
        }
    }

    /// Next hop of this trace.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(self.span_id.clone()),
            start_time: Utc::now(),
        }
    }

    /// Continue an incoming trace, or start one.
    pub fn continue_from(parent: Option<&TraceContext>) -> Self {
        parent.map_or_else(Self::root, Self::child)
    }
}

fn new_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Lifecycle event of one handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Trace of the invocation.
    #[serde(flatten)]
    pub context: TraceContext,
    /// Function type handling the message.
    pub function_type: String,
    /// Object ID handling the message.
    pub id: String,
    /// `started` or `finished`.
    pub event: String,
    /// When the event happened.
    pub at: DateTime<Utc>,
}

/// Publish `event` on `trace.<domain>.events.<trace_id>`. Best effort.
pub(crate) async fn publish_event(broker: &dyn Broker, domain: &str, event: &TraceEvent) {
    let subject = subject::trace_events(domain, &event.context.trace_id);
    let data = match serde_json::to_vec(event) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "Failed to encode trace event");
            return;
        }
    };
    if let Err(e) = broker.publish(&subject, data).await {
        warn!(subject = %subject, error = %e, "Failed to publish trace event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryCluster;

    #[test]
    fn test_child_keeps_trace_id() {
        let root = TraceContext::root();
        assert!(root.parent_span_id.is_none());

        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_ne!(child.span_id, root.span_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));

        let continued = TraceContext::continue_from(Some(&child));
        assert_eq!(continued.parent_span_id, Some(child.span_id.clone()));
        assert!(TraceContext::continue_from(None).parent_span_id.is_none());
    }

    #[test]
    fn test_json_shape() {
        let root = TraceContext::root();
        let value = serde_json::to_value(&root).unwrap();
        assert!(value.get("trace_id").is_some());
        assert!(value.get("parent_span_id").is_none());

        let back: TraceContext = serde_json::from_value(value).unwrap();
        assert_eq!(back, root);
    }

    #[tokio::test]
    async fn test_publish_event() {
        let cluster = MemoryCluster::new();
        let broker = cluster.connect("hub");
        let mut sub = broker.subscribe("trace.hub.events.*").await.unwrap();

        let event = TraceEvent {
            context: TraceContext::root(),
            function_type: "echo".to_string(),
            id: "a".to_string(),
            event: "started".to_string(),
            at: Utc::now(),
        };
        publish_event(broker.as_ref(), "hub", &event).await;

        let delivery = sub.next().await.unwrap();
        assert_eq!(
            delivery.subject,
            format!("trace.hub.events.{}", event.context.trace_id)
        );
        let decoded: serde_json::Value = serde_json::from_slice(&delivery.data).unwrap();
        assert_eq!(decoded["event"], "started");
    }
}
