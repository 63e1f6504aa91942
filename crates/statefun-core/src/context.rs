// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! What a handler sees of one invocation.
//!
//! A [`ContextProcessor`] is bound to one `(function type, ID)` pair and one
//! message. Context reads and writes need no extra locking: only the worker
//! holding the ID runs a handler for it.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tracing::debug;

use crate::context_store::{function_context_key, object_context_key};
use crate::domain::Domain;
use crate::error::{Result, StatefunError};
use crate::executor::SharedExecutor;
use crate::function_type::{
    Address, FunctionMessage, FunctionType, ReplyCallback, RequestProvider, SignalProvider,
    merge_json,
};
use crate::lock_unpoisoned as lock;
use crate::runtime::RuntimeCore;
use crate::trace::TraceContext;

/// Reply handle of a request invocation.
///
/// Unless cancelled or already used, `{}` is sent when the handler returns.
#[derive(Clone)]
pub struct SyncReply {
    state: Arc<Mutex<ReplyState>>,
}

struct ReplyState {
    callback: Option<ReplyCallback>,
    cancel_default: bool,
}

impl SyncReply {
    fn new(callback: ReplyCallback) -> Self {
        Self {
            state: Arc::new(Mutex::new(ReplyState {
                callback: Some(callback),
                cancel_default: false,
            })),
        }
    }

    /// Send `value` as the reply. Returns `false` if a reply was already sent.
    pub fn with(&self, value: Value) -> bool {
        let callback = lock(&self.state).callback.take();
        match callback {
            Some(callback) => {
                callback(value);
                true
            }
            None => false,
        }
    }

    /// Do not send the default `{}` when the handler returns.
    pub fn cancel_default_reply(&self) {
        lock(&self.state).cancel_default = true;
    }

    /// Take the reply callback to answer later, outside this invocation.
    pub fn override_request_callback(&self) -> Option<ReplyCallback> {
        let mut state = lock(&self.state);
        state.cancel_default = true;
        state.callback.take()
    }

    /// Whether no reply has been sent yet.
    pub fn is_pending(&self) -> bool {
        lock(&self.state).callback.is_some()
    }

    fn finish(&self) {
        let callback = {
            let mut state = lock(&self.state);
            if state.cancel_default {
                return;
            }
            state.callback.take()
        };
        if let Some(callback) = callback {
            callback(json!({}));
        }
    }
}

impl fmt::Debug for SyncReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncReply")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Handle passed to a function type's handler.
#[derive(Clone)]
pub struct ContextProcessor {
    inner: Arc<Invocation>,
}

struct Invocation {
    runtime: Arc<RuntimeCore>,
    function_type: Arc<FunctionType>,
    id: String,
    caller: Address,
    payload: Value,
    options: Value,
    trace: TraceContext,
    reply: Option<SyncReply>,
    executor: Option<SharedExecutor>,
}

impl ContextProcessor {
    pub(crate) fn new(
        runtime: Arc<RuntimeCore>,
        function_type: Arc<FunctionType>,
        id: String,
        mut message: FunctionMessage,
        trace: TraceContext,
        executor: Option<SharedExecutor>,
    ) -> Self {
        let mut options = function_type.config().options.clone();
        merge_json(&mut options, &message.options);
        let reply = message.take_reply().map(SyncReply::new);

        Self {
            inner: Arc::new(Invocation {
                runtime,
                function_type,
                id,
                caller: message.caller,
                payload: message.payload,
                options,
                trace,
                reply,
                executor,
            }),
        }
    }

    /// Send the default reply if still due.
    pub(crate) fn finish(&self) {
        if let Some(reply) = &self.inner.reply {
            reply.finish();
        }
    }

    /// Address of the function being invoked.
    pub fn self_address(&self) -> Address {
        Address::new(self.inner.function_type.name(), &self.inner.id)
    }

    /// Object ID being invoked.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Function type name being invoked.
    pub fn function_type(&self) -> &str {
        self.inner.function_type.name()
    }

    /// Sender of the message.
    pub fn caller(&self) -> &Address {
        &self.inner.caller
    }

    /// Message payload.
    pub fn payload(&self) -> &Value {
        &self.inner.payload
    }

    /// Message options merged over the type's defaults.
    pub fn options(&self) -> &Value {
        &self.inner.options
    }

    /// Trace span of this invocation.
    pub fn trace(&self) -> &TraceContext {
        &self.inner.trace
    }

    /// Domain of the runtime.
    pub fn domain(&self) -> &Domain {
        self.inner.runtime.domain()
    }

    /// Reply handle, `None` for signals.
    pub fn reply(&self) -> Option<&SyncReply> {
        self.inner.reply.as_ref()
    }

    /// Script executor of this ID, if the type has one.
    pub fn executor(&self) -> Option<&SharedExecutor> {
        self.inner.executor.as_ref()
    }

    fn object_lock_key(&self, object_id: &str) -> (String, String) {
        (self.function_key(), object_id.to_string())
    }

    fn function_key(&self) -> String {
        function_context_key(self.inner.function_type.name(), &self.inner.id)
    }

    /// Function context, `{}` when absent.
    pub async fn get_function_context(&self) -> Result<Value> {
        let store = self.inner.runtime.domain().context_store()?;
        Ok(store.get(&self.function_key()).await?.unwrap_or_else(|| json!({})))
    }

    /// Replace the function context. `Value::Null` deletes it.
    pub async fn set_function_context(&self, value: Value) -> Result<()> {
        let store = self.inner.runtime.domain().context_store()?;
        store
            .set(&self.function_key(), (!value.is_null()).then_some(value))
            .await
    }

    /// Expire the function context `after` from now.
    pub async fn set_context_expiration_after(&self, after: Duration) -> Result<()> {
        let store = self.inner.runtime.domain().context_store()?;
        store.set_expiration_after(&self.function_key(), after).await
    }

    /// Object context shared by every type acting on this ID, `{}` when absent.
    pub async fn get_object_context(&self) -> Result<Value> {
        let store = self.inner.runtime.domain().context_store()?;
        Ok(store
            .get(&object_context_key(&self.inner.id))
            .await?
            .unwrap_or_else(|| json!({})))
    }

    /// Replace the object context. `Value::Null` deletes it.
    pub async fn set_object_context(&self, value: Value) -> Result<()> {
        let store = self.inner.runtime.domain().context_store()?;
        store
            .set(&object_context_key(&self.inner.id), (!value.is_null()).then_some(value))
            .await
    }

    /// Signal `typename:id`. Never blocks on the target.
    pub async fn signal(
        &self,
        provider: SignalProvider,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
    ) -> Result<()> {
        self.inner
            .runtime
            .signal_from(
                provider,
                &self.self_address(),
                typename,
                id,
                payload,
                options,
                self.inner.trace.child(),
            )
            .await
    }

    /// Request `typename:id` and wait for the reply. `timeout` defaults to the
    /// runtime's request timeout.
    pub async fn request(
        &self,
        provider: RequestProvider,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.inner
            .runtime
            .request_from(
                provider,
                &self.self_address(),
                typename,
                id,
                payload,
                options,
                timeout,
                self.inner.trace.child(),
            )
            .await
    }

    /// Emit `payload` on `egress.<type>.<custom_id or id>`.
    pub fn egress(&self, payload: Value, custom_id: Option<&str>) -> Result<()> {
        self.inner.runtime.egress(
            self.inner.function_type.name(),
            custom_id.unwrap_or(&self.inner.id),
            payload,
        )
    }

    /// Take the cluster-wide mutex of `object_id` for this type's mutex lifetime.
    pub async fn object_mutex_lock(&self, object_id: &str, error_on_locked: bool) -> Result<()> {
        let lifetime = self.inner.function_type.config().mutex_lifetime;
        let revision = self
            .inner
            .runtime
            .domain()
            .kv_mutex()?
            .lock(object_id, lifetime, error_on_locked)
            .await?;
        self.inner
            .runtime
            .object_locks()
            .insert(self.object_lock_key(object_id), revision);
        debug!(object_id = %object_id, revision, "Object mutex locked");
        Ok(())
    }

    /// Release a mutex taken with [`object_mutex_lock`](Self::object_mutex_lock).
    ///
    /// Only the `(type, id)` that took the mutex can release it; anyone else
    /// gets [`StatefunError::AlreadyUnlocked`].
    pub async fn object_mutex_unlock(&self, object_id: &str) -> Result<()> {
        let key = self.object_lock_key(object_id);
        let Some((_, revision)) = self.inner.runtime.object_locks().remove(&key) else {
            return Err(StatefunError::AlreadyUnlocked {
                key: object_id.to_string(),
            });
        };
        self.inner
            .runtime
            .domain()
            .kv_mutex()?
            .unlock(object_id, revision)
            .await
    }
}

impl fmt::Debug for ContextProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextProcessor")
            .field("function_type", &self.function_type())
            .field("id", &self.inner.id)
            .field("caller", &self.inner.caller)
            .finish()
    }
}
