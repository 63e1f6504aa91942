// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function types: registration, admission and per-ID ordered dispatch.
//!
//! Every message goes through the same path whatever transport brought it:
//!
//! ```text
//! send(id, msg)
//!   ├─ token bucket exhausted ──► refuse(Final), NoTokensLeft
//!   ├─ per-ID queue full ───────► refuse(Redeliverable), QueueFull
//!   └─ enqueue, wake manager
//!
//! manager
//!   └─ while the pool has room: pick the longest queue whose ID is not
//!      running, lock the ID, pop one message, submit it to the pool
//! ```
//!
//! The local ID lock is taken by the manager and released only when the
//! invocation finishes, so two messages of one ID never run at once and run in
//! enqueue order.

mod config;
mod message;
pub(crate) mod sources;

pub use config::{FunctionTypeConfig, PoolSizing, RequestProvider, SignalProvider};
pub(crate) use config::merge_json;
pub use message::{
    AckCallback, Address, FunctionMessage, Refusal, RefusalCallback, ReplyCallback,
};
pub(crate) use message::Envelope;

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{StreamConfig, subject};
use crate::context::ContextProcessor;
use crate::context_store::function_context_key;
use crate::error::{Result, StatefunError};
use crate::executor::{ExecutorFactory, SharedExecutor};
use crate::key_mutex::{KeyGuard, KeyMutex};
use crate::lock_unpoisoned as lock;
use crate::runtime::RuntimeCore;
use crate::scheduler::WorkerPool;
use crate::token_bucket::TokenBucket;
use crate::trace::{TraceContext, TraceEvent, publish_event};

/// Logic of a function type.
///
/// Implemented for any `Fn(ContextProcessor) -> impl Future<Output = ()>`.
pub trait Handler: Send + Sync + 'static {
    /// Handle one message.
    fn call(&self, ctx: ContextProcessor) -> BoxFuture<'static, ()>;
}

impl<F, Fut> Handler for F
where
    F: Fn(ContextProcessor) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, ctx: ContextProcessor) -> BoxFuture<'static, ()> {
        Box::pin(self(ctx))
    }
}

/// Everything needed to register a function type.
pub struct FunctionTypeDefinition {
    pub(crate) name: String,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) config: FunctionTypeConfig,
    pub(crate) executor_factory: Option<ExecutorFactory>,
}

impl FunctionTypeDefinition {
    /// Define `name` handled by `handler`.
    pub fn new(name: impl Into<String>, handler: impl Handler, config: FunctionTypeConfig) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            config,
            executor_factory: None,
        }
    }

    /// Give every ID of this type a script executor.
    pub fn with_executor(mut self, factory: ExecutorFactory) -> Self {
        self.executor_factory = Some(factory);
        self
    }

    /// Type name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Per-ID state. Created on the first message, collected once idle.
pub(crate) struct Instance {
    queue: Mutex<VecDeque<FunctionMessage>>,
    // Guarded by `queue`: popped but not finished.
    in_flight: AtomicUsize,
    last_activity: Mutex<Instant>,
    executor: Option<SharedExecutor>,
}

impl Instance {
    fn new(executor: Option<SharedExecutor>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            in_flight: AtomicUsize::new(0),
            last_activity: Mutex::new(Instant::now()),
            executor,
        }
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    fn push(&self, message: FunctionMessage, capacity: usize) -> std::result::Result<(), FunctionMessage> {
        let mut queue = lock(&self.queue);
        if queue.len() >= capacity {
            return Err(message);
        }
        queue.push_back(message);
        Ok(())
    }

    fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    fn pop(&self) -> Option<FunctionMessage> {
        let mut queue = lock(&self.queue);
        let message = queue.pop_front()?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(message)
    }

    fn is_idle_for(&self, ttl: Duration) -> bool {
        let queue = lock(&self.queue);
        queue.is_empty()
            && self.in_flight.load(Ordering::SeqCst) == 0
            && lock(&self.last_activity).elapsed() >= ttl
    }
}

/// Held by a running invocation. Dropping it frees the ID and the token, then
/// wakes the manager.
struct TaskPermit {
    function_type: Arc<FunctionType>,
    instance: Arc<Instance>,
    guard: Option<KeyGuard>,
}

impl Drop for TaskPermit {
    fn drop(&mut self) {
        self.instance.touch();
        self.instance.in_flight.fetch_sub(1, Ordering::SeqCst);
        // The ID must be free before the manager looks again.
        drop(self.guard.take());
        self.function_type.tokens.release();
        self.function_type.notify.notify_one();
    }
}

struct Activation {
    cancel: CancellationToken,
    sources: Vec<JoinHandle<()>>,
}

/// A registered function type.
pub struct FunctionType {
    name: String,
    config: FunctionTypeConfig,
    handler: Arc<dyn Handler>,
    executor_factory: Option<ExecutorFactory>,
    runtime: Weak<RuntimeCore>,
    pool: WorkerPool,
    tokens: TokenBucket,
    instances: DashMap<String, Arc<Instance>>,
    id_mutex: KeyMutex,
    notify: Notify,
    active: AtomicBool,
    activation: Mutex<Option<Activation>>,
}

impl FunctionType {
    pub(crate) fn new(definition: FunctionTypeDefinition, runtime: Weak<RuntimeCore>) -> Result<Self> {
        let pool_config = definition
            .config
            .pool
            .resolve()?
            .normalized();
        let tokens = TokenBucket::new(pool_config.max_workers + definition.config.queue_len);
        let pool = WorkerPool::new(definition.name.clone(), pool_config);

        Ok(Self {
            name: definition.name,
            config: definition.config,
            handler: definition.handler,
            executor_factory: definition.executor_factory,
            runtime,
            pool,
            tokens,
            instances: DashMap::new(),
            id_mutex: KeyMutex::new(),
            notify: Notify::new(),
            active: AtomicBool::new(false),
            activation: Mutex::new(None),
        })
    }

    /// Type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration.
    pub fn config(&self) -> &FunctionTypeConfig {
        &self.config
    }

    /// Worker pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Admission tokens.
    pub fn tokens(&self) -> &TokenBucket {
        &self.tokens
    }

    /// IDs with live state.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Whether this type's sources are running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stream holding this type's signals.
    pub(crate) fn stream_name(&self, domain: &str) -> String {
        format!("sf_{}_{}", domain, self.name.replace('.', "_"))
    }

    /// Subject filter of this type's signals.
    pub(crate) fn signal_subject(&self, domain: &str) -> String {
        subject::ingress(domain, &subject::signal(domain, &self.name, "*"))
    }

    /// Admit `message` for `id`. Never blocks.
    ///
    /// A refused message has its refusal callback invoked before this returns.
    pub fn send(&self, id: &str, message: FunctionMessage) -> Result<()> {
        if !self.tokens.try_acquire() {
            debug!(function_type = %self.name, id = %id, "No tokens left");
            message.refuse(Refusal::Final);
            return Err(StatefunError::NoTokensLeft {
                function_type: self.name.clone(),
            });
        }

        let pushed = {
            // Pushing under the entry guard keeps the collector from removing
            // the instance in between.
            let instance = self
                .instances
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Instance::new(self.create_executor(id))));
            instance.push(message, self.config.queue_len)
        };

        if let Err(message) = pushed {
            self.tokens.release();
            debug!(function_type = %self.name, id = %id, "Per-ID queue full");
            message.refuse(Refusal::Redeliverable);
            return Err(StatefunError::QueueFull {
                function_type: self.name.clone(),
                id: id.to_string(),
            });
        }

        self.notify.notify_one();
        Ok(())
    }

    fn create_executor(&self, id: &str) -> Option<SharedExecutor> {
        let factory = self.executor_factory.as_ref()?;
        let executor = factory.create();
        if let Some(e) = executor.build_error() {
            warn!(function_type = %self.name, id = %id, error = %e, "Script executor failed to build");
        }
        Some(Arc::new(tokio::sync::Mutex::new(executor)))
    }

    /// Run the dispatch loop until `cancel` fires.
    pub(crate) fn spawn_manager(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let function_type = self.clone();
        tokio::spawn(async move {
            debug!(function_type = %function_type.name, "Dispatch manager started");
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    _ = function_type.notify.notified() => function_type.dispatch(),
                }
            }
            debug!(function_type = %function_type.name, "Dispatch manager stopped");
        })
    }

    fn dispatch(self: &Arc<Self>) {
        while self.pool.free_slots() > 0 {
            let Some((id, instance)) = self.longest_ready_queue() else {
                return;
            };
            let Some(guard) = self.id_mutex.try_lock(&id) else {
                return;
            };
            let Some(message) = instance.pop() else {
                continue;
            };

            let permit = TaskPermit {
                function_type: self.clone(),
                instance: instance.clone(),
                guard: Some(guard),
            };
            let task = self.clone().invoke(id, instance, message, permit).boxed();
            if let Err(e) = self.pool.submit(task) {
                warn!(function_type = %self.name, error = %e, "Failed to submit invocation");
                return;
            }
        }
    }

    /// Longest non-empty queue whose ID is not running. First wins ties.
    fn longest_ready_queue(&self) -> Option<(String, Arc<Instance>)> {
        let mut best: Option<(String, Arc<Instance>, usize)> = None;
        for entry in self.instances.iter() {
            let pending = entry.value().pending();
            if pending == 0 || self.id_mutex.is_locked(entry.key()) {
                continue;
            }
            if best.as_ref().is_none_or(|(_, _, len)| pending > *len) {
                best = Some((entry.key().clone(), entry.value().clone(), pending));
            }
        }
        best.map(|(id, instance, _)| (id, instance))
    }

    async fn invoke(
        self: Arc<Self>,
        id: String,
        instance: Arc<Instance>,
        mut message: FunctionMessage,
        permit: TaskPermit,
    ) {
        let Some(runtime) = self.runtime.upgrade() else {
            message.refuse(Refusal::Redeliverable);
            return;
        };

        let lock_key = function_context_key(&self.name, &id);
        let revision = if self.config.balance_needed {
            None
        } else {
            let locked = match runtime.domain().kv_mutex() {
                Ok(mutex) => tokio::select! {
                    locked = mutex.lock(&lock_key, self.config.mutex_lifetime, false) => locked,
                    _ = runtime.cancel_token().cancelled() => {
                        debug!(function_type = %self.name, id = %id, "Shutting down, message returned");
                        message.refuse(Refusal::Redeliverable);
                        return;
                    }
                },
                Err(e) => Err(e),
            };
            match locked {
                Ok(revision) => Some(revision),
                Err(e) => {
                    warn!(function_type = %self.name, id = %id, error = %e, "Failed to lock function context");
                    message.refuse(Refusal::Redeliverable);
                    return;
                }
            }
        };

        let ack = message.take_ack();
        let trace = TraceContext::continue_from(message.trace.as_ref());
        let ctx = ContextProcessor::new(
            runtime.clone(),
            self.clone(),
            id.clone(),
            message,
            trace.clone(),
            instance.executor.clone(),
        );

        if runtime.config().trace_events {
            self.publish_trace(&runtime, &trace, &id, "started").await;
        }

        if AssertUnwindSafe(self.handler.call(ctx.clone()))
            .catch_unwind()
            .await
            .is_err()
        {
            error!(function_type = %self.name, id = %id, "Handler panicked");
        }
        ctx.finish();
        if let Some(ack) = ack {
            ack(true);
        }

        if let Some(revision) = revision
            && let Ok(mutex) = runtime.domain().kv_mutex()
            && let Err(e) = mutex.unlock(&lock_key, revision).await
        {
            warn!(function_type = %self.name, id = %id, error = %e, "Failed to unlock function context");
        }

        if runtime.config().trace_events {
            self.publish_trace(&runtime, &trace, &id, "finished").await;
        }
        drop(permit);
    }

    async fn publish_trace(&self, runtime: &RuntimeCore, trace: &TraceContext, id: &str, event: &str) {
        let event = TraceEvent {
            context: trace.clone(),
            function_type: self.name.clone(),
            id: id.to_string(),
            event: event.to_string(),
            at: chrono::Utc::now(),
        };
        publish_event(runtime.domain().broker().as_ref(), runtime.domain().name(), &event).await;
    }

    /// Drop state of IDs idle for at least `ttl`, returning how many went.
    pub(crate) fn collect_idle(&self, ttl: Duration) -> usize {
        let idle: Vec<String> = self
            .instances
            .iter()
            .filter(|entry| entry.value().is_idle_for(ttl))
            .map(|entry| entry.key().clone())
            .collect();

        idle.into_iter()
            .filter(|id| {
                self.instances
                    .remove_if(id, |_, instance| instance.is_idle_for(ttl))
                    .is_some()
            })
            .count()
    }

    /// Create this type's stream unless it exists.
    pub(crate) async fn provision(&self, runtime: &RuntimeCore) -> Result<()> {
        let domain = runtime.domain();
        domain
            .ensure_stream(StreamConfig {
                name: self.stream_name(domain.name()),
                subjects: vec![self.signal_subject(domain.name())],
                sources: Vec::new(),
                replicas: runtime.config().replicas,
            })
            .await
    }

    /// Start the broker sources. No-op when already active.
    pub(crate) async fn activate(self: &Arc<Self>, runtime: &RuntimeCore) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }
        let cancel = runtime.cancel_token().child_token();
        let mut handles = Vec::new();
        if self.config.signal_providers.contains(&SignalProvider::Broker) {
            handles.push(sources::spawn_signal_source(self.clone(), runtime, cancel.clone()).await?);
        }
        if self.config.request_providers.contains(&RequestProvider::Broker) {
            handles.push(sources::spawn_request_source(self.clone(), runtime, cancel.clone()).await?);
        }

        *lock(&self.activation) = Some(Activation {
            cancel,
            sources: handles,
        });
        self.active.store(true, Ordering::SeqCst);
        info!(function_type = %self.name, "Function type activated");
        Ok(())
    }

    /// Stop the broker sources and wait for them. Queued messages still run.
    pub(crate) async fn deactivate(&self) {
        let activation = lock(&self.activation).take();
        self.active.store(false, Ordering::SeqCst);
        let Some(activation) = activation else {
            return;
        };
        activation.cancel.cancel();
        for handle in activation.sources {
            let _ = handle.await;
        }
        info!(function_type = %self.name, "Function type deactivated");
    }
}

impl std::fmt::Debug for FunctionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionType")
            .field("name", &self.name)
            .field("instances", &self.instances.len())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::WorkerPoolConfig;
    use serde_json::json;

    fn function_type(queue_len: usize) -> FunctionType {
        let config = FunctionTypeConfig::new()
            .with_queue_len(queue_len)
            .with_worker_pool(WorkerPoolConfig {
                min_workers: 0,
                max_workers: 1,
                idle_timeout: Duration::from_secs(1),
                task_queue_len: 1,
            });
        let definition =
            FunctionTypeDefinition::new("app.counter", |_ctx: ContextProcessor| async {}, config);
        FunctionType::new(definition, Weak::new()).unwrap()
    }

    fn message(refusals: &Arc<Mutex<Vec<Refusal>>>) -> FunctionMessage {
        let refusals = refusals.clone();
        FunctionMessage::new(Address::default(), json!({}), json!({}))
            .with_refusal(move |refusal| refusals.lock().unwrap().push(refusal))
    }

    #[test]
    fn test_stream_naming() {
        let ft = function_type(1);
        assert_eq!(ft.stream_name("leaf"), "sf_leaf_app_counter");
        assert_eq!(ft.signal_subject("leaf"), "$SI.leaf.signal.leaf.app.counter.*");
    }

    #[test]
    fn test_queue_full_then_no_tokens() {
        let ft = function_type(2);
        let refusals = Arc::new(Mutex::new(Vec::new()));
        assert_eq!(ft.tokens().capacity(), 3);

        ft.send("a", message(&refusals)).unwrap();
        ft.send("a", message(&refusals)).unwrap();
        let err = ft.send("a", message(&refusals)).unwrap_err();
        assert!(matches!(err, StatefunError::QueueFull { .. }));
        assert_eq!(ft.tokens().held(), 2, "token returned on queue-full refusal");

        ft.send("b", message(&refusals)).unwrap();
        let err = ft.send("c", message(&refusals)).unwrap_err();
        assert!(matches!(err, StatefunError::NoTokensLeft { .. }));
        assert!(!err.is_redeliverable());

        assert_eq!(
            *refusals.lock().unwrap(),
            vec![Refusal::Redeliverable, Refusal::Final]
        );
        assert_eq!(ft.instance_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_idle_skips_busy_ids() {
        let ft = function_type(4);
        let refusals = Arc::new(Mutex::new(Vec::new()));
        ft.send("a", message(&refusals)).unwrap();
        ft.send("b", message(&refusals)).unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(ft.collect_idle(Duration::from_secs(5)), 0, "queued messages keep state");

        let a = ft.instances.get("a").map(|e| e.value().clone()).unwrap();
        assert!(a.pop().is_some());
        assert_eq!(ft.collect_idle(Duration::from_secs(5)), 0, "in-flight message keeps state");

        a.in_flight.fetch_sub(1, Ordering::SeqCst);
        a.touch();
        assert_eq!(ft.collect_idle(Duration::from_secs(5)), 0, "recent activity keeps state");

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(ft.collect_idle(Duration::from_secs(5)), 1);
        assert_eq!(ft.collect_idle(Duration::from_secs(5)), 0);
        assert_eq!(ft.instance_count(), 1);
    }

    #[test]
    fn test_longest_queue_first() {
        let ft = function_type(8);
        let refusals = Arc::new(Mutex::new(Vec::new()));
        ft.send("short", message(&refusals)).unwrap();
        for _ in 0..3 {
            ft.send("long", message(&refusals)).unwrap();
        }
        let (id, _) = ft.longest_ready_queue().unwrap();
        assert_eq!(id, "long");

        let _guard = ft.id_mutex.try_lock("long").unwrap();
        let (id, _) = ft.longest_ready_queue().unwrap();
        assert_eq!(id, "short", "running IDs are skipped");
    }
}
