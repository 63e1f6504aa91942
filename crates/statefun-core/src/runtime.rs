// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime lifecycle.
//!
//! ```text
//! build()  ──► start()
//!               ├─ provision function type streams
//!               ├─ start the domain (bucket, routing streams, routers)
//!               ├─ start dispatch managers
//!               ├─ resolve leadership (runtime lease, single-instance type leases)
//!               ├─ activate sources of the types this runtime serves
//!               └─ spawn lease refresher, idle collector, after-start hook
//! shutdown()
//!               ├─ cancel background tasks (leases are released on the way out)
//!               ├─ deactivate sources
//!               └─ stop worker pools, waiting for running handlers
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use statefun_core::broker::memory::MemoryCluster;
//! use statefun_core::{FunctionTypeConfig, FunctionTypeDefinition, Runtime, RuntimeConfig};
//!
//! let cluster = MemoryCluster::new();
//! let runtime = Runtime::builder()
//!     .config(RuntimeConfig::default())
//!     .broker(cluster.connect("hub"))
//!     .function_type(FunctionTypeDefinition::new(
//!         "app.echo",
//!         |ctx: ContextProcessor| async move {
//!             if let Some(reply) = ctx.reply() {
//!                 reply.with(ctx.payload().clone());
//!             }
//!         },
//!         FunctionTypeConfig::new(),
//!     ))
//!     .build()?
//!     .start()
//!     .await?;
//!
//! runtime.shutdown().await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::config::RuntimeConfig;
use crate::context_store::ContextStore;
use crate::domain::Domain;
use crate::error::StatefunError;
use crate::function_type::{FunctionType, FunctionTypeDefinition, RequestProvider, SignalProvider};
use crate::gc::IdleCollector;
use crate::kv_mutex::KvMutex;
use crate::lease::LeaseKeeper;
use crate::lock_unpoisoned as lock;

/// Called on failures that break delivery guarantees. Replaces the default
/// reaction of cancelling the runtime.
pub type FatalHook = Arc<dyn Fn(&StatefunError) + Send + Sync>;

/// Runs once the runtime serves. Cancelled on shutdown.
pub type AfterStartHook = Box<dyn FnOnce(RuntimeHandle) -> BoxFuture<'static, ()> + Send>;

/// Builder for a [`Runtime`].
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    broker: Option<Arc<dyn Broker>>,
    function_types: Vec<FunctionTypeDefinition>,
    context_store: Option<Arc<dyn ContextStore>>,
    on_after_start: Option<AfterStartHook>,
    on_fatal: Option<FatalHook>,
}

impl RuntimeBuilder {
    /// Builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the runtime configuration.
    ///
    /// Default: [`RuntimeConfig::default()`]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the broker connection (required).
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Register a function type.
    pub fn function_type(mut self, definition: FunctionTypeDefinition) -> Self {
        self.function_types.push(definition);
        self
    }

    /// Replace the bucket-backed context store.
    pub fn context_store(mut self, store: Arc<dyn ContextStore>) -> Self {
        self.context_store = Some(store);
        self
    }

    /// Run `hook` once the runtime serves.
    pub fn on_after_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce(RuntimeHandle) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_after_start = Some(Box::new(move |handle| Box::pin(hook(handle))));
        self
    }

    /// React to fatal errors instead of cancelling the runtime.
    pub fn on_fatal(mut self, hook: impl Fn(&StatefunError) + Send + Sync + 'static) -> Self {
        self.on_fatal = Some(Arc::new(hook));
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<PreparedRuntime> {
        let broker = self
            .broker
            .ok_or_else(|| anyhow::anyhow!("broker is required"))?;

        let mut names = std::collections::HashSet::new();
        for definition in &self.function_types {
            if !names.insert(definition.name().to_string()) {
                anyhow::bail!("function type '{}' registered twice", definition.name());
            }
        }

        Ok(PreparedRuntime {
            config: self.config,
            broker,
            function_types: self.function_types,
            context_store: self.context_store,
            on_after_start: self.on_after_start,
            on_fatal: self.on_fatal,
        })
    }
}

/// A configured runtime, ready to start.
pub struct PreparedRuntime {
    config: RuntimeConfig,
    broker: Arc<dyn Broker>,
    function_types: Vec<FunctionTypeDefinition>,
    context_store: Option<Arc<dyn ContextStore>>,
    on_after_start: Option<AfterStartHook>,
    on_fatal: Option<FatalHook>,
}

impl PreparedRuntime {
    /// Provision, elect and start serving.
    pub async fn start(self) -> Result<Runtime> {
        let cancel = CancellationToken::new();
        let domain = Domain::new(
            self.broker,
            &self.config.hub_domain,
            self.config.cache_id.clone(),
            self.config.replicas,
            self.config.kv_mutex_poll_interval,
        );

        let mut build_error = None;
        let core = Arc::new_cyclic(|weak| {
            let mut registry = HashMap::new();
            for definition in self.function_types {
                let name = definition.name().to_string();
                match FunctionType::new(definition, weak.clone()) {
                    Ok(function_type) => {
                        registry.insert(name, Arc::new(function_type));
                    }
                    Err(e) => {
                        build_error.get_or_insert(e);
                    }
                }
            }
            RuntimeCore {
                config: self.config,
                domain,
                registry,
                cancel: cancel.clone(),
                on_fatal: self.on_fatal,
                fatal_error: Mutex::new(None),
                object_locks: DashMap::new(),
                active: AtomicBool::new(false),
            }
        });
        if let Some(e) = build_error {
            return Err(e.into());
        }

        for function_type in core.registry.values() {
            function_type.provision(&core).await?;
        }

        let mut tasks = core
            .domain
            .start(core.config.handles_domain_routers, self.context_store, &cancel)
            .await?;

        for function_type in core.registry.values() {
            tasks.push(function_type.spawn_manager(cancel.child_token()));
        }

        let mut leases = LeaseKeeper::new(core.clone());
        leases.resolve().await?;
        tasks.push(leases.spawn(cancel.child_token()));

        let collector = IdleCollector::new(core.clone(), cancel.child_token());
        tasks.push(tokio::spawn(async move { collector.run().await }));

        let handle = RuntimeHandle { core: core.clone() };
        if let Some(hook) = self.on_after_start {
            let hook_cancel = cancel.child_token();
            let future = hook(handle.clone());
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = hook_cancel.cancelled() => {}
                    _ = future => {}
                }
            }));
        }

        info!(
            runtime = %core.config.name,
            domain = %core.domain.name(),
            function_types = core.registry.len(),
            active = core.is_active(),
            "Runtime started"
        );

        Ok(Runtime {
            handle,
            cancel,
            tasks,
        })
    }
}

/// State shared by every part of a running runtime.
pub(crate) struct RuntimeCore {
    config: RuntimeConfig,
    domain: Domain,
    registry: HashMap<String, Arc<FunctionType>>,
    cancel: CancellationToken,
    on_fatal: Option<FatalHook>,
    fatal_error: Mutex<Option<String>>,
    object_locks: DashMap<(String, String), u64>,
    active: AtomicBool,
}

impl RuntimeCore {
    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn domain(&self) -> &Domain {
        &self.domain
    }

    pub(crate) fn function_type(&self, name: &str) -> Option<&Arc<FunctionType>> {
        self.registry.get(name)
    }

    pub(crate) fn function_types(&self) -> impl Iterator<Item = &Arc<FunctionType>> {
        self.registry.values()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Revisions of object mutexes held through context processors, keyed by
    /// `(holder, object_id)` where the holder is `<type>.<id>`.
    pub(crate) fn object_locks(&self) -> &DashMap<(String, String), u64> {
        &self.object_locks
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Escalate a failure that breaks delivery guarantees.
    pub(crate) fn fatal(&self, err: StatefunError) {
        error!(error = %err, code = err.error_code(), "Fatal runtime error");
        lock(&self.fatal_error).get_or_insert_with(|| err.to_string());
        match &self.on_fatal {
            Some(hook) => hook(&err),
            None => self.cancel.cancel(),
        }
    }
}

/// Cloneable handle to a running runtime.
#[derive(Clone)]
pub struct RuntimeHandle {
    core: Arc<RuntimeCore>,
}

impl RuntimeHandle {
    /// Signal `typename:id` from outside any function.
    pub async fn signal(
        &self,
        provider: SignalProvider,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
    ) -> crate::Result<()> {
        self.core
            .ingress_signal(provider, typename, id, payload, options)
            .await
    }

    /// Request `typename:id` from outside any function.
    pub async fn request(
        &self,
        provider: RequestProvider,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
        timeout: Option<Duration>,
    ) -> crate::Result<Value> {
        self.core
            .ingress_request(provider, typename, id, payload, options, timeout)
            .await
    }

    /// Publish `payload` on `egress.<typename>.<id>`.
    pub fn egress(&self, typename: &str, id: &str, payload: Value) -> crate::Result<()> {
        self.core.egress(typename, id, payload)
    }

    /// Configuration the runtime runs with.
    pub fn config(&self) -> &RuntimeConfig {
        self.core.config()
    }

    /// Domain of this runtime.
    pub fn domain(&self) -> &Domain {
        self.core.domain()
    }

    /// A registered function type.
    pub fn function_type(&self, name: &str) -> Option<&Arc<FunctionType>> {
        self.core.function_type(name)
    }

    /// Distributed mutex over the domain bucket.
    pub fn kv_mutex(&self) -> crate::Result<&KvMutex> {
        self.core.domain().kv_mutex()
    }

    /// Whether this runtime holds the active role.
    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    /// First fatal error, if any occurred.
    pub fn fatal_error(&self) -> Option<String> {
        lock(&self.core.fatal_error).clone()
    }

    /// Cancelled when the runtime shuts down or fails fatally.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.core.cancel.clone()
    }
}

/// A running runtime.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct Runtime {
    handle: RuntimeHandle,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Create a new builder.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Cloneable handle for use from other tasks.
    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }

    /// See [`RuntimeHandle::signal`].
    pub async fn signal(
        &self,
        provider: SignalProvider,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
    ) -> crate::Result<()> {
        self.handle.signal(provider, typename, id, payload, options).await
    }

    /// See [`RuntimeHandle::request`].
    pub async fn request(
        &self,
        provider: RequestProvider,
        typename: &str,
        id: &str,
        payload: Value,
        options: Value,
        timeout: Option<Duration>,
    ) -> crate::Result<Value> {
        self.handle
            .request(provider, typename, id, payload, options, timeout)
            .await
    }

    /// Domain of this runtime.
    pub fn domain(&self) -> &Domain {
        self.handle.domain()
    }

    /// A registered function type.
    pub fn function_type(&self, name: &str) -> Option<&Arc<FunctionType>> {
        self.handle.function_type(name)
    }

    /// Whether this runtime holds the active role.
    pub fn is_active(&self) -> bool {
        self.handle.is_active()
    }

    /// First fatal error, if any occurred.
    pub fn fatal_error(&self) -> Option<String> {
        self.handle.fatal_error()
    }

    /// Stop background tasks and sources, then wait for running handlers.
    pub async fn shutdown(self) -> Result<()> {
        info!(runtime = %self.handle.config().name, "Runtime shutting down...");
        self.cancel.cancel();

        let core = &self.handle.core;
        for function_type in core.function_types() {
            function_type.deactivate().await;
        }
        for function_type in core.function_types() {
            function_type.pool().stop().await;
        }

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Runtime task failed");
            }
        }

        info!(runtime = %self.handle.config().name, "Runtime stopped");
        Ok(())
    }
}
