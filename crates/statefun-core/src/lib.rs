// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Statefun Core - Distributed Runtime for Stateful Functions
//!
//! Functions are addressed by `(function type, object ID)`. Messages for one
//! ID are handled strictly one at a time and in arrival order; different IDs
//! run in parallel on an elastic worker pool. State lives in a per-domain
//! key-value bucket, and a lease-based distributed mutex coordinates
//! runtimes sharing a domain.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────── hub ───────────────────────────────┐
//! │                      hub_events (signal.>)                       │
//! └───────────────▲───────────────────────────────┬──────────────────┘
//!                 │ signal.<dst>.…                │ signal.<d>.…
//! ┌───────────────┴────────── domain <d> ─────────▼──────────────────┐
//! │  domain_egress ($SE.<d>.>)            domain_ingress             │
//! │        │ egress router                       │ ingress router    │
//! │        └──────────────► $SI.<d>.signal.<d>.<type>.<id> ◄──┘       │
//! │                                   │                              │
//! │                          sf_<d>_<type> stream                    │
//! │                                   │ queue consumer               │
//! │  request.<d>.<type>.<id> ──► FunctionType ──► per-ID queues      │
//! │                                   │ tokens + WorkerPool          │
//! │                                   ▼                              │
//! │                           handler(ContextProcessor)              │
//! │                                   │                              │
//! │            <d>_<cache_id>_cache_bucket (contexts, mutexes)       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Building Blocks
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`token_bucket`] | Counting semaphore bounding in-flight messages per type |
//! | [`key_mutex`] | In-process per-key mutual exclusion |
//! | [`kv_mutex`] | Lease-based distributed mutex over a bucket |
//! | [`context_store`] | Function and object contexts with expiration |
//! | [`domain`] | Domain resolution, object ID helpers, routing streams |
//! | [`router`] | Ingress and egress routers between hub and domain |
//! | [`scheduler`] | Elastic worker pool |
//! | [`function_type`] | Per-ID ordered dispatch of one function type |
//! | [`runtime`] | Lifecycle, leadership and background tasks |
//!
//! # Delivery
//!
//! Signals are fire-and-forget. Through the broker they are persisted and
//! acked after the handler returns; in-process they skip the broker and are
//! redirected to it when the target refuses them. Requests wait for a reply,
//! bounded by a timeout.
//!
//! # Configuration
//!
//! [`RuntimeConfig::from_env`] reads `STATEFUN_*` variables, and
//! [`WorkerPoolConfig::from_env`] reads `WP_*` variables for the
//! default pool sizing of function types.

#![deny(missing_docs)]

/// Broker abstraction and the in-memory cluster.
pub mod broker;

/// Runtime configuration.
pub mod config;

/// Handler-facing invocation context.
pub mod context;

/// Function and object context storage.
pub mod context_store;

/// Domains and object ID helpers.
pub mod domain;

/// Error types.
pub mod error;

/// Per-ID script executors.
pub mod executor;

/// Function types and their dispatch.
pub mod function_type;

mod gc;
mod io;

/// In-process keyed mutex.
pub mod key_mutex;

/// Distributed mutex over a key-value bucket.
pub mod kv_mutex;

mod lease;

/// Hub and domain routers.
pub mod router;

/// Runtime lifecycle.
pub mod runtime;

/// Elastic worker pool.
pub mod scheduler;

/// Counting token bucket.
pub mod token_bucket;

/// Trace propagation.
pub mod trace;

pub use config::RuntimeConfig;
pub use context::{ContextProcessor, SyncReply};
pub use context_store::ContextStore;
pub use domain::Domain;
pub use error::{Result, StatefunError};
pub use executor::{ExecutorFactory, ScriptExecutor};
pub use function_type::{
    Address, FunctionMessage, FunctionType, FunctionTypeConfig, FunctionTypeDefinition, Handler,
    RequestProvider, SignalProvider,
};
pub use io::{INGRESS_CALLER_TYPENAME, SHADOW_OBJECT_CAN_RECEIVE};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeHandle};
pub use scheduler::{LoadProfile, WorkerPool, WorkerPoolConfig};
pub use token_bucket::TokenBucket;

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
