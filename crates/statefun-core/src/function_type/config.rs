// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-function-type configuration.

use std::time::Duration;

use serde_json::{Value, json};

use crate::config::ConfigError;
use crate::scheduler::{LoadProfile, WorkerPoolConfig};

/// How a signal reaches its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalProvider {
    /// In-process when the target allows it and lives here, broker otherwise.
    Auto,
    /// Persistent broker stream.
    Broker,
    /// Directly into the local function type's queue.
    InProcess,
}

/// How a request reaches its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestProvider {
    /// In-process when the target allows it and lives here, broker otherwise.
    Auto,
    /// Broker request/reply.
    Broker,
    /// Directly into the local function type's queue.
    InProcess,
}

impl SignalProvider {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Broker => "broker",
            Self::InProcess => "in-process",
        }
    }
}

impl RequestProvider {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Broker => "broker",
            Self::InProcess => "in-process",
        }
    }
}

/// Worker pool sizing of a function type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolSizing {
    /// Named tier.
    Profile(LoadProfile),
    /// Explicit sizing.
    Explicit(WorkerPoolConfig),
}

impl PoolSizing {
    pub(crate) fn resolve(&self) -> Result<WorkerPoolConfig, ConfigError> {
        match self {
            Self::Profile(profile) => WorkerPoolConfig::from_profile(*profile),
            Self::Explicit(config) => Ok(config.clone()),
        }
    }
}

/// Configuration of one function type.
#[derive(Debug, Clone)]
pub struct FunctionTypeConfig {
    /// Broker redelivers a signal not acknowledged within this time.
    pub ack_wait: Duration,
    /// Maximum broker deliveries of one signal (`None` = unlimited).
    pub max_deliver: Option<u32>,
    /// Capacity of each per-ID queue.
    pub queue_len: usize,
    /// `false` makes every invocation also hold the distributed mutex on
    /// `<type>.<id>`.
    pub balance_needed: bool,
    /// Lifetime of the distributed mutexes this type takes.
    pub mutex_lifetime: Duration,
    /// Defaults merged under every message's options.
    pub options: Value,
    /// `false` allows only one runtime in the cluster to serve this type.
    pub multiple_instances_allowed: bool,
    /// Signal providers this type accepts.
    pub signal_providers: Vec<SignalProvider>,
    /// Request providers this type accepts.
    pub request_providers: Vec<RequestProvider>,
    /// Worker pool sizing.
    pub pool: PoolSizing,
}

impl Default for FunctionTypeConfig {
    fn default() -> Self {
        Self {
            ack_wait: Duration::from_millis(10_000),
            max_deliver: None,
            queue_len: 64,
            balance_needed: true,
            mutex_lifetime: Duration::from_secs(120),
            options: json!({}),
            multiple_instances_allowed: false,
            signal_providers: vec![SignalProvider::Broker, SignalProvider::InProcess],
            request_providers: vec![RequestProvider::Broker, RequestProvider::InProcess],
            pool: PoolSizing::Profile(LoadProfile::Default),
        }
    }
}

impl FunctionTypeConfig {
    /// Defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ack wait.
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Limit broker deliveries.
    pub fn with_max_deliver(mut self, max_deliver: u32) -> Self {
        self.max_deliver = Some(max_deliver);
        self
    }

    /// Set the per-ID queue capacity.
    pub fn with_queue_len(mut self, queue_len: usize) -> Self {
        self.queue_len = queue_len.max(1);
        self
    }

    /// Set the balancing flag.
    pub fn with_balance_needed(mut self, balance_needed: bool) -> Self {
        self.balance_needed = balance_needed;
        self
    }

    /// Set the distributed mutex lifetime.
    pub fn with_mutex_lifetime(mut self, lifetime: Duration) -> Self {
        self.mutex_lifetime = lifetime;
        self
    }

    /// Set default options.
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    /// Allow several runtimes to serve this type at once.
    pub fn with_multiple_instances_allowed(mut self, allowed: bool) -> Self {
        self.multiple_instances_allowed = allowed;
        self
    }

    /// Restrict accepted signal providers.
    pub fn with_signal_providers(mut self, providers: impl IntoIterator<Item = SignalProvider>) -> Self {
        self.signal_providers = providers.into_iter().collect();
        self
    }

    /// Restrict accepted request providers.
    pub fn with_request_providers(
        mut self,
        providers: impl IntoIterator<Item = RequestProvider>,
    ) -> Self {
        self.request_providers = providers.into_iter().collect();
        self
    }

    /// Size the worker pool by tier.
    pub fn with_load_profile(mut self, profile: LoadProfile) -> Self {
        self.pool = PoolSizing::Profile(profile);
        self
    }

    /// Size the worker pool explicitly.
    pub fn with_worker_pool(mut self, config: WorkerPoolConfig) -> Self {
        self.pool = PoolSizing::Explicit(config);
        self
    }

    /// Whether `provider` may deliver signals to this type.
    pub fn allows_signal(&self, provider: SignalProvider) -> bool {
        provider == SignalProvider::Auto || self.signal_providers.contains(&provider)
    }

    /// Whether `provider` may deliver requests to this type.
    pub fn allows_request(&self, provider: RequestProvider) -> bool {
        provider == RequestProvider::Auto || self.request_providers.contains(&provider)
    }
}

/// Deep-merge `overlay` into `base`. Objects merge key by key; anything else
/// replaces.
pub(crate) fn merge_json(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FunctionTypeConfig::default();
        assert_eq!(config.ack_wait, Duration::from_secs(10));
        assert_eq!(config.queue_len, 64);
        assert!(config.balance_needed);
        assert!(!config.multiple_instances_allowed);
        assert_eq!(config.options, json!({}));
        assert!(config.allows_signal(SignalProvider::InProcess));
        assert!(config.allows_request(RequestProvider::Auto));
    }

    #[test]
    fn test_builders() {
        let config = FunctionTypeConfig::new()
            .with_queue_len(0)
            .with_max_deliver(3)
            .with_signal_providers([SignalProvider::Broker])
            .with_request_providers(Vec::new())
            .with_load_profile(LoadProfile::Light);

        assert_eq!(config.queue_len, 1);
        assert_eq!(config.max_deliver, Some(3));
        assert!(!config.allows_signal(SignalProvider::InProcess));
        assert!(config.allows_signal(SignalProvider::Auto));
        assert!(!config.allows_request(RequestProvider::Broker));
        assert_eq!(config.pool.resolve().unwrap().max_workers, 100);
    }

    #[test]
    fn test_merge_json() {
        let mut base = json!({"a": 1, "nested": {"x": 1, "y": 2}, "list": [1]});
        merge_json(&mut base, &json!({"b": 2, "nested": {"y": 3}, "list": [2, 3]}));
        assert_eq!(
            base,
            json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 3}, "list": [2, 3]})
        );

        let mut scalar = json!(1);
        merge_json(&mut scalar, &json!({"a": 1}));
        assert_eq!(scalar, json!({"a": 1}));
    }
}
