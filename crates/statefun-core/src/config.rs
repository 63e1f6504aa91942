// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime configuration and loading from environment variables.

use std::time::Duration;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Runtime identity, used as the active/passive lease key.
    pub name: String,
    /// Name of the hub domain (root partition of the cluster).
    pub hub_domain: String,
    /// Lifetime of the runtime-wide lease.
    pub kv_mutex_lifetime: Duration,
    /// Sleep between attempts while waiting for a held distributed mutex.
    pub kv_mutex_poll_interval: Duration,
    /// Idle time after which per-ID state is garbage collected.
    pub id_lifetime: Duration,
    /// Default timeout for requests.
    pub request_timeout: Duration,
    /// Interval of the idle-state garbage collector.
    pub gc_interval: Duration,
    /// Whether this runtime provisions streams and runs the domain routers.
    pub handles_domain_routers: bool,
    /// Elect a single active runtime among instances sharing `name`.
    pub active_passive: bool,
    /// Suffix distinguishing the domain bucket (`<domain>_<cache_id>_cache_bucket`).
    pub cache_id: String,
    /// Replication factor for streams and buckets.
    pub replicas: usize,
    /// Publish handler start/finish trace events.
    pub trace_events: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "runtime".to_string(),
            hub_domain: "hub".to_string(),
            kv_mutex_lifetime: Duration::from_secs(120),
            kv_mutex_poll_interval: Duration::from_millis(500),
            id_lifetime: Duration::from_millis(5000),
            request_timeout: Duration::from_secs(60),
            gc_interval: Duration::from_secs(5),
            handles_domain_routers: true,
            active_passive: false,
            cache_id: "kv".to_string(),
            replicas: 1,
            trace_events: false,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `STATEFUN_RUNTIME_NAME` (default: `runtime`)
    /// - `STATEFUN_HUB_DOMAIN` (default: `hub`)
    /// - `STATEFUN_KV_MUTEX_LIFETIME_SEC` (default: 120)
    /// - `STATEFUN_KV_MUTEX_POLL_MS` (default: 500)
    /// - `STATEFUN_ID_LIFETIME_MS` (default: 5000)
    /// - `STATEFUN_REQUEST_TIMEOUT_SEC` (default: 60)
    /// - `STATEFUN_GC_INTERVAL_SEC` (default: 5)
    /// - `STATEFUN_HANDLES_ROUTERS` (default: true)
    /// - `STATEFUN_ACTIVE_PASSIVE` (default: false)
    /// - `STATEFUN_CACHE_ID` (default: `kv`)
    /// - `STATEFUN_REPLICAS` (default: 1)
    /// - `STATEFUN_TRACE_EVENTS` (default: false)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            name: env_string("STATEFUN_RUNTIME_NAME", defaults.name),
            hub_domain: env_string("STATEFUN_HUB_DOMAIN", defaults.hub_domain),
            kv_mutex_lifetime: Duration::from_secs(env_parse(
                "STATEFUN_KV_MUTEX_LIFETIME_SEC",
                120,
                "must be a number of seconds",
            )?),
            kv_mutex_poll_interval: Duration::from_millis(env_parse(
                "STATEFUN_KV_MUTEX_POLL_MS",
                500,
                "must be a number of milliseconds",
            )?),
            id_lifetime: Duration::from_millis(env_parse(
                "STATEFUN_ID_LIFETIME_MS",
                5000,
                "must be a number of milliseconds",
            )?),
            request_timeout: Duration::from_secs(env_parse(
                "STATEFUN_REQUEST_TIMEOUT_SEC",
                60,
                "must be a number of seconds",
            )?),
            gc_interval: Duration::from_secs(env_parse(
                "STATEFUN_GC_INTERVAL_SEC",
                5,
                "must be a number of seconds",
            )?),
            handles_domain_routers: env_parse(
                "STATEFUN_HANDLES_ROUTERS",
                true,
                "must be true or false",
            )?,
            active_passive: env_parse("STATEFUN_ACTIVE_PASSIVE", false, "must be true or false")?,
            cache_id: env_string("STATEFUN_CACHE_ID", defaults.cache_id),
            replicas: env_parse("STATEFUN_REPLICAS", 1, "must be a positive integer")?,
            trace_events: env_parse("STATEFUN_TRACE_EVENTS", false, "must be true or false")?,
        })
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

pub(crate) fn env_parse<T: std::str::FromStr>(
    key: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key, reason)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
