// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for statefun-core.
//!
//! Admission refusals, lock conditions and request outcomes are separate
//! variants so callers can tell them apart from transport failures.

use std::time::Duration;

use thiserror::Error;

use crate::broker::BrokerError;
use crate::config::ConfigError;

/// Result type using [`StatefunError`].
pub type Result<T> = std::result::Result<T, StatefunError>;

/// Errors produced by the stateful-function runtime.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StatefunError {
    /// The function type's token bucket is exhausted. Not redeliverable.
    #[error("no tokens left for function type '{function_type}'")]
    NoTokensLeft {
        /// Saturated function type.
        function_type: String,
    },

    /// The per-ID queue is full. Redeliverable, capacity exists elsewhere.
    #[error("message queue for '{function_type}' id '{id}' is full")]
    QueueFull {
        /// Function type name.
        function_type: String,
        /// Object ID whose queue overflowed.
        id: String,
    },

    /// A distributed mutex is held by someone else.
    #[error("mutex '{key}' is locked")]
    MutexLocked {
        /// Protected key.
        key: String,
    },

    /// The revision presented for a distributed mutex is no longer current.
    #[error("mutex '{key}' revision mismatch: held {expected}, store has {actual}")]
    RevisionMismatch {
        /// Protected key.
        key: String,
        /// Revision the caller holds.
        expected: u64,
        /// Revision currently in the store.
        actual: u64,
    },

    /// A distributed mutex was unlocked already (or never locked).
    #[error("mutex '{key}' is already unlocked")]
    AlreadyUnlocked {
        /// Protected key.
        key: String,
    },

    /// A request got no reply within its timeout.
    #[error("request to '{target}' timed out after {timeout:?}")]
    RequestTimeout {
        /// Target address or subject.
        target: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// A request was refused by the receiving side.
    #[error("request to '{target}' was refused")]
    RequestRefused {
        /// Target address or subject.
        target: String,
    },

    /// The function type is not registered in this runtime.
    #[error("function type '{0}' is not registered")]
    NotRegistered(String),

    /// The function type is registered but not serving in this runtime.
    #[error("function type '{0}' is not active in this runtime")]
    Inactive(String),

    /// The selected provider is not allowed for the target function type.
    #[error("function type '{function_type}' does not accept the {provider} provider")]
    ProviderNotAllowed {
        /// Target function type.
        function_type: String,
        /// Provider that was requested.
        provider: &'static str,
    },

    /// A broker subject could not be interpreted.
    #[error("invalid subject '{subject}': {reason}")]
    InvalidSubject {
        /// Offending subject.
        subject: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// An object ID is malformed.
    #[error("invalid object id '{0}'")]
    InvalidObjectId(String),

    /// The domain has not been started yet.
    #[error("domain '{0}' is not started")]
    DomainNotStarted(String),

    /// The worker pool no longer accepts tasks.
    #[error("worker pool '{0}' is stopped")]
    PoolStopped(String),

    /// The worker pool's task queue is full.
    #[error("worker pool '{0}' task queue is full")]
    PoolFull(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A failure that breaks delivery guarantees.
    #[error("consistency breach: {0}")]
    ConsistencyBreach(String),

    /// The script executor failed.
    #[error("script executor error: {0}")]
    Executor(String),

    /// Broker or key-value store failure.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StatefunError {
    /// Stable error code string for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoTokensLeft { .. } => "NO_TOKENS_LEFT",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::MutexLocked { .. } => "MUTEX_LOCKED",
            Self::RevisionMismatch { .. } => "REVISION_MISMATCH",
            Self::AlreadyUnlocked { .. } => "ALREADY_UNLOCKED",
            Self::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            Self::RequestRefused { .. } => "REQUEST_REFUSED",
            Self::NotRegistered(_) => "NOT_REGISTERED",
            Self::Inactive(_) => "INACTIVE",
            Self::ProviderNotAllowed { .. } => "PROVIDER_NOT_ALLOWED",
            Self::InvalidSubject { .. } => "INVALID_SUBJECT",
            Self::InvalidObjectId(_) => "INVALID_OBJECT_ID",
            Self::DomainNotStarted(_) => "DOMAIN_NOT_STARTED",
            Self::PoolStopped(_) => "POOL_STOPPED",
            Self::PoolFull(_) => "POOL_FULL",
            Self::Config(_) => "CONFIG_ERROR",
            Self::ConsistencyBreach(_) => "CONSISTENCY_BREACH",
            Self::Executor(_) => "EXECUTOR_ERROR",
            Self::Broker(_) => "BROKER_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }

    /// Whether the failed delivery may be retried later.
    pub fn is_redeliverable(&self) -> bool {
        !matches!(self, Self::NoTokensLeft { .. })
    }
}
