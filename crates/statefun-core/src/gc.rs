// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background collector for idle per-ID state and expired contexts.
//!
//! Every `gc_interval` each function type drops the state of IDs that have
//! been idle for `id_lifetime` with nothing queued or running. The next message
//! for such an ID recreates its state from scratch. Expired contexts are
//! swept from the context store on the same tick.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::runtime::RuntimeCore;

pub(crate) struct IdleCollector {
    runtime: Arc<RuntimeCore>,
    cancel: CancellationToken,
}

impl IdleCollector {
    pub(crate) fn new(runtime: Arc<RuntimeCore>, cancel: CancellationToken) -> Self {
        Self { runtime, cancel }
    }

    pub(crate) async fn run(&self) {
        let config = self.runtime.config();
        info!(
            interval_ms = config.gc_interval.as_millis() as u64,
            id_lifetime_ms = config.id_lifetime.as_millis() as u64,
            "Idle collector started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                _ = tokio::time::sleep(config.gc_interval) => self.collect().await,
            }
        }

        info!("Idle collector stopped");
    }

    async fn collect(&self) {
        let ttl = self.runtime.config().id_lifetime;
        let mut collected = 0usize;
        for function_type in self.runtime.function_types() {
            let removed = function_type.collect_idle(ttl);
            if removed > 0 {
                debug!(function_type = %function_type.name(), removed, "Collected idle IDs");
            }
            collected += removed;
        }

        let expired = match self.runtime.domain().context_store() {
            Ok(store) => match store.sweep_expired().await {
                Ok(expired) => expired,
                Err(e) => {
                    error!(error = %e, "Failed to sweep expired contexts");
                    0
                }
            },
            Err(_) => 0,
        };

        if collected > 0 || expired > 0 {
            debug!(collected, expired, "Collection cycle completed");
        }
    }
}
