// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Leadership leases.
//!
//! Two kinds of lease live in the domain's distributed mutex:
//!
//! - `runtime.<name>`: taken when `active_passive` is set. Only its holder
//!   serves; the others stay passive and keep trying.
//! - `<function type>`: taken by the active runtime for every type that does
//!   not allow multiple instances. Only the holder runs that type's sources.
//!
//! Leases are renewed at half of the shortest lifetime. Losing the runtime lease
//! demotes the whole runtime; losing a type lease deactivates that type until it
//! can be taken back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StatefunError};
use crate::function_type::FunctionType;
use crate::runtime::RuntimeCore;

pub(crate) struct LeaseKeeper {
    runtime: Arc<RuntimeCore>,
    runtime_lease: Option<u64>,
    type_leases: HashMap<String, u64>,
}

impl LeaseKeeper {
    pub(crate) fn new(runtime: Arc<RuntimeCore>) -> Self {
        Self {
            runtime,
            runtime_lease: None,
            type_leases: HashMap::new(),
        }
    }

    fn runtime_lease_key(&self) -> String {
        format!("runtime.{}", self.runtime.config().name)
    }

    fn single_instance_types(&self) -> Vec<Arc<FunctionType>> {
        self.runtime
            .function_types()
            .filter(|ft| !ft.config().multiple_instances_allowed)
            .cloned()
            .collect()
    }

    /// Half of the shortest lease lifetime, `None` when no lease is needed.
    fn refresh_interval(&self) -> Option<Duration> {
        let mut lifetimes: Vec<Duration> = self
            .single_instance_types()
            .iter()
            .map(|ft| ft.config().mutex_lifetime)
            .collect();
        if self.runtime.config().active_passive {
            lifetimes.push(self.runtime.config().kv_mutex_lifetime);
        }
        lifetimes.into_iter().min().map(|lifetime| lifetime / 2)
    }

    /// `Ok(None)` when someone else holds the lease.
    async fn try_lock(&self, key: &str, lifetime: Duration) -> Result<Option<u64>> {
        match self
            .runtime
            .domain()
            .kv_mutex()?
            .lock(key, lifetime, true)
            .await
        {
            Ok(revision) => Ok(Some(revision)),
            Err(StatefunError::MutexLocked { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Initial election. Leaves the runtime active or passive.
    pub(crate) async fn resolve(&mut self) -> Result<()> {
        if self.runtime.config().active_passive {
            let key = self.runtime_lease_key();
            match self
                .try_lock(&key, self.runtime.config().kv_mutex_lifetime)
                .await?
            {
                Some(revision) => self.runtime_lease = Some(revision),
                None => {
                    info!(lease = %key, "Runtime lease held elsewhere, starting passive");
                    self.runtime.set_active(false);
                    return Ok(());
                }
            }
        }
        self.promote().await
    }

    async fn promote(&mut self) -> Result<()> {
        self.runtime.set_active(true);
        info!(runtime = %self.runtime.config().name, "Runtime is active");
        for function_type in self.runtime.function_types().cloned().collect::<Vec<_>>() {
            self.activate_type(&function_type).await?;
        }
        Ok(())
    }

    async fn activate_type(&mut self, function_type: &Arc<FunctionType>) -> Result<()> {
        let name = function_type.name();
        if !function_type.config().multiple_instances_allowed && !self.type_leases.contains_key(name) {
            match self
                .try_lock(name, function_type.config().mutex_lifetime)
                .await?
            {
                Some(revision) => {
                    self.type_leases.insert(name.to_string(), revision);
                }
                None => {
                    debug!(function_type = %name, "Type lease held elsewhere");
                    return Ok(());
                }
            }
        }
        function_type.activate(&self.runtime).await
    }

    async fn demote(&mut self) {
        self.runtime.set_active(false);
        for function_type in self.runtime.function_types() {
            function_type.deactivate().await;
        }
        self.release_type_leases().await;
        warn!(runtime = %self.runtime.config().name, "Runtime is passive");
    }

    async fn release_type_leases(&mut self) {
        let Ok(mutex) = self.runtime.domain().kv_mutex() else {
            return;
        };
        for (name, revision) in self.type_leases.drain() {
            if let Err(e) = mutex.unlock(&name, revision).await {
                warn!(lease = %name, error = %e, "Failed to release type lease");
            }
        }
    }

    async fn release_all(&mut self) {
        self.release_type_leases().await;
        if let Some(revision) = self.runtime_lease.take() {
            let key = self.runtime_lease_key();
            if let Ok(mutex) = self.runtime.domain().kv_mutex()
                && let Err(e) = mutex.unlock(&key, revision).await
            {
                warn!(lease = %key, error = %e, "Failed to release runtime lease");
            }
        }
    }

    async fn refresh(&mut self) -> Result<()> {
        let runtime = self.runtime.clone();
        let mutex = runtime.domain().kv_mutex()?;

        if self.runtime.config().active_passive {
            let key = self.runtime_lease_key();
            match self.runtime_lease {
                Some(revision) => match mutex.renew(&key, revision).await {
                    Ok(revision) => self.runtime_lease = Some(revision),
                    Err(e) => {
                        warn!(lease = %key, error = %e, "Lost runtime lease");
                        self.runtime_lease = None;
                        self.demote().await;
                        return Ok(());
                    }
                },
                None => match self
                    .try_lock(&key, self.runtime.config().kv_mutex_lifetime)
                    .await?
                {
                    Some(revision) => {
                        info!(lease = %key, "Runtime lease acquired");
                        self.runtime_lease = Some(revision);
                        self.promote().await?;
                        return Ok(());
                    }
                    None => return Ok(()),
                },
            }
        }

        if !self.runtime.is_active() {
            return Ok(());
        }

        for function_type in self.single_instance_types() {
            let name = function_type.name();
            if let Some(revision) = self.type_leases.get(name).copied() {
                match mutex.renew(name, revision).await {
                    Ok(revision) => {
                        self.type_leases.insert(name.to_string(), revision);
                        continue;
                    }
                    Err(e) => {
                        warn!(lease = %name, error = %e, "Lost type lease");
                        self.type_leases.remove(name);
                        function_type.deactivate().await;
                    }
                }
            }
            self.activate_type(&function_type).await?;
        }
        Ok(())
    }

    /// Keep leases fresh until `cancel`, then release them.
    pub(crate) fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            match self.refresh_interval() {
                Some(interval) => {
                    info!(interval_ms = interval.as_millis() as u64, "Lease keeper started");
                    loop {
                        tokio::select! {
                            biased;

                            _ = cancel.cancelled() => break,

                            _ = tokio::time::sleep(interval) => {
                                if let Err(e) = self.refresh().await {
                                    error!(error = %e, "Lease refresh failed");
                                }
                            }
                        }
                    }
                }
                None => cancel.cancelled().await,
            }
            self.release_all().await;
            info!("Lease keeper stopped");
        })
    }
}
