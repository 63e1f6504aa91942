// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Optional script executors attached to a function type.
//!
//! A function type registered with an [`ExecutorFactory`] gets one executor per
//! ID, built when the ID's state is created and dropped when it is collected.
//! The handler decides when to run it:
//!
//! ```ignore
//! |ctx: ContextProcessor| async move {
//!     if let Some(executor) = ctx.executor() {
//!         let mut executor = executor.lock().await;
//!         if let Err(e) = executor.run(&ctx).await {
//!             tracing::warn!(error = %e, "Script failed");
//!         }
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ContextProcessor;
use crate::error::Result;

/// A script bound to one ID.
#[async_trait]
pub trait ScriptExecutor: Send {
    /// Error from building the script, if it failed.
    fn build_error(&self) -> Option<String>;

    /// Run the script against the current invocation.
    async fn run(&mut self, ctx: &ContextProcessor) -> Result<()>;
}

/// Executor shared between invocations of one ID.
pub type SharedExecutor = Arc<tokio::sync::Mutex<Box<dyn ScriptExecutor>>>;

type Constructor = dyn Fn(&str, &str) -> Box<dyn ScriptExecutor> + Send + Sync;

/// Builds executors for a function type from an alias and a script source.
#[derive(Clone)]
pub struct ExecutorFactory {
    alias: String,
    source: String,
    constructor: Arc<Constructor>,
}

impl ExecutorFactory {
    /// `constructor(alias, source)` is called once per ID.
    pub fn new<F>(alias: impl Into<String>, source: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&str, &str) -> Box<dyn ScriptExecutor> + Send + Sync + 'static,
    {
        Self {
            alias: alias.into(),
            source: source.into(),
            constructor: Arc::new(constructor),
        }
    }

    /// Script alias.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Script source.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub(crate) fn create(&self) -> Box<dyn ScriptExecutor> {
        (self.constructor)(&self.alias, &self.source)
    }
}

impl fmt::Debug for ExecutorFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorFactory")
            .field("alias", &self.alias)
            .field("source_len", &self.source.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatefunError;

    struct Rejecting {
        reason: String,
    }

    #[async_trait]
    impl ScriptExecutor for Rejecting {
        fn build_error(&self) -> Option<String> {
            Some(self.reason.clone())
        }

        async fn run(&mut self, _ctx: &ContextProcessor) -> Result<()> {
            Err(StatefunError::Executor(self.reason.clone()))
        }
    }

    #[test]
    fn test_factory_passes_alias_and_source() {
        let factory = ExecutorFactory::new("js", "return 1", |alias, source| {
            Box::new(Rejecting {
                reason: format!("{alias}:{source}"),
            }) as Box<dyn ScriptExecutor>
        });
        let executor = factory.create();
        assert_eq!(executor.build_error().as_deref(), Some("js:return 1"));
        assert_eq!(factory.alias(), "js");
    }
}
