// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Statefun Node - standalone runtime on an in-memory cluster.
//!
//! Registers a `statefun.echo` function type that replies with its payload
//! and counts invocations in its function context. Useful for trying the
//! runtime without a broker deployment.

use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use statefun_core::broker::memory::MemoryCluster;
use statefun_core::{
    ContextProcessor, FunctionTypeConfig, FunctionTypeDefinition, RequestProvider, Runtime,
    RuntimeConfig, SignalProvider,
};

const ECHO_TYPE: &str = "statefun.echo";

async fn echo(ctx: ContextProcessor) {
    let mut state = match ctx.get_function_context().await {
        Ok(state) => state,
        Err(e) => {
            warn!(id = %ctx.id(), error = %e, "Failed to read function context");
            return;
        }
    };
    let count = state["count"].as_u64().unwrap_or(0) + 1;
    state["count"] = json!(count);
    if let Err(e) = ctx.set_function_context(state).await {
        warn!(id = %ctx.id(), error = %e, "Failed to write function context");
    }

    if let Some(reply) = ctx.reply() {
        reply.with(json!({ "echo": ctx.payload(), "count": count }));
    } else if let Err(e) = ctx.egress(ctx.payload().clone(), None) {
        warn!(id = %ctx.id(), error = %e, "Failed to emit egress");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "statefun_core=info,statefun_node=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = RuntimeConfig::from_env()?;
    let domain = std::env::var("STATEFUN_DOMAIN").unwrap_or_else(|_| config.hub_domain.clone());

    info!(
        runtime = %config.name,
        domain = %domain,
        hub = %config.hub_domain,
        "Starting Statefun Node"
    );

    let cluster = MemoryCluster::new();
    let runtime = Runtime::builder()
        .config(config)
        .broker(cluster.connect(domain))
        .function_type(FunctionTypeDefinition::new(
            ECHO_TYPE,
            echo,
            FunctionTypeConfig::new()
                .with_signal_providers([SignalProvider::Broker, SignalProvider::InProcess])
                .with_request_providers([RequestProvider::Broker, RequestProvider::InProcess]),
        ))
        .on_after_start(|handle| async move {
            let reply = handle
                .request(
                    RequestProvider::Auto,
                    ECHO_TYPE,
                    "warmup",
                    json!({ "hello": "statefun" }),
                    json!({}),
                    Some(Duration::from_secs(5)),
                )
                .await;
            match reply {
                Ok(reply) => info!(reply = %reply, "Warmup request answered"),
                Err(e) => warn!(error = %e, "Warmup request failed"),
            }
        })
        .build()?
        .start()
        .await?;

    info!("Statefun Node ready");

    let cancelled = runtime.handle().cancellation_token();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        }
        _ = cancelled.cancelled() => {
            warn!(error = ?runtime.fatal_error(), "Runtime cancelled");
        }
    }

    runtime.shutdown().await?;
    Ok(())
}
