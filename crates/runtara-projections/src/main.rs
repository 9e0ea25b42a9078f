// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtara Projections - standalone control plane
//!
//! Runs the projection manager, the control-stream protocol and a loopback
//! worker core over a SQLite event log. Management commands are accepted
//! from the master stream.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use runtara_projections::config::Config;
use runtara_projections::event_log::SqliteEventLog;
use runtara_projections::runtime::ProjectionsRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("runtara_projections=info".parse().unwrap()),
        )
        .init();

    info!("Starting Runtara Projections");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        workers = config.worker_count,
        run_projections = ?config.run_projections,
        query_expiry_secs = config.query_expiry.as_secs(),
        "Configuration loaded"
    );

    // Open the event log; migrations run on connect
    info!("Opening event log...");
    let log = Arc::new(SqliteEventLog::connect(&config.database_url).await?);
    info!("Event log ready");

    let runtime = ProjectionsRuntime::builder()
        .event_log(log)
        .worker_count(config.worker_count)
        .run_projections(config.run_projections)
        .query_expiry(config.query_expiry)
        .initialize_system_projections(config.initialize_system_projections)
        .build()?
        .start()
        .await?;

    info!("Runtara Projections initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
