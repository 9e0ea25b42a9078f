// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for runtara-projections.
//!
//! This module provides [`ProjectionsRuntime`] which wires the projection
//! manager, the control-stream readers and writers, and the core coordinator
//! over one [`EventLog`], so the whole control plane can run inside an
//! existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runtara_projections::event_log::SqliteEventLog;
//! use runtara_projections::messages::management::{ManagementCommand, Post};
//! use runtara_projections::model::ProjectionMode;
//! use runtara_projections::runtime::ProjectionsRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let log = Arc::new(SqliteEventLog::connect("sqlite:projections.db").await?);
//!
//!     let runtime = ProjectionsRuntime::builder()
//!         .event_log(log)
//!         .worker_count(4)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let post = Post::new("$orders", ProjectionMode::Continuous, "JS", "fromAll()");
//!     runtime.manager().send(ManagementCommand::Post(post)).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::bus::Publisher;
use crate::control_stream::{
    ControlStreamWriter, CoreCommandReader, CoreCommandWriter, CoreResponseWriter, ResponseReader,
};
use crate::coordinator::{self, CoordinatorHandle, CoreComponent, DEFAULT_COMPONENT_TIMEOUT};
use crate::core::{LoopbackCore, ProjectionCore};
use crate::event_log::EventLog;
use crate::managed_projection::ProjectionStateChanged;
use crate::manager::{
    self, DEFAULT_QUERY_EXPIRY, ManagerHandle, ManagerServices, ManagerSettings, RunAsValidator,
};
use crate::messages::worker::CoreResponse;
use crate::model::RunProjections;

/// Builder for creating a [`ProjectionsRuntime`].
pub struct ProjectionsRuntimeBuilder {
    log: Option<Arc<dyn EventLog>>,
    core: Option<Arc<dyn ProjectionCore>>,
    validator: Option<Arc<dyn RunAsValidator>>,
    state_listener: Option<Arc<dyn Publisher<ProjectionStateChanged>>>,
    worker_count: usize,
    run_projections: RunProjections,
    query_expiry: Duration,
    initialize_system_projections: bool,
}

impl std::fmt::Debug for ProjectionsRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionsRuntimeBuilder")
            .field("log", &self.log.as_ref().map(|_| "..."))
            .field("core", &self.core.as_ref().map(|_| "..."))
            .field("worker_count", &self.worker_count)
            .field("run_projections", &self.run_projections)
            .field("query_expiry", &self.query_expiry)
            .field(
                "initialize_system_projections",
                &self.initialize_system_projections,
            )
            .finish()
    }
}

impl Default for ProjectionsRuntimeBuilder {
    fn default() -> Self {
        Self {
            log: None,
            core: None,
            validator: None,
            state_listener: None,
            worker_count: 3,
            run_projections: RunProjections::System,
            query_expiry: DEFAULT_QUERY_EXPIRY,
            initialize_system_projections: true,
        }
    }
}

impl ProjectionsRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event log (required).
    pub fn event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Set the engine running projection instances.
    ///
    /// Default: [`LoopbackCore`]
    pub fn core(mut self, core: Arc<dyn ProjectionCore>) -> Self {
        self.core = Some(core);
        self
    }

    /// Set the role check applied to management commands.
    ///
    /// Default: [`RoleRunAsValidator`](crate::manager::RoleRunAsValidator)
    pub fn validator(mut self, validator: Arc<dyn RunAsValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Receive every projection state change.
    pub fn state_listener(mut self, listener: Arc<dyn Publisher<ProjectionStateChanged>>) -> Self {
        self.state_listener = Some(listener);
        self
    }

    /// Set the number of worker queues.
    ///
    /// Default: `3`
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set which projections may run.
    ///
    /// Default: [`RunProjections::System`]
    pub fn run_projections(mut self, run_projections: RunProjections) -> Self {
        self.run_projections = run_projections;
        self
    }

    /// Set how long an unused transient projection survives.
    ///
    /// Default: 5 minutes
    pub fn query_expiry(mut self, expiry: Duration) -> Self {
        self.query_expiry = expiry;
        self
    }

    /// Whether the standard system projections are created when missing.
    ///
    /// Default: `true`
    pub fn initialize_system_projections(mut self, initialize: bool) -> Self {
        self.initialize_system_projections = initialize;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ProjectionsRuntimeConfig> {
        let log = self
            .log
            .ok_or_else(|| anyhow::anyhow!("event log is required"))?;
        if self.worker_count == 0 {
            return Err(anyhow::anyhow!("at least one worker is required"));
        }

        let workers = (0..self.worker_count).map(|_| Uuid::new_v4()).collect();
        let mut settings = ManagerSettings::new(workers);
        settings.run_projections = self.run_projections;
        settings.query_expiry = self.query_expiry;
        settings.initialize_system_projections = self.initialize_system_projections;

        Ok(ProjectionsRuntimeConfig {
            log,
            core: self.core.unwrap_or_else(|| Arc::new(LoopbackCore::new())),
            validator: self.validator,
            state_listener: self.state_listener,
            settings,
        })
    }
}

/// Configuration for a [`ProjectionsRuntime`].
pub struct ProjectionsRuntimeConfig {
    log: Arc<dyn EventLog>,
    core: Arc<dyn ProjectionCore>,
    validator: Option<Arc<dyn RunAsValidator>>,
    state_listener: Option<Arc<dyn Publisher<ProjectionStateChanged>>>,
    settings: ManagerSettings,
}

impl std::fmt::Debug for ProjectionsRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionsRuntimeConfig")
            .field("log", &"...")
            .field("core", &"...")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ProjectionsRuntimeConfig {
    /// Worker ids projections will be assigned to.
    pub fn workers(&self) -> &[Uuid] {
        &self.settings.workers
    }

    /// Start the runtime, spawning the manager, writer, readers and
    /// coordinator tasks.
    ///
    /// The node acts as a single primary: the manager starts as soon as
    /// every worker reader has started.
    pub async fn start(self) -> Result<ProjectionsRuntime> {
        let shutdown = CancellationToken::new();
        let workers = self.settings.workers.clone();

        let (writer, writer_handle) = ControlStreamWriter::spawn(self.log.clone(), shutdown.clone());

        let mut services = ManagerServices::new(
            self.log.clone(),
            Arc::new(CoreCommandWriter::new(writer.clone())),
        );
        if let Some(validator) = self.validator {
            services.validator = validator;
        }
        services.state_listener = self.state_listener;
        services.responses = Some(Box::new(ResponseReader::new(
            self.log.clone(),
            workers.len(),
            shutdown.clone(),
        )));
        let (manager, manager_handle) = manager::spawn(self.settings, services)?;

        let responses: Arc<dyn Publisher<CoreResponse>> = Arc::new(CoreResponseWriter::new(writer));
        let components: Vec<Box<dyn CoreComponent>> = workers
            .iter()
            .map(|worker_id| {
                Box::new(CoreCommandReader::new(
                    *worker_id,
                    self.log.clone(),
                    self.core.clone(),
                    responses.clone(),
                    shutdown.clone(),
                )) as Box<dyn CoreComponent>
            })
            .collect();
        let (coordinator, coordinator_handle) = coordinator::spawn(
            components,
            Some(manager.clone()),
            DEFAULT_COMPONENT_TIMEOUT,
            shutdown.clone(),
        );

        manager.node_state_changed(true);
        manager.epoch_written();
        coordinator.start_components();

        info!(workers = workers.len(), "ProjectionsRuntime started");

        Ok(ProjectionsRuntime {
            manager,
            coordinator,
            workers,
            log: self.log,
            shutdown,
            manager_handle,
            tasks: vec![writer_handle, coordinator_handle],
        })
    }
}

/// A running projections control plane that can be embedded in an application.
///
/// The runtime manages:
/// - the projection manager actor
/// - one command reader per worker, started through the core coordinator
/// - the master-stream response reader and the control-stream writer
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ProjectionsRuntime {
    manager: ManagerHandle,
    coordinator: CoordinatorHandle,
    workers: Vec<Uuid>,
    log: Arc<dyn EventLog>,
    shutdown: CancellationToken,
    manager_handle: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProjectionsRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ProjectionsRuntimeBuilder {
        ProjectionsRuntimeBuilder::new()
    }

    /// Handle for sending management commands.
    pub fn manager(&self) -> &ManagerHandle {
        &self.manager
    }

    /// Handle of the core coordinator.
    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    /// Worker ids projections are assigned to.
    pub fn workers(&self) -> &[Uuid] {
        &self.workers
    }

    /// Get a reference to the event log.
    pub fn event_log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the manager first so it releases its projections, then cancels
    /// the readers and the writer and waits for every task.
    pub async fn shutdown(self) -> Result<()> {
        info!("ProjectionsRuntime shutting down...");

        self.manager.shutdown();
        let manager_result = self.manager_handle.await;
        self.shutdown.cancel();

        let mut failed = None;
        if let Err(e) = manager_result {
            error!("Projection manager task panicked: {}", e);
            failed = Some(e);
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("ProjectionsRuntime task panicked: {}", e);
                failed = Some(e);
            }
        }

        match failed {
            None => {
                info!("ProjectionsRuntime shutdown complete");
                Ok(())
            }
            Some(e) => Err(anyhow::anyhow!("runtime task panicked: {}", e)),
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.manager_handle.is_finished()
    }
}
