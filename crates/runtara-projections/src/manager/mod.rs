// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Projection manager.
//!
//! A single actor owns every [`ManagedProjection`](crate::managed_projection)
//! of the node, keyed both by name and by correlation id. It assigns new
//! projections to workers round robin, rebuilds the live set from the
//! registry stream when the node becomes primary, and routes management
//! commands and worker reports to the projection they concern.
//!
//! The manager only runs projections while the node is primary: losing
//! primary status cancels pending live queries and clears the registry maps.

mod authorization;
mod bootstrap;
mod slaves;

pub use authorization::{PRIVILEGED_ROLES, RoleRunAsValidator, RunAsValidator};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::bus::Publisher;
use crate::config::ConfigError;
use crate::error::{ProjectionError, Result};
use crate::event_log::{EventLog, OperationResult, ReadStreamSlice, WriteEventsCompleted};
use crate::managed_projection::{
    ManagedProjection, PersistedState, ProjectionIo, ProjectionParams, ProjectionServices,
    ProjectionStateChanged, QueryDispatchers, SlaveMaster,
};
use crate::messages::management::{Envelope, ManagementCommand, ManagementReply, Post};
use crate::messages::worker::{CoreResponse, WorkerCommand};
use crate::model::{ProjectionMode, RunAs, RunProjections};
use crate::names::{self, PROJECTION_QUERY_ID, event_types};

use bootstrap::RegistrySnapshot;
use slaves::SlaveBatches;

/// Interval of the transient-projection expiry sweep.
pub const DEFAULT_EXPIRY_INTERVAL: Duration = Duration::from_secs(60);

/// Default time a transient projection may stay unused.
pub const DEFAULT_QUERY_EXPIRY: Duration = Duration::from_secs(300);

/// Tunables of a projection manager.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Worker queues projections are assigned to. Must not be empty.
    pub workers: Vec<Uuid>,
    /// Which projections may run.
    pub run_projections: RunProjections,
    /// Time after which an unused transient projection is deleted.
    pub query_expiry: Duration,
    /// Create the standard system projections when missing.
    pub initialize_system_projections: bool,
    /// Interval of the expiry sweep.
    pub expiry_interval: Duration,
}

impl ManagerSettings {
    /// Defaults for the given worker set.
    pub fn new(workers: Vec<Uuid>) -> Self {
        Self {
            workers,
            run_projections: RunProjections::System,
            query_expiry: DEFAULT_QUERY_EXPIRY,
            initialize_system_projections: true,
            expiry_interval: DEFAULT_EXPIRY_INTERVAL,
        }
    }
}

/// Delivers worker responses to the manager.
///
/// Reset whenever the manager starts, stopped when it stops.
pub trait ResponseSource: Send {
    /// Abandon any previous scope and start delivering to `manager`.
    fn reset(&mut self, manager: ManagerHandle);
    /// Stop delivering.
    fn stop(&mut self);
}

/// Collaborators of a projection manager.
pub struct ManagerServices {
    /// Storage for the registry and definition streams.
    pub log: Arc<dyn EventLog>,
    /// Destination of commands addressed to workers.
    pub output: Arc<dyn Publisher<WorkerCommand>>,
    /// Role check applied to management commands.
    pub validator: Arc<dyn RunAsValidator>,
    /// Source of worker responses, if the manager should control one.
    pub responses: Option<Box<dyn ResponseSource>>,
    /// Receives every projection state change.
    pub state_listener: Option<Arc<dyn Publisher<ProjectionStateChanged>>>,
}

impl ManagerServices {
    /// Services with the default validator and no response source.
    pub fn new(log: Arc<dyn EventLog>, output: Arc<dyn Publisher<WorkerCommand>>) -> Self {
        Self {
            log,
            output,
            validator: Arc::new(RoleRunAsValidator),
            responses: None,
            state_listener: None,
        }
    }
}

impl std::fmt::Debug for ManagerServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerServices")
            .field("log", &"...")
            .field("output", &"...")
            .field("responses", &self.responses.as_ref().map(|_| "..."))
            .field("state_listener", &self.state_listener.as_ref().map(|_| "..."))
            .finish()
    }
}

#[derive(Debug)]
pub(crate) enum ManagerMessage {
    Command {
        command: ManagementCommand,
        envelope: Envelope,
    },
    RegisterSystemProjection {
        name: String,
        handler_type: String,
        query: String,
    },
    Response(CoreResponse),
    ReaderReady,
    SystemCoreReady,
    NodeStateChanged {
        primary: bool,
    },
    EpochWritten,
    CleanupExpired {
        generation: u64,
    },
    Deleted {
        name: String,
        id: Uuid,
    },
    Io {
        generation: u64,
        completion: IoCompletion,
    },
}

#[derive(Debug)]
pub(crate) enum IoCompletion {
    Projection {
        id: Uuid,
        io: ProjectionIo,
    },
    DefinitionChecked {
        post: Post,
        envelope: Envelope,
        result: Result<ReadStreamSlice>,
    },
    Registered {
        post: Post,
        envelope: Envelope,
        version: i64,
        result: Result<WriteEventsCompleted>,
    },
    RegistryRead(Result<RegistrySnapshot>),
    RegistryInitialized(Result<WriteEventsCompleted>),
    DeletionRegistered {
        name: String,
        id: Uuid,
        result: Result<WriteEventsCompleted>,
    },
}

/// Handle to a running projection manager.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    inbox: mpsc::UnboundedSender<ManagerMessage>,
    shutdown: CancellationToken,
}

impl ManagerHandle {
    /// Send a command and wait for its terminal reply.
    ///
    /// Fails with [`ProjectionError::Unavailable`] when the manager dropped
    /// the command, e.g. because it has not started yet.
    pub async fn send(&self, command: ManagementCommand) -> Result<ManagementReply> {
        let (envelope, reply) = Envelope::new();
        self.dispatch(command, envelope);
        reply.await.map_err(|_| ProjectionError::Unavailable {
            reason: "projection manager dropped the command".to_string(),
        })
    }

    /// Send a command whose reply goes to `envelope`.
    pub fn dispatch(&self, command: ManagementCommand, envelope: Envelope) {
        self.inbox
            .publish(ManagerMessage::Command { command, envelope });
    }

    /// Create a continuous system projection unless it already exists.
    pub fn register_system_projection(
        &self,
        name: impl Into<String>,
        handler_type: impl Into<String>,
        query: impl Into<String>,
    ) {
        self.inbox.publish(ManagerMessage::RegisterSystemProjection {
            name: name.into(),
            handler_type: handler_type.into(),
            query: query.into(),
        });
    }

    /// Every worker-side component has started.
    pub fn system_core_ready(&self) {
        self.inbox.publish(ManagerMessage::SystemCoreReady);
    }

    /// The node became primary, or stopped being primary.
    pub fn node_state_changed(&self, primary: bool) {
        self.inbox
            .publish(ManagerMessage::NodeStateChanged { primary });
    }

    /// The primary's epoch has been written.
    pub fn epoch_written(&self) {
        self.inbox.publish(ManagerMessage::EpochWritten);
    }

    /// Deliver a worker response.
    pub fn worker_response(&self, response: CoreResponse) {
        self.inbox.publish(ManagerMessage::Response(response));
    }

    /// Every worker has announced itself to the response reader.
    pub fn reader_ready(&self) {
        self.inbox.publish(ManagerMessage::ReaderReady);
    }

    /// Stop the manager task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether the manager task has exited.
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }
}

#[cfg(test)]
impl ManagerHandle {
    /// A handle whose messages land in the returned receiver.
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<ManagerMessage>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let handle = Self {
            inbox,
            shutdown: CancellationToken::new(),
        };
        (handle, rx)
    }
}

/// Spawn a projection manager.
///
/// Fails when `settings` names no worker to place projections on.
pub fn spawn(
    settings: ManagerSettings,
    services: ManagerServices,
) -> std::result::Result<(ManagerHandle, JoinHandle<()>), ConfigError> {
    if settings.workers.is_empty() {
        return Err(ConfigError::Invalid("workers", "at least one worker is required"));
    }
    let (inbox_tx, inbox) = mpsc::unbounded_channel();
    let handle = ManagerHandle {
        inbox: inbox_tx.clone(),
        shutdown: CancellationToken::new(),
    };
    let dispatchers = QueryDispatchers::new(services.output.clone());
    let manager = ProjectionManager {
        settings,
        log: services.log,
        output: services.output,
        validator: services.validator,
        responses: services.responses,
        state_listener: services.state_listener,
        handle: handle.clone(),
        inbox: inbox_tx,
        system_core_ready: false,
        is_primary: false,
        epoch_written: false,
        started: false,
        bootstrapping: false,
        projections_started: false,
        generation: 0,
        projections: HashMap::new(),
        projections_map: HashMap::new(),
        next_worker_index: 0,
        dispatchers,
        slaves: SlaveBatches::default(),
    };
    let shutdown = handle.shutdown.clone();
    let join = tokio::spawn(manager.run(inbox, shutdown));
    Ok((handle, join))
}

struct ProjectionManager {
    settings: ManagerSettings,
    log: Arc<dyn EventLog>,
    output: Arc<dyn Publisher<WorkerCommand>>,
    validator: Arc<dyn RunAsValidator>,
    responses: Option<Box<dyn ResponseSource>>,
    state_listener: Option<Arc<dyn Publisher<ProjectionStateChanged>>>,
    handle: ManagerHandle,
    inbox: mpsc::UnboundedSender<ManagerMessage>,

    system_core_ready: bool,
    is_primary: bool,
    epoch_written: bool,
    started: bool,
    /// The registry is being read or initialized.
    bootstrapping: bool,
    /// Commands are served only once the registry has been loaded.
    projections_started: bool,
    /// Bumped on every stop; completions from older generations are dropped.
    generation: u64,

    projections: HashMap<String, ManagedProjection>,
    projections_map: HashMap<Uuid, String>,
    next_worker_index: usize,
    dispatchers: QueryDispatchers,
    slaves: SlaveBatches,
}

impl ProjectionManager {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<ManagerMessage>,
        shutdown: CancellationToken,
    ) {
        info!(workers = self.settings.workers.len(), "Projection manager task started");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                message = inbox.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
            }
        }
        self.stop();
        info!("Projection manager task stopped");
    }

    fn handle(&mut self, message: ManagerMessage) {
        match message {
            ManagerMessage::Command { command, envelope } => self.handle_command(command, envelope),
            ManagerMessage::RegisterSystemProjection {
                name,
                handler_type,
                query,
            } => self.register_system_projection(name, handler_type, query),
            ManagerMessage::Response(response) => self.handle_response(response),
            ManagerMessage::ReaderReady => self.reader_ready(),
            ManagerMessage::SystemCoreReady => {
                self.system_core_ready = true;
                self.start_if_ready();
            }
            ManagerMessage::NodeStateChanged { primary } => {
                self.is_primary = primary;
                if !primary {
                    self.epoch_written = false;
                    self.stop();
                }
            }
            ManagerMessage::EpochWritten => {
                if self.is_primary {
                    self.epoch_written = true;
                    self.start_if_ready();
                }
            }
            ManagerMessage::CleanupExpired { generation } => {
                if generation == self.generation && self.projections_started {
                    self.cleanup_expired();
                }
            }
            ManagerMessage::Deleted { name, id } => self.projection_deleted(name, id),
            ManagerMessage::Io {
                generation,
                completion,
            } => {
                if generation != self.generation {
                    debug!(generation, current = self.generation, "Dropping completion of a stopped manager");
                    return;
                }
                self.handle_io(completion);
            }
        }
    }

    // ------------------------------------------------------------------
    // Start and stop
    // ------------------------------------------------------------------

    fn start_if_ready(&mut self) {
        if self.started || !(self.system_core_ready && self.is_primary && self.epoch_written) {
            return;
        }
        info!("Starting projections manager");
        self.started = true;
        if let Some(responses) = self.responses.as_mut() {
            responses.reset(self.handle.clone());
        }
    }

    fn reader_ready(&mut self) {
        if !self.started || self.bootstrapping || self.projections_started {
            return;
        }
        if self.settings.run_projections >= RunProjections::System {
            self.bootstrapping = true;
            self.start_existing_projections();
        } else {
            self.projections_ready();
        }
    }

    /// The live set matches the registry; start serving commands.
    fn projections_ready(&mut self) {
        self.bootstrapping = false;
        self.projections_started = true;
        self.schedule_expiry();
        info!(
            run_projections = ?self.settings.run_projections,
            projections = self.projections.len(),
            "Projections started"
        );
    }

    fn stop(&mut self) {
        if !self.started && !self.projections_started {
            return;
        }
        info!(projections = self.projections.len(), "Stopping projections manager");
        self.started = false;
        self.bootstrapping = false;
        self.projections_started = false;
        self.dispatchers.cancel_all();
        self.generation += 1;
        self.projections.clear();
        self.projections_map.clear();
        self.slaves.clear();
        if let Some(responses) = self.responses.as_mut() {
            responses.stop();
        }
    }

    fn schedule_expiry(&self) {
        let inbox = self.inbox.clone();
        let generation = self.generation;
        let after = self.settings.expiry_interval;
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            inbox.publish(ManagerMessage::CleanupExpired { generation });
        });
    }

    fn cleanup_expired(&mut self) {
        self.schedule_expiry();
        let now = Instant::now();
        for projection in self.projections.values_mut() {
            if let Err(e) = projection.cleanup_expired(now) {
                log_projection_error(projection.name(), &e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Registry maps
    // ------------------------------------------------------------------

    /// Round robin over the worker list, continuing where the last call stopped.
    fn next_worker_index(&mut self) -> usize {
        if self.next_worker_index >= self.settings.workers.len() {
            self.next_worker_index = 0;
        }
        let index = self.next_worker_index;
        self.next_worker_index += 1;
        index
    }

    fn services(&self) -> ProjectionServices {
        ProjectionServices {
            log: self.log.clone(),
            inbox: self.inbox.clone(),
            output: self.output.clone(),
            generation: self.generation,
            state_listener: self.state_listener.clone(),
        }
    }

    fn create_managed_projection(
        &mut self,
        name: String,
        projection_id: i64,
        worker_index: usize,
        slave: Option<SlaveMaster>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let enabled_to_run = slave.is_some() || self.settings.run_projections.allows(&name);
        let params = ProjectionParams {
            id,
            worker_id: self.settings.workers[worker_index],
            projection_id,
            name: name.clone(),
            enabled_to_run,
            query_expiry: self.settings.query_expiry,
            slave,
        };
        debug!(projection = %name, worker_id = %params.worker_id, projection_id, "Creating managed projection");
        let projection = ManagedProjection::new(params, self.services());
        self.projections_map.insert(id, name.clone());
        self.projections.insert(name, projection);
        id
    }

    fn projection_deleted(&mut self, name: String, id: Uuid) {
        let persistent = self
            .projections
            .get(&name)
            .is_some_and(|projection| projection.mode() >= ProjectionMode::OneTime);
        if !persistent {
            self.remove_projection(&name, id);
            return;
        }
        let log = self.log.clone();
        self.spawn_io(async move {
            let result =
                bootstrap::write_registry_marker(log.as_ref(), event_types::PROJECTION_DELETED, &name)
                    .await;
            IoCompletion::DeletionRegistered { name, id, result }
        });
    }

    fn remove_projection(&mut self, name: &str, id: Uuid) {
        if self.projections_map.remove(&id).is_some() {
            self.projections.remove(name);
            self.slaves.fail(
                id,
                format!("Slave projection '{}' was removed before its reader was assigned", name),
            );
            info!(projection = %name, "Projection removed");
        }
    }

    fn spawn_io<F>(&self, io: F)
    where
        F: std::future::Future<Output = IoCompletion> + Send + 'static,
    {
        let inbox = self.inbox.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let completion = io.await;
            inbox.publish(ManagerMessage::Io {
                generation,
                completion,
            });
        });
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, command: ManagementCommand, envelope: Envelope) {
        if !self.projections_started {
            debug!(command = ?command.name(), "Projection manager not started, dropping command");
            return;
        }
        match command {
            ManagementCommand::Post(post) => self.post(post, envelope),
            ManagementCommand::StartSlaveProjections(message) => {
                self.start_slave_projections(message, envelope)
            }
            ManagementCommand::GetStatistics { name, scope } => {
                let projections = match name {
                    Some(name) => match self.projections.get(&name) {
                        Some(projection) => vec![projection.statistics()],
                        None => {
                            envelope.reply(ManagementReply::NotFound { name });
                            return;
                        }
                    },
                    None => {
                        let mut projections: Vec<_> = self
                            .projections
                            .values()
                            .filter(|p| !p.is_deleted() && scope.includes(p.mode()))
                            .map(ManagedProjection::statistics)
                            .collect();
                        projections.sort_by(|a, b| a.name.cmp(&b.name));
                        projections
                    }
                };
                envelope.reply(ManagementReply::Statistics { projections });
            }
            command => self.route(command, envelope),
        }
    }

    /// Hand a command to the projection it names.
    fn route(&mut self, command: ManagementCommand, envelope: Envelope) {
        let Some(name) = command.name().map(str::to_string) else {
            envelope.reply(ManagementReply::OperationFailed {
                reason: "Projection name is required".to_string(),
            });
            return;
        };
        if matches!(command, ManagementCommand::Delete(_)) && bootstrap::is_system_projection(&name) {
            envelope.reply(ManagementReply::OperationFailed {
                reason: "We currently don't allow for the deletion of System Projections.".to_string(),
            });
            return;
        }
        let Some(projection) = self.projections.get_mut(&name) else {
            envelope.reply(ManagementReply::NotFound { name });
            return;
        };
        if let Some(requester) = command.run_as()
            && !self.validator.authorize(requester, &command, projection.mode())
        {
            envelope.reply(ManagementReply::NotAuthorized);
            return;
        }

        let result = match command {
            ManagementCommand::Disable(_) => projection.disable(envelope),
            ManagementCommand::Enable(_) => projection.enable(envelope),
            ManagementCommand::Abort(_) => projection.abort(envelope),
            ManagementCommand::SetRunAs { target, action } => {
                projection.set_run_as(action, target.run_as, envelope)
            }
            ManagementCommand::UpdateQuery(message) => projection.update_query(message, envelope),
            ManagementCommand::Reset(_) => projection.reset(envelope),
            ManagementCommand::Delete(message) => projection.delete(message, envelope),
            ManagementCommand::GetQuery(_) => {
                projection.get_query(envelope);
                Ok(())
            }
            ManagementCommand::GetConfig(_) => {
                projection.get_config(envelope);
                Ok(())
            }
            ManagementCommand::UpdateConfig { settings, .. } => {
                projection.update_config(settings, envelope)
            }
            ManagementCommand::GetState(query) => {
                projection.get_state(query.partition, envelope, &mut self.dispatchers);
                Ok(())
            }
            ManagementCommand::GetResult(query) => {
                projection.get_result(query.partition, envelope, &mut self.dispatchers);
                Ok(())
            }
            ManagementCommand::Post(_)
            | ManagementCommand::GetStatistics { .. }
            | ManagementCommand::StartSlaveProjections(_) => Ok(()),
        };
        if let Err(e) = result {
            log_projection_error(&name, &e);
        }
    }

    fn register_system_projection(&mut self, name: String, handler_type: String, query: String) {
        if self.projections.contains_key(&name) {
            return;
        }
        let post = Post {
            name,
            mode: ProjectionMode::Continuous,
            handler_type,
            query,
            enabled: true,
            checkpoints_enabled: true,
            emit_enabled: true,
            track_emitted_streams: true,
            enable_run_as: true,
            run_as: RunAs::System,
        };
        self.handle_command(ManagementCommand::Post(post), Envelope::noop());
    }

    #[instrument(skip(self, envelope), fields(projection = %post.name, mode = %post.mode))]
    fn post(&mut self, post: Post, envelope: Envelope) {
        if post.name.is_empty() {
            envelope.reply(ManagementReply::OperationFailed {
                reason: "Projection name is required".to_string(),
            });
            return;
        }
        if !self.validator.authorize(
            &post.run_as,
            &ManagementCommand::Post(post.clone()),
            post.mode,
        ) {
            envelope.reply(ManagementReply::NotAuthorized);
            return;
        }
        if self.projections.contains_key(&post.name) {
            warn!("Duplicate projection name");
            envelope.reply(ManagementReply::Conflict { name: post.name });
            return;
        }
        if post.mode == ProjectionMode::Continuous && !post.checkpoints_enabled {
            envelope.reply(ManagementReply::OperationFailed {
                reason: "Continuous mode requires checkpoints".to_string(),
            });
            return;
        }
        if post.emit_enabled && !post.checkpoints_enabled {
            envelope.reply(ManagementReply::OperationFailed {
                reason: "Emit requires checkpoints".to_string(),
            });
            return;
        }

        let log = self.log.clone();
        let stream = names::definition_stream(&post.name);
        self.spawn_io(async move {
            let result = log.read_backward(&stream, -1, 1).await;
            IoCompletion::DefinitionChecked {
                post,
                envelope,
                result,
            }
        });
    }

    fn definition_checked(&mut self, post: Post, envelope: Envelope, slice: ReadStreamSlice) {
        if self.projections.contains_key(&post.name) {
            envelope.reply(ManagementReply::Conflict { name: post.name });
            return;
        }
        // The new definition is written right after the latest existing one.
        let version = if slice.result == crate::event_log::ReadStreamResult::Success {
            slice.last_event_number + 1
        } else {
            -1
        };
        if post.mode < ProjectionMode::OneTime {
            self.create_posted(post, envelope, version, PROJECTION_QUERY_ID);
            return;
        }
        let log = self.log.clone();
        self.spawn_io(async move {
            let result =
                bootstrap::write_registry_marker(log.as_ref(), event_types::PROJECTION_CREATED, &post.name)
                    .await;
            IoCompletion::Registered {
                post,
                envelope,
                version,
                result,
            }
        });
    }

    fn create_posted(&mut self, post: Post, envelope: Envelope, version: i64, projection_id: i64) {
        if self.projections.contains_key(&post.name) {
            envelope.reply(ManagementReply::Conflict { name: post.name });
            return;
        }
        let state = PersistedState {
            handler_type: Some(post.handler_type),
            query: Some(post.query),
            mode: post.mode,
            enabled: post.enabled,
            emit_enabled: Some(post.emit_enabled),
            checkpoints_disabled: Some(!post.checkpoints_enabled),
            track_emitted_streams: Some(post.track_emitted_streams),
            epoch: Some(-1),
            version: Some(version),
            run_as: post.enable_run_as.then(|| post.run_as.into()),
            ..Default::default()
        };
        let worker_index = self.next_worker_index();
        let id = self.create_managed_projection(post.name.clone(), projection_id, worker_index, None);
        self.with_projection(id, |projection| projection.initialize_new(state, envelope));
    }

    /// Run `f` against the projection with correlation id `id`, logging its error.
    fn with_projection<F>(&mut self, id: Uuid, f: F)
    where
        F: FnOnce(&mut ManagedProjection) -> Result<()>,
    {
        let Some(projection) = self
            .projections_map
            .get(&id)
            .and_then(|name| self.projections.get_mut(name))
        else {
            debug!(id = %id, "No managed projection for correlation id");
            return;
        };
        if let Err(e) = f(projection) {
            log_projection_error(projection.name(), &e);
        }
    }

    // ------------------------------------------------------------------
    // Bootstrap
    // ------------------------------------------------------------------

    fn start_existing_projections(&mut self) {
        let log = self.log.clone();
        self.spawn_io(async move {
            IoCompletion::RegistryRead(bootstrap::read_registry(log.as_ref()).await)
        });
    }

    fn registry_read(&mut self, snapshot: RegistrySnapshot) {
        if snapshot.empty {
            info!("Projections registry is empty, initializing");
            let log = self.log.clone();
            self.spawn_io(async move {
                IoCompletion::RegistryInitialized(bootstrap::write_initialized(log.as_ref()).await)
            });
            return;
        }
        info!(count = snapshot.projections.len(), "Loading existing projections");
        for (name, event_number) in snapshot.projections {
            if self.projections.contains_key(&name) {
                continue;
            }
            let projection_id = bootstrap::registry_projection_id(event_number);
            let worker_index = self.next_worker_index();
            let id = self.create_managed_projection(name, projection_id, worker_index, None);
            self.with_projection(id, |projection| {
                projection.initialize_existing();
                Ok(())
            });
        }
        if self.settings.initialize_system_projections {
            self.create_missing_system_projections();
        }
        self.projections_ready();
    }

    fn registry_initialized(&mut self, completed: WriteEventsCompleted) {
        match completed.result {
            OperationResult::Success => {
                self.projections_ready();
                if self.settings.initialize_system_projections {
                    self.create_missing_system_projections();
                }
            }
            result => {
                error!(result = %result, "Cannot initialize the projections registry");
            }
        }
    }

    fn create_missing_system_projections(&mut self) {
        for (name, handler, query) in bootstrap::SYSTEM_PROJECTIONS {
            if self.projections.contains_key(name) {
                continue;
            }
            let post = Post {
                name: name.to_string(),
                mode: ProjectionMode::Continuous,
                handler_type: format!("native:{}", handler),
                query: query.to_string(),
                enabled: false,
                checkpoints_enabled: true,
                emit_enabled: true,
                track_emitted_streams: false,
                enable_run_as: true,
                run_as: RunAs::System,
            };
            self.post(post, Envelope::noop());
        }
    }

    // ------------------------------------------------------------------
    // Worker responses and I/O
    // ------------------------------------------------------------------

    fn handle_response(&mut self, response: CoreResponse) {
        let id = match &response {
            CoreResponse::State(report) => {
                self.dispatchers.state.handle(report.clone());
                return;
            }
            CoreResponse::Result(report) => {
                self.dispatchers.result.handle(report.clone());
                return;
            }
            CoreResponse::SlaveProjectionReaderAssigned {
                id,
                subscription_id,
            } => {
                self.slave_reader_assigned(*id, *subscription_id);
                return;
            }
            CoreResponse::WorkerStarted { id } => {
                debug!(worker_id = %id, "Worker started");
                return;
            }
            CoreResponse::Prepared { id, .. }
            | CoreResponse::Started { id }
            | CoreResponse::Stopped { id, .. }
            | CoreResponse::Faulted { id, .. }
            | CoreResponse::StatisticsReport { id, .. } => *id,
        };
        let faulted = matches!(response, CoreResponse::Faulted { .. });
        self.with_projection(id, |projection| projection.handle_report(response));
        if faulted && let Some(name) = self.projections_map.get(&id) {
            let reason = format!("Slave projection '{}' faulted before its reader was assigned", name);
            self.slaves.fail(id, reason);
        }
    }

    fn handle_io(&mut self, completion: IoCompletion) {
        match completion {
            IoCompletion::Projection { id, io } => {
                self.with_projection(id, |projection| projection.handle_io(io))
            }
            IoCompletion::DefinitionChecked {
                post,
                envelope,
                result,
            } => match result {
                Ok(slice) => self.definition_checked(post, envelope, slice),
                Err(e) => {
                    error!(projection = %post.name, error = %e, "Failed to read projection definition");
                    envelope.reply(ManagementReply::from_error(&e));
                }
            },
            IoCompletion::Registered {
                post,
                envelope,
                version,
                result,
            } => match result {
                Ok(completed) if completed.result == OperationResult::Success => {
                    self.create_posted(post, envelope, version, completed.first_event_number)
                }
                Ok(completed) => {
                    envelope.reply(ManagementReply::OperationFailed {
                        reason: format!(
                            "The projection '{}' could not be created because the registration could not be written due to {}",
                            post.name, completed.result
                        ),
                    });
                }
                Err(e) => {
                    error!(projection = %post.name, error = %e, "Failed to register projection");
                    envelope.reply(ManagementReply::from_error(&e));
                }
            },
            IoCompletion::RegistryRead(result) => match result {
                Ok(snapshot) => self.registry_read(snapshot),
                Err(e) => error!(error = %e, "Failed to read the projections registry"),
            },
            IoCompletion::RegistryInitialized(result) => match result {
                Ok(completed) => self.registry_initialized(completed),
                Err(e) => error!(error = %e, "Failed to initialize the projections registry"),
            },
            IoCompletion::DeletionRegistered { name, id, result } => {
                match result {
                    Ok(completed) if completed.result == OperationResult::Success => {}
                    Ok(completed) => {
                        error!(projection = %name, result = %completed.result, "Projection deletion could not be registered")
                    }
                    Err(e) => {
                        error!(projection = %name, error = %e, "Projection deletion could not be registered")
                    }
                }
                self.remove_projection(&name, id);
            }
        }
    }
}

fn log_projection_error(name: &str, err: &ProjectionError) {
    if err.is_fatal() {
        error!(projection = %name, error = %err, code = err.error_code(), "Projection failed");
    } else {
        warn!(projection = %name, error = %err, code = err.error_code(), "Projection command rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::InMemoryEventLog;

    #[test]
    fn test_spawn_requires_a_worker() {
        let (output, _commands) = mpsc::unbounded_channel::<WorkerCommand>();
        let services = ManagerServices::new(Arc::new(InMemoryEventLog::new()), Arc::new(output));

        let result = spawn(ManagerSettings::new(Vec::new()), services);

        assert!(matches!(result, Err(ConfigError::Invalid("workers", _))));
    }

    #[test]
    fn test_settings_defaults() {
        let settings = ManagerSettings::new(vec![Uuid::new_v4()]);
        assert_eq!(settings.run_projections, RunProjections::System);
        assert_eq!(settings.query_expiry, Duration::from_secs(300));
        assert_eq!(settings.expiry_interval, Duration::from_secs(60));
        assert!(settings.initialize_system_projections);
    }
}
