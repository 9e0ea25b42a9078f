// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Managed projection: the per-projection lifecycle state machine.
//!
//! A managed projection is owned by the manager actor and mutated only from
//! the manager's mailbox. Storage I/O runs in spawned tasks whose completions
//! are posted back to the manager and handed to [`ManagedProjection::handle_io`].
//!
//! ```text
//!  Creating/Loaded ──prepare──► Preparing ──$prepared──► Prepared
//!                                                          │
//!                               enabled & allowed to run ──┼── otherwise
//!                                                          ▼            ▼
//!                                          Starting ──► Running   LoadingStopped ──► Stopped
//!                                              │            │
//!                                         stop │       stop │ abort
//!                                              ▼            ▼
//!                                           Stopping    Aborting ──► Aborted
//! ```

mod deletion;
mod persisted;
mod state;

pub use persisted::PersistedState;
pub use state::ManagedProjectionState;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::Publisher;
use crate::dispatcher::CorrelationDispatcher;
use crate::error::{ProjectionError, Result};
use crate::event_log::{
    EventLog, ExpectedVersion, NewEvent, OperationResult, ReadStreamResult, ReadStreamSlice,
    WriteEventsCompleted,
};
use crate::manager::{IoCompletion, ManagerMessage};
use crate::messages::management::{
    Delete, Envelope, ManagementReply, ProjectionSettings, SetRunAsAction, UpdateQuery,
};
use crate::messages::worker::{
    CoreCommand, CoreResponse, CreateProjection, ResultReport, StateReport, WorkerCommand,
};
use crate::model::{ProjectionConfig, ProjectionMode, ProjectionStatistics, ProjectionVersion, RunAs};
use crate::names::{self, event_types};

use ManagedProjectionState::*;

const ABORTED_BY_SUBSEQUENT_OPERATION: &str = "Aborted by subsequent operation";

/// Emitted every time a managed projection changes state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionStateChanged {
    /// Projection name.
    pub name: String,
    /// Correlation id of the managed projection.
    pub id: Uuid,
    /// New state.
    pub state: ManagedProjectionState,
}

/// Collaborators shared by every managed projection of one manager.
#[derive(Clone)]
pub(crate) struct ProjectionServices {
    pub(crate) log: Arc<dyn EventLog>,
    pub(crate) inbox: mpsc::UnboundedSender<ManagerMessage>,
    pub(crate) output: Arc<dyn Publisher<WorkerCommand>>,
    pub(crate) generation: u64,
    pub(crate) state_listener: Option<Arc<dyn Publisher<ProjectionStateChanged>>>,
}

impl ProjectionServices {
    /// Run `io` in the background and post its outcome to the manager.
    fn spawn<F>(&self, id: Uuid, io: F)
    where
        F: Future<Output = ProjectionIo> + Send + 'static,
    {
        let inbox = self.inbox.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let io = io.await;
            inbox.publish(ManagerMessage::Io {
                generation,
                completion: IoCompletion::Projection { id, io },
            });
        });
    }
}

/// Dispatchers for live partition queries answered by workers.
pub(crate) struct QueryDispatchers {
    pub(crate) state: CorrelationDispatcher<WorkerCommand, StateReport>,
    pub(crate) result: CorrelationDispatcher<WorkerCommand, ResultReport>,
}

impl QueryDispatchers {
    pub(crate) fn new(output: Arc<dyn Publisher<WorkerCommand>>) -> Self {
        Self {
            state: CorrelationDispatcher::new(output.clone()),
            result: CorrelationDispatcher::new(output),
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        self.state.cancel_all();
        self.result.cancel_all();
    }
}

/// Completed storage I/O of a managed projection.
#[derive(Debug)]
pub(crate) enum ProjectionIo {
    DefinitionLoaded(Result<ReadStreamSlice>),
    Written(Result<WriteEventsCompleted>),
    CleanupFinished { stream: String, result: Result<()> },
}

/// Master a slave projection reports to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlaveMaster {
    pub(crate) master_worker_id: Uuid,
    pub(crate) master_correlation_id: Uuid,
}

/// Identity and placement of a new managed projection.
#[derive(Debug, Clone)]
pub(crate) struct ProjectionParams {
    pub(crate) id: Uuid,
    pub(crate) worker_id: Uuid,
    pub(crate) projection_id: i64,
    pub(crate) name: String,
    pub(crate) enabled_to_run: bool,
    pub(crate) query_expiry: Duration,
    pub(crate) slave: Option<SlaveMaster>,
}

/// A definition snapshot on its way to the definition stream.
struct InFlightWrite {
    event: NewEvent,
    version: Option<i64>,
    then_start: bool,
}

pub(crate) struct ManagedProjection {
    id: Uuid,
    worker_id: Uuid,
    projection_id: i64,
    name: String,
    enabled_to_run: bool,
    query_expiry: Duration,
    slave: Option<SlaveMaster>,

    state: ManagedProjectionState,
    persisted: PersistedState,
    persisted_loaded: bool,
    run_as: RunAs,
    pending_write: bool,
    in_flight_write: Option<InFlightWrite>,
    /// A write requested while another was in flight; `Some(then_start)`.
    queued_write: Option<bool>,
    last_written_version: i64,
    prepared: bool,
    created: bool,
    streams_deletion_started: bool,

    last_reply: Option<Envelope>,
    last_statistics: Option<ProjectionStatistics>,
    fault_reason: Option<String>,
    last_accessed: Instant,

    services: ProjectionServices,
}

/// Reply with the failure and hand the error back to the caller.
fn reject(envelope: Envelope, err: ProjectionError) -> Result<()> {
    envelope.reply(ManagementReply::from_error(&err));
    Err(err)
}

impl ManagedProjection {
    pub(crate) fn new(params: ProjectionParams, services: ProjectionServices) -> Self {
        let projection = Self {
            id: params.id,
            worker_id: params.worker_id,
            projection_id: params.projection_id,
            name: params.name,
            enabled_to_run: params.enabled_to_run,
            query_expiry: params.query_expiry,
            slave: params.slave,
            state: Creating,
            persisted: PersistedState::default(),
            persisted_loaded: false,
            run_as: RunAs::Anonymous,
            pending_write: false,
            in_flight_write: None,
            queued_write: None,
            last_written_version: -1,
            prepared: false,
            created: false,
            streams_deletion_started: false,
            last_reply: None,
            last_statistics: None,
            fault_reason: None,
            last_accessed: Instant::now(),
            services,
        };
        projection.notify_state();
        projection
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn mode(&self) -> ProjectionMode {
        self.persisted.mode
    }

    pub(crate) fn run_as(&self) -> &RunAs {
        &self.run_as
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.persisted.deleted
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ManagedProjectionState {
        self.state
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    /// Start a projection from a freshly posted definition.
    pub(crate) fn initialize_new(&mut self, state: PersistedState, envelope: Envelope) -> Result<()> {
        if let Err(e) = self.load_persisted_state(state) {
            return reject(envelope, e);
        }
        self.update_version(false)?;
        self.pending_write = true;
        self.set_reply(Some(envelope));
        self.prepare_or_write()
    }

    /// Load the latest snapshot from the definition stream.
    pub(crate) fn initialize_existing(&mut self) {
        self.set_state(Loading);
        let log = self.services.log.clone();
        let stream = names::definition_stream(&self.name);
        self.services.spawn(self.id, async move {
            ProjectionIo::DefinitionLoaded(log.read_backward(&stream, -1, 1).await)
        });
    }

    fn definition_loaded(&mut self, slice: ReadStreamSlice) -> Result<()> {
        let event = match slice.events.as_slice() {
            [event] if slice.result == ReadStreamResult::Success => event,
            _ => {
                self.set_state(Creating);
                debug!(
                    projection = %self.name,
                    "No definition found, projection stays in Creating state"
                );
                return Ok(());
            }
        };

        let mut persisted: PersistedState = serde_json::from_slice(&event.data).map_err(|e| {
            ProjectionError::fatal(format!("malformed persisted state of '{}': {}", self.name, e))
        })?;
        self.last_written_version = event.event_number;
        if persisted.version.is_none() {
            persisted.version = Some(event.event_number);
            persisted.epoch = Some(-1);
        }
        if persisted
            .version
            .is_some_and(|version| version < self.last_written_version)
        {
            persisted.version = Some(self.last_written_version);
        }
        if persisted
            .run_as
            .as_ref()
            .is_none_or(|run_as| run_as.name.as_deref().unwrap_or("").is_empty())
        {
            persisted.run_as = Some(RunAs::System.into());
        }

        self.load_persisted_state(persisted)?;
        self.set_state(Loaded);
        self.pending_write = false;
        self.set_reply(None);
        self.prepare_or_write()
    }

    fn load_persisted_state(&mut self, persisted: PersistedState) -> Result<()> {
        persisted.validate()?;
        if !matches!(self.state, Creating | Loading) {
            return Err(ProjectionError::invalid_operation(
                "Loading persisted state is not allowed in this state",
            ));
        }
        self.run_as = persisted.principal();
        self.persisted = persisted;
        self.persisted_loaded = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Client commands
    // ------------------------------------------------------------------

    pub(crate) fn get_state(
        &mut self,
        partition: String,
        envelope: Envelope,
        dispatchers: &mut QueryDispatchers,
    ) {
        self.touch();
        if self.state < Running {
            envelope.reply(ManagementReply::ProjectionState {
                name: self.name.clone(),
                partition,
                state: String::new(),
                position: None,
            });
            return;
        }
        let correlation_id = Uuid::new_v4();
        let name = self.name.clone();
        let request = self.worker_command(CoreCommand::GetState {
            correlation_id,
            id: self.id,
            partition,
        });
        dispatchers
            .state
            .publish(correlation_id, request, move |report: StateReport| {
                envelope.reply(ManagementReply::ProjectionState {
                    name,
                    partition: report.partition,
                    state: report.state.unwrap_or_default(),
                    position: report.position,
                });
            });
    }

    pub(crate) fn get_result(
        &mut self,
        partition: String,
        envelope: Envelope,
        dispatchers: &mut QueryDispatchers,
    ) {
        self.touch();
        if self.state < Running {
            envelope.reply(ManagementReply::ProjectionResult {
                name: self.name.clone(),
                partition,
                result: String::new(),
                position: None,
            });
            return;
        }
        let correlation_id = Uuid::new_v4();
        let name = self.name.clone();
        let request = self.worker_command(CoreCommand::GetResult {
            correlation_id,
            id: self.id,
            partition,
        });
        dispatchers
            .result
            .publish(correlation_id, request, move |report: ResultReport| {
                envelope.reply(ManagementReply::ProjectionResult {
                    name,
                    partition: report.partition,
                    result: report.result.unwrap_or_default(),
                    position: report.position,
                });
            });
    }

    pub(crate) fn get_query(&mut self, envelope: Envelope) {
        self.touch();
        let source_definition = self.persisted.source_definition.clone();
        let result_stream_name = source_definition.as_ref().map(|source| {
            source
                .result_stream_name
                .clone()
                .unwrap_or_else(|| names::result_stream(&self.name))
        });
        envelope.reply(ManagementReply::ProjectionQuery {
            name: self.name.clone(),
            query: self.persisted.query.clone().unwrap_or_default(),
            emit_enabled: self.persisted.emit_enabled(),
            source_definition,
            result_stream_name,
        });
    }

    pub(crate) fn update_query(&mut self, message: UpdateQuery, envelope: Envelope) -> Result<()> {
        self.touch();
        if let Err(e) = self.ensure_stoppable() {
            return reject(envelope, e);
        }
        if self.state == Completed
            && let Err(e) = self.reset_epoch()
        {
            return reject(envelope, e);
        }
        info!(
            projection = %self.name,
            handler_type = ?message.handler_type,
            "Updating projection source"
        );
        self.prepared = false;
        if let Some(handler_type) = message.handler_type {
            self.persisted.handler_type = Some(handler_type);
        }
        self.persisted.query = Some(message.query);
        if let Some(emit_enabled) = message.emit_enabled {
            self.persisted.emit_enabled = Some(emit_enabled);
        }
        self.pending_write = true;
        self.update_version(false)?;
        self.set_reply(Some(envelope));
        self.stop_unless_prepared_or_loaded()
    }

    pub(crate) fn disable(&mut self, envelope: Envelope) -> Result<()> {
        self.touch();
        if let Err(e) = self.ensure_stoppable() {
            return reject(envelope, e);
        }
        self.set_reply(Some(envelope));
        self.mark_disabled();
        self.update_version(false)?;
        self.stop_unless_prepared_or_loaded()
    }

    pub(crate) fn abort(&mut self, envelope: Envelope) -> Result<()> {
        self.touch();
        if let Err(e) = self.ensure_abortable() {
            return reject(envelope, e);
        }
        self.update_version(false)?;
        self.set_reply(Some(envelope));
        self.mark_disabled();
        self.kill_unless_stopped()
    }

    pub(crate) fn enable(&mut self, envelope: Envelope) -> Result<()> {
        self.touch();
        if self.persisted.enabled
            && !matches!(
                self.state,
                Completed | Faulted | Aborted | Loaded | Prepared | Stopped
            )
        {
            envelope.reply(ManagementReply::Updated {
                name: self.name.clone(),
            });
            return Ok(());
        }
        if let Err(e) = self.ensure_stoppable() {
            return reject(envelope, e);
        }
        self.persisted.enabled = true;
        self.pending_write = true;
        self.update_version(false)?;
        self.set_reply(Some(envelope));
        self.stop_unless_prepared_or_loaded()
    }

    pub(crate) fn set_run_as(
        &mut self,
        action: SetRunAsAction,
        run_as: RunAs,
        envelope: Envelope,
    ) -> Result<()> {
        self.touch();
        if let Err(e) = self.ensure_stoppable() {
            return reject(envelope, e);
        }
        self.prepared = false;
        self.persisted.run_as = match action {
            SetRunAsAction::Set => Some(run_as.into()),
            SetRunAsAction::Clear => None,
        };
        self.run_as = self.persisted.principal();
        self.pending_write = true;
        self.update_version(false)?;
        self.set_reply(Some(envelope));
        self.stop_unless_prepared_or_loaded()
    }

    pub(crate) fn delete(&mut self, message: Delete, envelope: Envelope) -> Result<()> {
        if !matches!(self.state, Stopped | Faulted) && self.mode() != ProjectionMode::Transient {
            return reject(
                envelope,
                ProjectionError::invalid_operation(
                    "Cannot delete a projection that hasn't been stopped or faulted.",
                ),
            );
        }
        if matches!(self.state, Creating | Loading) {
            return reject(envelope, self.cannot_stop());
        }
        self.touch();
        if self.persisted.deleting {
            // Cleanups are already counted; the latest caller gets the final reply.
            self.set_reply(Some(envelope));
            return Ok(());
        }

        self.persisted.delete_checkpoint_stream = message.delete_checkpoint_stream;
        self.persisted.delete_state_stream = message.delete_state_stream;
        self.persisted.delete_emitted_streams = message.delete_emitted_streams;
        self.persisted.prerequisites_remaining_for_deletion = self.deletion_cleanups();

        self.persisted.enabled = false;
        self.persisted.deleted = false;
        self.persisted.deleting = true;
        self.pending_write = true;
        self.update_version(false)?;
        self.set_reply(Some(envelope));
        self.set_state(Deleting);
        self.stop_unless_prepared_or_loaded()
    }

    pub(crate) fn get_config(&mut self, envelope: Envelope) {
        self.touch();
        envelope.reply(ManagementReply::ProjectionConfig {
            name: self.name.clone(),
            settings: self.persisted.settings(),
        });
    }

    pub(crate) fn update_config(
        &mut self,
        settings: ProjectionSettings,
        envelope: Envelope,
    ) -> Result<()> {
        if !matches!(self.state, Stopped | Faulted) && self.mode() != ProjectionMode::Transient {
            return reject(
                envelope,
                ProjectionError::invalid_operation(
                    "Cannot update the config of a projection that hasn't been stopped or faulted.",
                ),
            );
        }
        self.touch();
        self.persisted.apply_settings(&settings);
        self.update_version(false)?;
        self.pending_write = true;
        self.write_persisted_state(false)?;
        envelope.reply(ManagementReply::Updated {
            name: self.name.clone(),
        });
        Ok(())
    }

    pub(crate) fn reset(&mut self, envelope: Envelope) -> Result<()> {
        self.touch();
        if let Err(e) = self.ensure_stoppable() {
            return reject(envelope, e);
        }
        if let Err(e) = self.reset_epoch() {
            return reject(envelope, e);
        }
        self.prepared = false;
        self.pending_write = true;
        self.update_version(false)?;
        self.set_reply(Some(envelope));
        self.stop_unless_prepared_or_loaded()
    }

    /// Whether an unused transient projection is due for deletion.
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.mode() == ProjectionMode::Transient
            && self.slave.is_none()
            && self.persisted_loaded
            && self.last_accessed + self.query_expiry < now
    }

    pub(crate) fn cleanup_expired(&mut self, now: Instant) -> Result<()> {
        // Stopping in Creating is not supported, so those wait for the next sweep.
        if !self.is_expired(now) || self.state == Creating || self.persisted.deleting {
            return Ok(());
        }
        warn!(
            projection = %self.name,
            idle_secs = now.duration_since(self.last_accessed).as_secs(),
            "Transient projection has expired and will be deleted"
        );
        self.delete(
            Delete {
                name: self.name.clone(),
                run_as: RunAs::System,
                ..Default::default()
            },
            Envelope::noop(),
        )
    }

    /// Statistics as reported by the worker, overlaid with the lifecycle state.
    pub(crate) fn statistics(&self) -> ProjectionStatistics {
        let state_name = self.state.to_string();
        let mut statistics = match &self.last_statistics {
            None => ProjectionStatistics {
                name: self.name.clone(),
                projection_id: self.projection_id,
                epoch: -1,
                version: -1,
                mode: Some(self.mode()),
                status: state_name,
                ..Default::default()
            },
            Some(reported) => {
                let mut statistics = reported.clone();
                statistics.name = self.name.clone();
                statistics.projection_id = self.projection_id;
                statistics.mode = Some(self.mode());
                let suffix = if matches!(self.state, Stopped | Faulted) && self.persisted.enabled {
                    " (Enabled)"
                } else {
                    ""
                };
                let status = if reported.status == "Stopped" && self.state == Completed {
                    state_name
                } else if !reported.status.starts_with(&state_name) {
                    format!("{}/{}", state_name, reported.status)
                } else {
                    reported.status.clone()
                };
                statistics.status = format!("{}{}", status, suffix);
                statistics
            }
        };
        if self.state == Faulted {
            statistics.state_reason = self.fault_reason.clone().unwrap_or_default();
        }
        statistics.enabled = self.persisted.enabled;
        statistics
    }

    // ------------------------------------------------------------------
    // Worker reports and I/O completions
    // ------------------------------------------------------------------

    pub(crate) fn handle_report(&mut self, report: CoreResponse) -> Result<()> {
        match (self.state, report) {
            (_, CoreResponse::StatisticsReport { statistics, .. }) => {
                self.last_statistics = Some(statistics);
                Ok(())
            }
            (Deleting, report) => {
                debug!(projection = %self.name, report = report.kind(), "Ignoring report while deleting");
                Ok(())
            }
            (Preparing, CoreResponse::Prepared { source_definition, .. }) => {
                self.persisted.source_definition = Some(source_definition);
                self.prepared = true;
                self.created = true;
                self.set_state(Prepared);
                self.write_start_or_load_stopped()
            }
            (Preparing | Starting | LoadingStopped, CoreResponse::Faulted { fault_message, .. }) => {
                self.fault(fault_message);
                self.reply();
                Ok(())
            }
            (Starting, CoreResponse::Started { .. }) => {
                self.set_state(Running);
                self.reply();
                Ok(())
            }
            (Running, CoreResponse::Stopped { completed, .. }) => {
                self.set_state(if completed { Completed } else { Stopped });
                Ok(())
            }
            (Running, CoreResponse::Faulted { fault_message, .. }) => {
                self.fault(fault_message);
                Ok(())
            }
            (Stopping, CoreResponse::Stopped { completed, .. }) => {
                self.set_state(if completed { Completed } else { Stopped });
                self.prepare_or_write()
            }
            (Aborting, CoreResponse::Stopped { .. }) => {
                self.set_state(Aborted);
                self.prepare_or_write()
            }
            (Stopping | Aborting, CoreResponse::Faulted { fault_message, .. }) => {
                self.fault(fault_message);
                self.prepare_or_write()
            }
            (LoadingStopped, CoreResponse::Stopped { completed, .. }) => {
                if self.persisted.deleting {
                    self.set_state(Deleting);
                    self.begin_stream_deletion();
                } else {
                    self.set_state(if completed { Completed } else { Stopped });
                    self.reply();
                }
                Ok(())
            }
            (state, report) => {
                self.fault(format!(
                    "Unexpected '{}' message in {} state",
                    report.kind(),
                    state
                ));
                Ok(())
            }
        }
    }

    pub(crate) fn handle_io(&mut self, io: ProjectionIo) -> Result<()> {
        match io {
            ProjectionIo::DefinitionLoaded(result) => self.definition_loaded(result?),
            ProjectionIo::Written(result) => self.write_completed(result),
            ProjectionIo::CleanupFinished { stream, result } => self.cleanup_finished(stream, result),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle steps
    // ------------------------------------------------------------------

    fn prepare_or_write(&mut self) -> Result<()> {
        if self.state == Prepared {
            return self.write_start_or_load_stopped();
        }
        let runnable = self.persisted.enabled && self.enabled_to_run;
        if self.prepared && self.created && !runnable {
            return self.write_start_or_load_stopped();
        }

        let config = self.persisted.projection_config(self.slave.is_some());
        let command = if !runnable && !self.pending_write {
            self.create_prepared(config)?
        } else {
            self.create_and_prepare(config)
        };
        if self.state >= Preparing {
            self.dispose_core_projection();
            self.set_state(Loaded);
        }
        self.set_state(Preparing);
        self.publish(command);
        Ok(())
    }

    fn create_projection(&self, config: ProjectionConfig, default_version: i64) -> CreateProjection {
        CreateProjection {
            id: self.id,
            name: self.name.clone(),
            version: ProjectionVersion {
                projection_id: self.projection_id,
                epoch: self.persisted.epoch.unwrap_or(0),
                version: self.persisted.version.unwrap_or(default_version),
            },
            config,
            handler_type: self.persisted.handler_type.clone().unwrap_or_default(),
            query: self.persisted.query.clone().unwrap_or_default(),
        }
    }

    fn create_and_prepare(&self, config: ProjectionConfig) -> CoreCommand {
        let projection = self.create_projection(config, 0);
        match self.slave {
            Some(master) => CoreCommand::CreateAndPrepareSlave {
                projection,
                master_worker_id: master.master_worker_id,
                master_correlation_id: master.master_correlation_id,
            },
            None => CoreCommand::CreateAndPrepare(projection),
        }
    }

    fn create_prepared(&self, config: ProjectionConfig) -> Result<CoreCommand> {
        let Some(source_definition) = self.persisted.source_definition.clone() else {
            return Err(ProjectionError::fatal(
                "The projection cannot be loaded as stopped as it has no source definition. \
                 Update the projection query text to force prepare",
            ));
        };
        Ok(CoreCommand::CreatePrepared {
            projection: self.create_projection(config, 1),
            source_definition,
        })
    }

    fn write_start_or_load_stopped(&mut self) -> Result<()> {
        if self.pending_write {
            self.write_persisted_state(true)
        } else {
            self.start_or_load_stopped()
        }
    }

    fn start_or_load_stopped(&mut self) -> Result<()> {
        match self.state {
            Prepared if self.persisted.enabled && self.enabled_to_run => {
                self.set_state(Starting);
                self.publish(CoreCommand::Start { id: self.id });
            }
            Prepared => {
                self.set_state(LoadingStopped);
                self.publish(CoreCommand::LoadStopped { id: self.id });
            }
            Aborted | Completed | Faulted | Stopped => self.reply(),
            Deleting => self.begin_stream_deletion(),
            state => {
                return Err(ProjectionError::fatal(format!(
                    "Cannot start or load '{}' in the {} state",
                    self.name, state
                )));
            }
        }
        Ok(())
    }

    fn stop_unless_prepared_or_loaded(&mut self) -> Result<()> {
        match self.state {
            Prepared | Loaded | Deleting => self.prepare_or_write(),
            Stopped | Completed | Aborted | Faulted => {
                self.set_state(Stopped);
                self.prepare_or_write()
            }
            Stopping | Aborting => Ok(()),
            Running | Starting => {
                self.set_state(Stopping);
                self.publish(CoreCommand::Stop { id: self.id });
                Ok(())
            }
            Creating | Loading | Preparing | LoadingStopped => Err(self.cannot_stop()),
        }
    }

    fn kill_unless_stopped(&mut self) -> Result<()> {
        match self.state {
            Stopped | Completed | Aborted | Faulted | Loaded => self.prepare_or_write(),
            Stopping | Running | Starting => {
                self.set_state(Aborting);
                self.publish(CoreCommand::Kill { id: self.id });
                Ok(())
            }
            Aborting => Ok(()),
            Creating | Loading | Preparing | Prepared | LoadingStopped | Deleting => {
                Err(self.cannot_stop())
            }
        }
    }

    fn ensure_stoppable(&self) -> Result<()> {
        match self.state {
            Creating | Loading | Preparing | LoadingStopped => Err(self.cannot_stop()),
            _ => Ok(()),
        }
    }

    fn ensure_abortable(&self) -> Result<()> {
        match self.state {
            Creating | Loading | Preparing | Prepared | LoadingStopped | Deleting => {
                Err(self.cannot_stop())
            }
            _ => Ok(()),
        }
    }

    fn cannot_stop(&self) -> ProjectionError {
        ProjectionError::invalid_operation(format!(
            "Cannot stop a projection in the '{}' state",
            self.state
        ))
    }

    fn mark_disabled(&mut self) {
        self.persisted.enabled = false;
        self.pending_write = true;
    }

    fn fault(&mut self, reason: String) {
        error!(projection = %self.name, reason = %reason, "Projection faulted");
        self.fault_reason = Some(reason);
        self.set_state(Faulted);
    }

    fn dispose_core_projection(&mut self) {
        self.created = false;
        self.publish(CoreCommand::Dispose { id: self.id });
    }

    // ------------------------------------------------------------------
    // Versioning and persisted-state writes
    // ------------------------------------------------------------------

    /// Bump the version if the current one has been written. A forced bump
    /// of an unwritten version is a contract violation.
    fn update_version(&mut self, force: bool) -> Result<()> {
        match self.persisted.version {
            Some(version) if version == self.last_written_version => {
                self.persisted.version = Some(version + 1);
                Ok(())
            }
            _ if force => Err(ProjectionError::fatal(
                "projection definition must be saved before forced updating version",
            )),
            _ => Ok(()),
        }
    }

    fn reset_epoch(&mut self) -> Result<()> {
        self.update_version(true)?;
        self.persisted.epoch = self.persisted.version;
        Ok(())
    }

    /// Append the snapshot; `then_start` continues with start-or-load-stopped
    /// once it lands.
    ///
    /// Writes never overlap. A request made while a write is in flight is
    /// folded into a single queued write, submitted once the current one
    /// lands, so every continuation stays bound to its own write.
    fn write_persisted_state(&mut self, then_start: bool) -> Result<()> {
        if self.mode() == ProjectionMode::Transient {
            self.last_written_version = self.persisted.version.unwrap_or(-1);
            return if then_start {
                self.start_or_load_stopped()
            } else {
                Ok(())
            };
        }
        if self.in_flight_write.is_some() {
            debug!(projection = %self.name, then_start, "Projection source write queued");
            self.queued_write = Some(self.queued_write.unwrap_or(false) || then_start);
            return Ok(());
        }
        self.write_snapshot(then_start)
    }

    fn write_snapshot(&mut self, then_start: bool) -> Result<()> {
        // The previous snapshot may have landed since the caller bumped.
        self.update_version(false)?;
        let event = NewEvent::json(
            event_types::PROJECTION_UPDATED,
            serde_json::to_vec(&self.persisted)?,
        );
        self.submit_write(InFlightWrite {
            event,
            version: self.persisted.version,
            then_start,
        });
        Ok(())
    }

    fn submit_write(&mut self, write: InFlightWrite) {
        let log = self.services.log.clone();
        let stream = names::definition_stream(&self.name);
        let event = write.event.clone();
        self.in_flight_write = Some(write);
        self.services.spawn(self.id, async move {
            ProjectionIo::Written(log.append(&stream, ExpectedVersion::Any, vec![event]).await)
        });
    }

    fn write_completed(&mut self, result: Result<WriteEventsCompleted>) -> Result<()> {
        let Some(write) = self.in_flight_write.take() else {
            error!(projection = %self.name, "Projection definition write completed in non writing state");
            return Ok(());
        };
        let completed = result?;
        match completed.result {
            OperationResult::Success => {
                info!(projection = %self.name, "Projection source has been written");
                let written = completed.first_event_number;
                let version = write.version.unwrap_or(written);
                if written != version {
                    return Err(ProjectionError::fatal(
                        "Projection version and event number mismatch",
                    ));
                }
                self.last_written_version = version;
                let queued = self.queued_write.take();
                self.pending_write = queued.is_some();
                let continued = if write.then_start {
                    self.start_or_load_stopped()
                } else {
                    Ok(())
                };
                if let Some(then_start) = queued {
                    self.write_snapshot(then_start)?;
                }
                continued
            }
            code if code.is_transient() => {
                info!(projection = %self.name, result = %code, "Projection source has not been written, retrying");
                self.submit_write(write);
                Ok(())
            }
            code => Err(ProjectionError::fatal(format!(
                "Unsupported error code received: {}",
                code
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    fn deletion_cleanups(&self) -> i32 {
        let emit = self.persisted.emit_enabled();
        let mut count = 0;
        if self.persisted.delete_checkpoint_stream {
            count += 1;
        }
        if emit && self.persisted.track_emitted_streams() && self.persisted.delete_emitted_streams {
            count += 1;
        }
        if emit && self.persisted.is_multi_stream() {
            count += 1;
        }
        count
    }

    fn begin_stream_deletion(&mut self) {
        if self.streams_deletion_started {
            return;
        }
        self.streams_deletion_started = true;
        let emit = self.persisted.emit_enabled();

        if emit && self.persisted.is_multi_stream() {
            self.spawn_stream_cleanup(names::order_stream(&self.name));
        }
        if self.persisted.delete_checkpoint_stream {
            self.spawn_stream_cleanup(names::checkpoint_stream(&self.name));
        }
        if emit && self.persisted.track_emitted_streams() && self.persisted.delete_emitted_streams {
            let log = self.services.log.clone();
            let name = self.name.clone();
            let stream = names::emitted_streams_stream(&name);
            self.services.spawn(self.id, async move {
                let result = deletion::delete_emitted_streams(log, name).await;
                ProjectionIo::CleanupFinished { stream, result }
            });
        }

        if self.persisted.prerequisites_remaining_for_deletion <= 0 {
            self.complete_deletion();
        }
    }

    fn spawn_stream_cleanup(&self, stream: String) {
        let log = self.services.log.clone();
        self.services.spawn(self.id, async move {
            let result = deletion::delete_stream(log.as_ref(), &stream).await;
            ProjectionIo::CleanupFinished { stream, result }
        });
    }

    fn cleanup_finished(&mut self, stream: String, result: Result<()>) -> Result<()> {
        result?;
        if !self.persisted.deleting {
            debug!(projection = %self.name, stream = %stream, "Cleanup finished after deletion completed");
            return Ok(());
        }
        self.persisted.prerequisites_remaining_for_deletion -= 1;
        debug!(
            projection = %self.name,
            stream = %stream,
            remaining = self.persisted.prerequisites_remaining_for_deletion,
            "Deletion cleanup finished"
        );
        if self.persisted.prerequisites_remaining_for_deletion <= 0 {
            self.complete_deletion();
        }
        Ok(())
    }

    fn complete_deletion(&mut self) {
        if !self.persisted.deleting {
            return;
        }
        self.persisted.deleted = true;
        self.persisted.deleting = false;
        info!(projection = %self.name, "Projection deleted");
        self.reply();
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn set_state(&mut self, state: ManagedProjectionState) {
        self.state = state;
        self.notify_state();
    }

    fn notify_state(&self) {
        if let Some(listener) = &self.services.state_listener {
            listener.publish(ProjectionStateChanged {
                name: self.name.clone(),
                id: self.id,
                state: self.state,
            });
        }
    }

    fn touch(&mut self) {
        self.last_accessed = Instant::now();
    }

    fn worker_command(&self, command: CoreCommand) -> WorkerCommand {
        WorkerCommand {
            worker_id: self.worker_id,
            command,
        }
    }

    fn publish(&self, command: CoreCommand) {
        self.services.output.publish(self.worker_command(command));
    }

    /// Only one caller waits for the outcome; a replaced caller is told so.
    fn set_reply(&mut self, envelope: Option<Envelope>) {
        if let Some(previous) = self.last_reply.take() {
            previous.reply(ManagementReply::OperationFailed {
                reason: ABORTED_BY_SUBSEQUENT_OPERATION.to_string(),
            });
        }
        self.last_reply = envelope;
    }

    fn reply(&mut self) {
        if let Some(envelope) = self.last_reply.take() {
            envelope.reply(ManagementReply::Updated {
                name: self.name.clone(),
            });
        }
        if self.persisted.deleted {
            self.dispose_core_projection();
            self.services.inbox.publish(ManagerMessage::Deleted {
                name: self.name.clone(),
                id: self.id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::InMemoryEventLog;
    use crate::model::SourceDefinition;
    use tokio::sync::oneshot;

    struct Harness {
        log: Arc<InMemoryEventLog>,
        inbox: mpsc::UnboundedReceiver<ManagerMessage>,
        output: mpsc::UnboundedReceiver<WorkerCommand>,
        states: mpsc::UnboundedReceiver<ProjectionStateChanged>,
        dispatchers: QueryDispatchers,
        projection: ManagedProjection,
    }

    fn harness(name: &str, enabled_to_run: bool) -> Harness {
        let log = Arc::new(InMemoryEventLog::new());
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (output_tx, output) = mpsc::unbounded_channel();
        let (states_tx, states) = mpsc::unbounded_channel();
        let output_tx: Arc<dyn Publisher<WorkerCommand>> = Arc::new(output_tx);
        let services = ProjectionServices {
            log: log.clone(),
            inbox: inbox_tx,
            output: output_tx.clone(),
            generation: 0,
            state_listener: Some(Arc::new(states_tx)),
        };
        let projection = ManagedProjection::new(
            ProjectionParams {
                id: Uuid::new_v4(),
                worker_id: Uuid::new_v4(),
                projection_id: 1,
                name: name.to_string(),
                enabled_to_run,
                query_expiry: Duration::from_secs(300),
                slave: None,
            },
            services,
        );
        Harness {
            log,
            inbox,
            output,
            states,
            dispatchers: QueryDispatchers::new(output_tx),
            projection,
        }
    }

    fn definition(mode: ProjectionMode, enabled: bool) -> PersistedState {
        PersistedState {
            handler_type: Some("JS".to_string()),
            query: Some("fromAll()".to_string()),
            mode,
            enabled,
            epoch: Some(-1),
            version: Some(-1),
            run_as: Some(RunAs::System.into()),
            ..Default::default()
        }
    }

    impl Harness {
        async fn next_io(&mut self) -> ProjectionIo {
            loop {
                match self.inbox.recv().await.unwrap() {
                    ManagerMessage::Io {
                        completion: IoCompletion::Projection { io, .. },
                        ..
                    } => return io,
                    _ => continue,
                }
            }
        }

        async fn pump_io(&mut self) {
            let io = self.next_io().await;
            self.projection.handle_io(io).unwrap();
        }

        fn next_command(&mut self) -> CoreCommand {
            self.output.try_recv().unwrap().command
        }

        fn drain_states(&mut self) -> Vec<ManagedProjectionState> {
            let mut states = Vec::new();
            while let Ok(changed) = self.states.try_recv() {
                states.push(changed.state);
            }
            states
        }

        fn report(&mut self, report: CoreResponse) {
            self.projection.handle_report(report).unwrap();
        }

        fn prepared(&mut self, source_definition: SourceDefinition) {
            let id = self.projection.id();
            self.report(CoreResponse::Prepared {
                id,
                source_definition,
            });
        }

        /// Post, prepare and start a continuous projection.
        async fn running(&mut self) -> oneshot::Receiver<ManagementReply> {
            let (envelope, rx) = Envelope::new();
            self.projection
                .initialize_new(definition(ProjectionMode::Continuous, true), envelope)
                .unwrap();
            assert!(matches!(self.next_command(), CoreCommand::CreateAndPrepare(_)));
            self.prepared(SourceDefinition::default());
            self.pump_io().await;
            assert!(matches!(self.next_command(), CoreCommand::Start { .. }));
            let id = self.projection.id();
            self.report(CoreResponse::Started { id });
            rx
        }
    }

    #[tokio::test]
    async fn test_post_runs_through_prepare_and_start() {
        let mut h = harness("p1", true);
        let rx = h.running().await;

        assert_eq!(
            rx.await.unwrap(),
            ManagementReply::Updated {
                name: "p1".to_string()
            }
        );
        assert_eq!(
            h.drain_states(),
            vec![Creating, Preparing, Prepared, Starting, Running]
        );
        let written = h.log.stream_events(&names::definition_stream("p1")).await;
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].event_type, event_types::PROJECTION_UPDATED);
    }

    #[tokio::test]
    async fn test_not_allowed_to_run_loads_stopped() {
        let mut h = harness("p1", false);
        let (envelope, rx) = Envelope::new();
        h.projection
            .initialize_new(definition(ProjectionMode::Continuous, true), envelope)
            .unwrap();
        h.next_command();
        h.prepared(SourceDefinition::default());
        h.pump_io().await;

        assert!(matches!(h.next_command(), CoreCommand::LoadStopped { .. }));
        let id = h.projection.id();
        h.report(CoreResponse::Stopped {
            id,
            name: "p1".to_string(),
            completed: false,
        });
        assert_eq!(h.projection.state(), Stopped);
        assert!(matches!(rx.await.unwrap(), ManagementReply::Updated { .. }));
    }

    #[tokio::test]
    async fn test_write_retried_until_success() {
        let mut h = harness("p1", true);
        let stream = names::definition_stream("p1");
        h.log
            .fail_next_appends(
                &stream,
                vec![OperationResult::CommitTimeout, OperationResult::CommitTimeout],
            )
            .await;

        let (envelope, _rx) = Envelope::new();
        h.projection
            .initialize_new(definition(ProjectionMode::Continuous, true), envelope)
            .unwrap();
        h.next_command();
        h.prepared(SourceDefinition::default());
        for _ in 0..3 {
            h.pump_io().await;
        }

        assert_eq!(h.log.append_attempts(&stream).await, 3);
        assert_eq!(h.log.stream_events(&stream).await.len(), 1);
        assert_eq!(h.projection.state(), Starting);
    }

    #[tokio::test]
    async fn test_unsupported_write_code_is_fatal() {
        let mut h = harness("p1", true);
        h.log
            .fail_next_appends(
                &names::definition_stream("p1"),
                vec![OperationResult::AccessDenied],
            )
            .await;
        let (envelope, _rx) = Envelope::new();
        h.projection
            .initialize_new(definition(ProjectionMode::Continuous, true), envelope)
            .unwrap();
        h.next_command();
        h.prepared(SourceDefinition::default());

        let io = h.next_io().await;
        let err = h.projection.handle_io(io).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(h.projection.state(), Prepared);
    }

    #[tokio::test]
    async fn test_disable_running_projection() {
        let mut h = harness("p1", true);
        h.running().await;
        h.drain_states();

        let (envelope, rx) = Envelope::new();
        h.projection.disable(envelope).unwrap();
        assert_eq!(h.projection.state(), Stopping);
        assert!(matches!(h.next_command(), CoreCommand::Stop { .. }));

        let id = h.projection.id();
        h.report(CoreResponse::Stopped {
            id,
            name: "p1".to_string(),
            completed: false,
        });
        h.pump_io().await;

        assert!(matches!(rx.await.unwrap(), ManagementReply::Updated { .. }));
        assert_eq!(h.drain_states(), vec![Stopping, Stopped]);
        let events = h.log.stream_events(&names::definition_stream("p1")).await;
        assert_eq!(events.len(), 2);
        let latest: PersistedState = serde_json::from_slice(&events[1].data).unwrap();
        assert!(!latest.enabled);
        assert_eq!(latest.version, Some(1));
    }

    #[tokio::test]
    async fn test_subsequent_command_aborts_pending_reply() {
        let mut h = harness("p1", true);
        h.running().await;

        let (first, first_rx) = Envelope::new();
        h.projection.disable(first).unwrap();
        let (second, _second_rx) = Envelope::new();
        h.projection.disable(second).unwrap();

        assert_eq!(
            first_rx.await.unwrap(),
            ManagementReply::OperationFailed {
                reason: ABORTED_BY_SUBSEQUENT_OPERATION.to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_overlapping_writes_keep_their_replies() {
        let mut h = harness("p1", true);
        h.running().await;

        let (disable, disable_rx) = Envelope::new();
        h.projection.disable(disable).unwrap();
        assert!(matches!(h.next_command(), CoreCommand::Stop { .. }));
        let id = h.projection.id();
        h.report(CoreResponse::Stopped {
            id,
            name: "p1".to_string(),
            completed: false,
        });

        // The disabled snapshot is still being written.
        let (config, config_rx) = Envelope::new();
        let settings = ProjectionSettings {
            checkpoint_handled_threshold: 10,
            ..Default::default()
        };
        h.projection.update_config(settings, config).unwrap();
        assert!(matches!(
            config_rx.await.unwrap(),
            ManagementReply::Updated { .. }
        ));

        h.pump_io().await;
        assert_eq!(
            disable_rx.await.unwrap(),
            ManagementReply::Updated {
                name: "p1".to_string()
            }
        );
        h.pump_io().await;

        let events = h.log.stream_events(&names::definition_stream("p1")).await;
        let versions: Vec<_> = events
            .iter()
            .map(|e| serde_json::from_slice::<PersistedState>(&e.data).unwrap().version)
            .collect();
        assert_eq!(versions, vec![Some(0), Some(1), Some(2)]);
        let latest: PersistedState = serde_json::from_slice(&events[2].data).unwrap();
        assert!(!latest.enabled);
        assert_eq!(latest.checkpoint_handled_threshold, 10);
        assert_eq!(h.projection.last_written_version, 2);

        // The next write lines up with the stream again.
        let (enable, enable_rx) = Envelope::new();
        h.projection.enable(enable).unwrap();
        assert!(matches!(h.next_command(), CoreCommand::Dispose { .. }));
        assert!(matches!(h.next_command(), CoreCommand::CreateAndPrepare(_)));
        h.prepared(SourceDefinition::default());
        h.pump_io().await;
        assert!(matches!(h.next_command(), CoreCommand::Start { .. }));
        h.report(CoreResponse::Started { id });
        assert!(matches!(
            enable_rx.await.unwrap(),
            ManagementReply::Updated { .. }
        ));
        assert_eq!(h.projection.last_written_version, 3);
    }

    #[tokio::test]
    async fn test_stop_rejected_while_preparing() {
        let mut h = harness("p1", true);
        let (envelope, _rx) = Envelope::new();
        h.projection
            .initialize_new(definition(ProjectionMode::Continuous, true), envelope)
            .unwrap();
        h.drain_states();

        let (envelope, rx) = Envelope::new();
        let err = h.projection.disable(envelope).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_OPERATION");
        assert_eq!(
            rx.await.unwrap(),
            ManagementReply::OperationFailed {
                reason: "Cannot stop a projection in the 'Preparing' state".to_string()
            }
        );
        assert_eq!(h.projection.state(), Preparing);
        assert!(h.drain_states().is_empty());
    }

    #[tokio::test]
    async fn test_delete_requires_stopped() {
        let mut h = harness("p1", true);
        h.running().await;
        let (envelope, rx) = Envelope::new();
        let err = h
            .projection
            .delete(Delete::default(), envelope)
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_OPERATION");
        assert!(matches!(
            rx.await.unwrap(),
            ManagementReply::OperationFailed { .. }
        ));
        assert_eq!(h.projection.state(), Running);
    }

    #[tokio::test]
    async fn test_forced_version_bump_requires_written_definition() {
        let mut h = harness("p1", true);
        let (envelope, _rx) = Envelope::new();
        h.projection
            .initialize_new(definition(ProjectionMode::Continuous, true), envelope)
            .unwrap();
        // Version 0 is pending, nothing was written yet.
        let err = h.projection.update_version(true).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Internal error: projection definition must be saved before forced updating version"
        );
    }

    #[tokio::test]
    async fn test_reset_moves_epoch() {
        let mut h = harness("p1", true);
        h.running().await;
        let (envelope, _rx) = Envelope::new();
        h.projection.reset(envelope).unwrap();
        assert_eq!(h.projection.persisted.version, Some(1));
        assert_eq!(h.projection.persisted.epoch, Some(1));
        assert_eq!(h.projection.state(), Stopping);
    }

    #[tokio::test]
    async fn test_unexpected_report_faults() {
        let mut h = harness("p1", true);
        h.running().await;
        let id = h.projection.id();
        h.report(CoreResponse::Prepared {
            id,
            source_definition: SourceDefinition::default(),
        });
        assert_eq!(h.projection.state(), Faulted);
        let statistics = h.projection.statistics();
        assert_eq!(
            statistics.state_reason,
            "Unexpected 'Prepared' message in Running state"
        );
    }

    #[tokio::test]
    async fn test_live_state_only_when_running() {
        let mut h = harness("p1", true);
        let (envelope, rx) = Envelope::new();
        h.projection
            .get_state("".to_string(), envelope, &mut h.dispatchers);
        assert_eq!(
            rx.await.unwrap(),
            ManagementReply::ProjectionState {
                name: "p1".to_string(),
                partition: String::new(),
                state: String::new(),
                position: None,
            }
        );

        h.running().await;
        let (envelope, rx) = Envelope::new();
        h.projection
            .get_state("p".to_string(), envelope, &mut h.dispatchers);
        let WorkerCommand {
            command:
                CoreCommand::GetState {
                    correlation_id, id, ..
                },
            ..
        } = h.output.try_recv().unwrap()
        else {
            panic!("expected a state request");
        };
        h.dispatchers.state.handle(StateReport {
            correlation_id,
            id,
            partition: "p".to_string(),
            state: Some("{\"count\":1}".to_string()),
            position: Some("C:10/P:10".to_string()),
        });
        assert_eq!(
            rx.await.unwrap(),
            ManagementReply::ProjectionState {
                name: "p1".to_string(),
                partition: "p".to_string(),
                state: "{\"count\":1}".to_string(),
                position: Some("C:10/P:10".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_statistics_status_composition() {
        let mut h = harness("p1", true);
        h.running().await;
        let id = h.projection.id();
        h.report(CoreResponse::StatisticsReport {
            id,
            statistics: ProjectionStatistics {
                status: "Stopped".to_string(),
                ..Default::default()
            },
        });
        h.report(CoreResponse::Faulted {
            id,
            fault_message: "boom".to_string(),
        });
        let statistics = h.projection.statistics();
        assert_eq!(statistics.status, "Faulted/Stopped (Enabled)");
        assert_eq!(statistics.state_reason, "boom");
        assert_eq!(statistics.name, "p1");
        assert_eq!(statistics.mode, Some(ProjectionMode::Continuous));
    }

    #[tokio::test]
    async fn test_load_existing_repairs_definition() {
        let mut h = harness("p1", true);
        let stored = serde_json::json!({
            "handlerType": "JS",
            "query": "fromAll()",
            "mode": "Continuous",
            "enabled": true,
        });
        let stream = names::definition_stream("p1");
        for _ in 0..3 {
            h.log
                .append(
                    &stream,
                    ExpectedVersion::Any,
                    vec![NewEvent::json(
                        event_types::PROJECTION_UPDATED,
                        serde_json::to_vec(&stored).unwrap(),
                    )],
                )
                .await
                .unwrap();
        }

        h.projection.initialize_existing();
        h.pump_io().await;

        assert_eq!(h.projection.persisted.version, Some(2));
        assert_eq!(h.projection.persisted.epoch, Some(-1));
        assert_eq!(h.projection.run_as(), &RunAs::System);
        // No source definition stored, so it has to be prepared again.
        assert!(matches!(h.next_command(), CoreCommand::CreateAndPrepare(_)));
        assert_eq!(h.projection.state(), Preparing);
    }

    #[tokio::test]
    async fn test_missing_definition_stays_creating() {
        let mut h = harness("ghost", true);
        h.projection.initialize_existing();
        h.pump_io().await;
        assert_eq!(h.projection.state(), Creating);
    }

    async fn deleted_after_cleanups(
        delete_checkpoint_stream: bool,
        track_and_delete_emitted: bool,
        multi_stream: bool,
    ) -> usize {
        let mut h = harness("p1", true);
        let mut state = definition(ProjectionMode::Continuous, true);
        state.emit_enabled = Some(true);
        state.track_emitted_streams = Some(track_and_delete_emitted);
        let (envelope, _rx) = Envelope::new();
        h.projection.initialize_new(state, envelope).unwrap();
        h.next_command();
        let mut source = SourceDefinition::default();
        if multi_stream {
            source.streams = vec!["a".to_string(), "b".to_string()];
        }
        h.prepared(source);
        h.pump_io().await;
        h.next_command();
        let id = h.projection.id();
        h.report(CoreResponse::Started { id });

        let (envelope, _rx) = Envelope::new();
        h.projection.disable(envelope).unwrap();
        h.report(CoreResponse::Stopped {
            id,
            name: "p1".to_string(),
            completed: false,
        });
        h.pump_io().await;
        assert_eq!(h.projection.state(), Stopped);

        let (envelope, rx) = Envelope::new();
        h.projection
            .delete(
                Delete {
                    name: "p1".to_string(),
                    delete_checkpoint_stream,
                    delete_emitted_streams: track_and_delete_emitted,
                    ..Default::default()
                },
                envelope,
            )
            .unwrap();
        // The deleting snapshot is written first.
        h.pump_io().await;

        let mut cleanups = 0;
        while !h.projection.is_deleted() {
            h.pump_io().await;
            cleanups += 1;
        }
        assert!(matches!(rx.await.unwrap(), ManagementReply::Updated { .. }));

        let mut deleted_notifications = 0;
        while let Ok(message) = h.inbox.try_recv() {
            if matches!(message, ManagerMessage::Deleted { .. }) {
                deleted_notifications += 1;
            }
        }
        assert_eq!(deleted_notifications, 1);
        cleanups
    }

    #[tokio::test]
    async fn test_deletion_waits_for_each_counted_cleanup() {
        for checkpoint in [false, true] {
            for emitted in [false, true] {
                for multi in [false, true] {
                    let expected = [checkpoint, emitted, multi]
                        .iter()
                        .filter(|flag| **flag)
                        .count();
                    assert_eq!(
                        deleted_after_cleanups(checkpoint, emitted, multi).await,
                        expected,
                        "checkpoint={} emitted={} multi={}",
                        checkpoint,
                        emitted,
                        multi
                    );
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_projection_expires() {
        let mut h = harness("q", true);
        let (envelope, _rx) = Envelope::new();
        h.projection
            .initialize_new(definition(ProjectionMode::Transient, true), envelope)
            .unwrap();
        h.next_command();
        h.prepared(SourceDefinition::default());
        assert!(matches!(h.next_command(), CoreCommand::Start { .. }));
        let id = h.projection.id();
        h.report(CoreResponse::Started { id });

        assert!(!h.projection.is_expired(Instant::now()));
        tokio::time::advance(Duration::from_secs(301)).await;
        h.projection.cleanup_expired(Instant::now()).unwrap();

        assert!(h.projection.is_deleted());
        assert!(h.log.stream_events(&names::definition_stream("q")).await.is_empty());
    }
}
