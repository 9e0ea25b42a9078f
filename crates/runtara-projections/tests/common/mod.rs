// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runtara-projections integration tests.
//!
//! Provides TestContext: a projection manager over an in-memory event log,
//! with the test acting as every worker.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use runtara_projections::bus::Publisher;
use runtara_projections::core::{LoopbackCore, ProjectionCore};
use runtara_projections::event_log::{EventLog, ExpectedVersion, InMemoryEventLog, NewEvent};
use runtara_projections::managed_projection::{ManagedProjectionState, ProjectionStateChanged};
use runtara_projections::manager::{self, ManagerHandle, ManagerServices, ManagerSettings};
use runtara_projections::messages::management::{
    Envelope, ManagementCommand, ManagementReply, Post,
};
use runtara_projections::messages::worker::{CoreCommand, CoreResponse, WorkerCommand};
use runtara_projections::model::{RunProjections, SourceDefinition, StatisticsScope};
use runtara_projections::names::{self, PROJECTIONS_REGISTRY_STREAM};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Test context owning a running manager and the worker side of its channels.
pub struct TestContext {
    pub log: Arc<InMemoryEventLog>,
    pub manager: ManagerHandle,
    pub join: JoinHandle<()>,
    pub workers: Vec<Uuid>,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    states: mpsc::UnboundedReceiver<ProjectionStateChanged>,
}

/// Forwards worker responses straight into the manager's mailbox.
struct ToManager(ManagerHandle);

impl Publisher<CoreResponse> for ToManager {
    fn publish(&self, response: CoreResponse) {
        self.0.worker_response(response);
    }
}

impl TestContext {
    /// A started manager over an empty log with three workers, running every
    /// projection and skipping the system projections.
    pub async fn new() -> Self {
        Self::with_settings(Arc::new(InMemoryEventLog::new()), |settings| {
            settings.run_projections = RunProjections::All;
            settings.initialize_system_projections = false;
        })
        .await
    }

    /// A started manager over `log` with three workers; `configure` adjusts
    /// the settings before the manager is spawned.
    pub async fn with_settings(
        log: Arc<InMemoryEventLog>,
        configure: impl FnOnce(&mut ManagerSettings),
    ) -> Self {
        let context = Self::spawn(log, configure);
        context.make_ready();
        context.wait_until_serving().await;
        context
    }

    /// A manager that has been spawned but never told it may start.
    pub fn spawn(log: Arc<InMemoryEventLog>, configure: impl FnOnce(&mut ManagerSettings)) -> Self {
        let workers: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let mut settings = ManagerSettings::new(workers.clone());
        configure(&mut settings);

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (states_tx, states) = mpsc::unbounded_channel();
        let mut services = ManagerServices::new(log.clone(), Arc::new(commands_tx));
        services.state_listener = Some(Arc::new(states_tx));

        let (manager, join) = manager::spawn(settings, services).expect("valid manager settings");
        Self {
            log,
            manager,
            join,
            workers,
            commands,
            states,
        }
    }

    /// Deliver every readiness signal a runtime would.
    pub fn make_ready(&self) {
        self.manager.system_core_ready();
        self.manager.node_state_changed(true);
        self.manager.epoch_written();
        self.manager.reader_ready();
    }

    /// Poll until the manager answers commands, i.e. the registry is loaded.
    pub async fn wait_until_serving(&self) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let statistics = self
                .manager
                .send(ManagementCommand::GetStatistics {
                    name: None,
                    scope: StatisticsScope::All,
                })
                .await;
            if statistics.is_ok() {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "manager never started serving commands"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Answer every worker command with a [`LoopbackCore`]. Commands are
    /// still recorded and can be read with [`Self::next_command`].
    pub fn auto_respond(&mut self) {
        let (recorded_tx, recorded) = mpsc::unbounded_channel();
        let mut commands = std::mem::replace(&mut self.commands, recorded);
        let responses = ToManager(self.manager.clone());
        tokio::spawn(async move {
            let core = LoopbackCore::new();
            while let Some(command) = commands.recv().await {
                let _ = recorded_tx.send(command.clone());
                core.handle(command.worker_id, command.command, &responses).await;
            }
        });
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Send a management command without waiting for its reply.
    pub fn dispatch(
        &self,
        command: ManagementCommand,
    ) -> tokio::sync::oneshot::Receiver<ManagementReply> {
        let (envelope, reply) = Envelope::new();
        self.manager.dispatch(command, envelope);
        reply
    }

    /// Send a management command and wait for its reply.
    pub async fn send(&self, command: ManagementCommand) -> ManagementReply {
        tokio::time::timeout(WAIT, self.manager.send(command))
            .await
            .expect("manager did not reply in time")
            .expect("manager dropped the command")
    }

    /// Statistics of one projection, or `None` if the manager has no such name.
    pub async fn statistics(
        &self,
        name: &str,
    ) -> Option<runtara_projections::model::ProjectionStatistics> {
        let reply = self
            .send(ManagementCommand::GetStatistics {
                name: Some(name.to_string()),
                scope: StatisticsScope::All,
            })
            .await;
        match reply {
            ManagementReply::Statistics { mut projections } => projections.pop(),
            ManagementReply::NotFound { .. } => None,
            other => panic!("unexpected statistics reply: {:?}", other),
        }
    }

    /// Poll until the manager no longer knows `name`.
    pub async fn wait_until_removed(&self, name: &str) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.statistics(name).await.is_some() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "projection {} was never removed",
                name
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // ------------------------------------------------------------------
    // Worker side
    // ------------------------------------------------------------------

    /// Next command the manager sent to any worker.
    pub async fn next_command(&mut self) -> WorkerCommand {
        tokio::time::timeout(WAIT, self.commands.recv())
            .await
            .expect("no worker command in time")
            .expect("command channel closed")
    }

    /// Whether a command is already queued.
    pub fn try_next_command(&mut self) -> Option<WorkerCommand> {
        self.commands.try_recv().ok()
    }

    /// Report as a worker.
    pub fn respond(&self, response: CoreResponse) {
        self.manager.worker_response(response);
    }

    /// Wait until `name` enters `state`, skipping earlier transitions.
    pub async fn wait_for_state(&mut self, name: &str, state: ManagedProjectionState) -> Uuid {
        let states = &mut self.states;
        tokio::time::timeout(WAIT, async {
            loop {
                let change = states.recv().await.expect("state channel closed");
                if change.name == name && change.state == state {
                    return change.id;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} never reached {}", name, state))
    }

    /// Every state `name` went through so far, in order.
    pub fn drain_states(&mut self, name: &str) -> Vec<ManagedProjectionState> {
        let mut seen = Vec::new();
        while let Ok(change) = self.states.try_recv() {
            if change.name == name {
                seen.push(change.state);
            }
        }
        seen
    }

    /// Post `post` and play the worker until the projection runs.
    ///
    /// Returns the correlation id and the worker it was placed on.
    pub async fn post_running(&mut self, post: Post) -> (Uuid, Uuid) {
        let name = post.name.clone();
        let reply = self.dispatch(ManagementCommand::Post(post));

        let created = self.next_command().await;
        let CoreCommand::CreateAndPrepare(projection) = created.command else {
            panic!("expected create-and-prepare, got {:?}", created.command);
        };
        assert_eq!(projection.name, name);
        self.respond(CoreResponse::Prepared {
            id: projection.id,
            source_definition: SourceDefinition {
                all_streams: true,
                all_events: true,
                ..Default::default()
            },
        });

        let start = self.next_command().await;
        assert_eq!(start.command, CoreCommand::Start { id: projection.id });
        assert_eq!(start.worker_id, created.worker_id);
        self.respond(CoreResponse::Started { id: projection.id });

        let reply = tokio::time::timeout(WAIT, reply)
            .await
            .expect("post was not answered in time")
            .expect("post reply dropped");
        assert_eq!(reply, ManagementReply::Updated { name });
        (projection.id, created.worker_id)
    }

    // ------------------------------------------------------------------
    // Event log
    // ------------------------------------------------------------------

    /// Event types of the registry stream, oldest first.
    pub async fn registry(&self) -> Vec<(String, String)> {
        self.log
            .stream_events(PROJECTIONS_REGISTRY_STREAM)
            .await
            .into_iter()
            .map(|e| (e.event_type, String::from_utf8_lossy(&e.data).into_owned()))
            .collect()
    }

    /// Poll until the registry holds at least `count` events.
    pub async fn wait_for_registry(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.log.stream_events(PROJECTIONS_REGISTRY_STREAM).await.len() < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "registry never reached {} events",
                count
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Event types written to the definition stream of `name`.
    pub async fn definition_events(&self, name: &str) -> Vec<String> {
        self.log
            .stream_events(&names::definition_stream(name))
            .await
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    /// Stop the manager and wait for its task.
    pub async fn shutdown(self) {
        self.manager.shutdown();
        let _ = tokio::time::timeout(WAIT, self.join).await;
    }
}

/// Append a registry marker the way a previous node would have.
pub async fn seed_registry(log: &dyn EventLog, event_type: &str, name: &str) {
    log.append(
        PROJECTIONS_REGISTRY_STREAM,
        ExpectedVersion::Any,
        vec![NewEvent::raw(event_type, name.as_bytes().to_vec())],
    )
    .await
    .expect("seed registry");
}
