// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker-stream reader feeding a [`ProjectionCore`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::next_page;
use crate::bus::Publisher;
use crate::coordinator::{CoordinatorHandle, CoreComponent};
use crate::core::ProjectionCore;
use crate::error::Result;
use crate::event_log::{EventLog, ReadStreamSlice};
use crate::messages::worker::{CoreCommand, CoreResponse};
use crate::names::{self, CONTROL_READ_PAGE_SIZE, PROJECTIONS_CONTROL_STREAM, event_types};

/// Tails one worker's command stream and hands commands to its core.
///
/// The worker announces itself on start, and again whenever a new response
/// reader starts on the control stream.
pub struct CoreCommandReader {
    worker_id: Uuid,
    log: Arc<dyn EventLog>,
    core: Arc<dyn ProjectionCore>,
    responses: Arc<dyn Publisher<CoreResponse>>,
    shutdown: CancellationToken,
    scope: Option<CancellationToken>,
}

impl CoreCommandReader {
    /// A reader for `worker_id`. Scopes are children of `shutdown`.
    pub fn new(
        worker_id: Uuid,
        log: Arc<dyn EventLog>,
        core: Arc<dyn ProjectionCore>,
        responses: Arc<dyn Publisher<CoreResponse>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            log,
            core,
            responses,
            shutdown,
            scope: None,
        }
    }
}

impl std::fmt::Debug for CoreCommandReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreCommandReader")
            .field("worker_id", &self.worker_id)
            .field("active", &self.scope.is_some())
            .finish()
    }
}

impl CoreComponent for CoreCommandReader {
    fn start(&mut self, instance_id: Uuid, coordinator: CoordinatorHandle) {
        if let Some(scope) = self.scope.take() {
            scope.cancel();
        }
        let scope = self.shutdown.child_token();
        let worker = WorkerLoop {
            worker_id: self.worker_id,
            log: self.log.clone(),
            core: self.core.clone(),
            responses: self.responses.clone(),
        };
        let task_scope = scope.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = task_scope.cancelled() => {
                    debug!(worker_id = %worker.worker_id, "Command reader cancelled");
                }

                result = worker.run(instance_id, &coordinator) => {
                    if let Err(e) = result {
                        error!(worker_id = %worker.worker_id, error = %e, "Command reader stopped");
                    }
                }
            }
        });
        self.scope = Some(scope);
    }

    fn stop(&mut self, instance_id: Uuid, coordinator: CoordinatorHandle) {
        if let Some(scope) = self.scope.take() {
            scope.cancel();
        }
        coordinator.component_stopped(instance_id);
    }
}

struct WorkerLoop {
    worker_id: Uuid,
    log: Arc<dyn EventLog>,
    core: Arc<dyn ProjectionCore>,
    responses: Arc<dyn Publisher<CoreResponse>>,
}

/// Event number following the current end of `stream`.
async fn stream_end(log: &dyn EventLog, stream: &str) -> Result<i64> {
    let slice = log.read_backward(stream, -1, 1).await?;
    Ok(slice.last_event_number + 1)
}

impl WorkerLoop {
    fn announce(&self) {
        self.responses.publish(CoreResponse::WorkerStarted {
            id: self.worker_id,
        });
    }

    async fn run(&self, instance_id: Uuid, coordinator: &CoordinatorHandle) -> Result<()> {
        let stream = names::worker_stream(self.worker_id);
        let mut commands_from = stream_end(self.log.as_ref(), &stream).await?;
        let mut control_from = stream_end(self.log.as_ref(), PROJECTIONS_CONTROL_STREAM).await?;

        self.announce();
        coordinator.component_started(instance_id);
        info!(worker_id = %self.worker_id, from = commands_from, "Command reader started");

        loop {
            tokio::select! {
                page = next_page(self.log.as_ref(), &stream, commands_from, CONTROL_READ_PAGE_SIZE) => {
                    let page = page?;
                    commands_from = page.next_event_number;
                    self.handle_commands(page).await?;
                }
                page = next_page(self.log.as_ref(), PROJECTIONS_CONTROL_STREAM, control_from, CONTROL_READ_PAGE_SIZE) => {
                    let page = page?;
                    control_from = page.next_event_number;
                    if page
                        .events
                        .iter()
                        .any(|e| e.event_type == event_types::RESPONSE_READER_STARTED)
                    {
                        debug!(worker_id = %self.worker_id, "Response reader restarted, announcing worker");
                        self.announce();
                    }
                }
            }
        }
    }

    async fn handle_commands(&self, page: ReadStreamSlice) -> Result<()> {
        for event in page.events {
            let command = CoreCommand::decode(&event.event_type, &event.data)?;
            debug!(worker_id = %self.worker_id, tag = %event.event_type, "Worker command received");
            self.core
                .handle(self.worker_id, command, self.responses.as_ref())
                .await;
        }
        Ok(())
    }
}
