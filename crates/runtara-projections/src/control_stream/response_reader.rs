// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Master-stream reader feeding the projection manager.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::next_page;
use crate::error::{ProjectionError, Result};
use crate::event_log::{EventLog, ExpectedVersion, NewEvent, OperationResult, RecordedEvent};
use crate::manager::{ManagerHandle, ResponseSource};
use crate::messages::management::{Envelope, ManagementCommand};
use crate::messages::worker::CoreResponse;
use crate::names::{
    CONTROL_READ_PAGE_SIZE, PROJECTIONS_CONTROL_STREAM, PROJECTIONS_MASTER_STREAM, event_types,
};

/// Tails the master stream and forwards worker responses to the manager.
///
/// Every reset starts a fresh read scope: the reader marks its starting point
/// on the master stream, asks every worker to announce itself again, and
/// signals [`ManagerHandle::reader_ready`] once all expected workers did.
pub struct ResponseReader {
    log: Arc<dyn EventLog>,
    workers: usize,
    shutdown: CancellationToken,
    scope: Option<CancellationToken>,
}

impl ResponseReader {
    /// A reader expecting `workers` announcements. Scopes are children of
    /// `shutdown`.
    pub fn new(log: Arc<dyn EventLog>, workers: usize, shutdown: CancellationToken) -> Self {
        Self {
            log,
            workers,
            shutdown,
            scope: None,
        }
    }
}

impl std::fmt::Debug for ResponseReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseReader")
            .field("workers", &self.workers)
            .field("active", &self.scope.is_some())
            .finish()
    }
}

impl ResponseSource for ResponseReader {
    fn reset(&mut self, manager: ManagerHandle) {
        self.stop();
        let scope = self.shutdown.child_token();
        let log = self.log.clone();
        let workers = self.workers;
        let task_scope = scope.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = task_scope.cancelled() => {
                    debug!("Response reader scope cancelled");
                }

                result = read_responses(log, workers, manager) => {
                    if let Err(e) = result {
                        error!(error = %e, "Response reader stopped");
                    }
                }
            }
        });
        self.scope = Some(scope);
    }

    fn stop(&mut self) {
        if let Some(scope) = self.scope.take() {
            scope.cancel();
        }
    }
}

/// Append the starting marker and return its event number.
async fn mark_start(log: &dyn EventLog) -> Result<i64> {
    loop {
        let completed = log
            .append(
                PROJECTIONS_MASTER_STREAM,
                ExpectedVersion::Any,
                vec![NewEvent::json(
                    event_types::RESPONSE_READER_STARTING,
                    b"{}".to_vec(),
                )],
            )
            .await?;
        match completed.result {
            OperationResult::Success => return Ok(completed.first_event_number),
            result if result.is_transient() => {
                warn!(result = %result, "Response reader start marker not written, retrying");
            }
            result => {
                return Err(ProjectionError::Storage {
                    operation: "write response reader start marker".to_string(),
                    details: result.to_string(),
                });
            }
        }
    }
}

async fn read_responses(log: Arc<dyn EventLog>, workers: usize, manager: ManagerHandle) -> Result<()> {
    let mut from = mark_start(log.as_ref()).await?;
    info!(from, "Response reader starting");

    let started = log
        .append(
            PROJECTIONS_CONTROL_STREAM,
            ExpectedVersion::Any,
            vec![NewEvent::json(
                event_types::RESPONSE_READER_STARTED,
                b"{}".to_vec(),
            )],
        )
        .await?;
    if started.result != OperationResult::Success {
        error!(result = %started.result, "Failed to announce the response reader to workers");
    }

    let mut announced: HashSet<Uuid> = HashSet::new();
    let mut ready = false;
    loop {
        let slice = next_page(log.as_ref(), PROJECTIONS_MASTER_STREAM, from, CONTROL_READ_PAGE_SIZE).await?;
        for event in &slice.events {
            dispatch(event, &manager)?;
            if !ready
                && let Some(worker_id) = announced_worker(event)
            {
                announced.insert(worker_id);
                if announced.len() >= workers {
                    info!(workers, "All workers announced, response reader ready");
                    ready = true;
                    manager.reader_ready();
                }
            }
        }
        from = slice.next_event_number;
    }
}

fn announced_worker(event: &RecordedEvent) -> Option<Uuid> {
    match CoreResponse::decode(&event.event_type, &event.data) {
        Ok(Some(CoreResponse::WorkerStarted { id })) => Some(id),
        _ => None,
    }
}

fn dispatch(event: &RecordedEvent, manager: &ManagerHandle) -> Result<()> {
    if event.event_type == event_types::RESPONSE_READER_STARTING {
        return Ok(());
    }
    if let Some(response) = CoreResponse::decode(&event.event_type, &event.data)? {
        debug!(tag = %event.event_type, "Worker response received");
        manager.worker_response(response);
        return Ok(());
    }
    if let Some(command) = ManagementCommand::decode(&event.event_type, &event.data)? {
        debug!(tag = %event.event_type, "Management command received");
        manager.dispatch(command, Envelope::noop());
        return Ok(());
    }
    Err(ProjectionError::Protocol {
        reason: format!("Unknown response: {}", event.event_type),
    })
}
