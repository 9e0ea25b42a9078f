// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker-side projection engine seam.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::bus::Publisher;
use crate::messages::worker::{CoreCommand, CoreResponse, ResultReport, StateReport};
use crate::model::SourceDefinition;

/// Runs projection instances on one worker and reports back.
#[async_trait]
pub trait ProjectionCore: Send + Sync {
    /// Handle a command addressed to `worker_id`, publishing any reports on
    /// `responses`.
    async fn handle(
        &self,
        worker_id: Uuid,
        command: CoreCommand,
        responses: &dyn Publisher<CoreResponse>,
    );
}

/// Acknowledges lifecycle commands without running handlers.
///
/// Instances are prepared against all events, start immediately, and stop
/// without completing. State and result queries return nothing.
#[derive(Debug, Default)]
pub struct LoopbackCore {
    instances: Mutex<HashMap<Uuid, String>>,
}

impl LoopbackCore {
    /// Create an engine with no instances.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instances not yet disposed.
    pub async fn instance_count(&self) -> usize {
        self.instances.lock().await.len()
    }

    async fn stopped(&self, id: Uuid) -> CoreResponse {
        let name = self
            .instances
            .lock()
            .await
            .get(&id)
            .cloned()
            .unwrap_or_default();
        CoreResponse::Stopped {
            id,
            name,
            completed: false,
        }
    }
}

fn all_events() -> SourceDefinition {
    SourceDefinition {
        all_streams: true,
        all_events: true,
        ..Default::default()
    }
}

#[async_trait]
impl ProjectionCore for LoopbackCore {
    async fn handle(
        &self,
        worker_id: Uuid,
        command: CoreCommand,
        responses: &dyn Publisher<CoreResponse>,
    ) {
        debug!(worker_id = %worker_id, id = %command.id(), "Loopback core handling command");
        match command {
            CoreCommand::CreateAndPrepare(projection) => {
                self.instances
                    .lock()
                    .await
                    .insert(projection.id, projection.name);
                responses.publish(CoreResponse::Prepared {
                    id: projection.id,
                    source_definition: all_events(),
                });
            }
            CoreCommand::CreateAndPrepareSlave { projection, .. } => {
                let id = projection.id;
                self.instances.lock().await.insert(id, projection.name);
                responses.publish(CoreResponse::Prepared {
                    id,
                    source_definition: all_events(),
                });
                responses.publish(CoreResponse::SlaveProjectionReaderAssigned {
                    id,
                    subscription_id: Uuid::new_v4(),
                });
            }
            CoreCommand::CreatePrepared {
                projection,
                source_definition,
            } => {
                self.instances
                    .lock()
                    .await
                    .insert(projection.id, projection.name);
                responses.publish(CoreResponse::Prepared {
                    id: projection.id,
                    source_definition,
                });
            }
            CoreCommand::Start { id } => responses.publish(CoreResponse::Started { id }),
            CoreCommand::LoadStopped { id } | CoreCommand::Stop { id } | CoreCommand::Kill { id } => {
                responses.publish(self.stopped(id).await)
            }
            CoreCommand::Dispose { id } => {
                self.instances.lock().await.remove(&id);
            }
            CoreCommand::GetState {
                correlation_id,
                id,
                partition,
            } => responses.publish(CoreResponse::State(StateReport {
                correlation_id,
                id,
                partition,
                state: None,
                position: None,
            })),
            CoreCommand::GetResult {
                correlation_id,
                id,
                partition,
            } => responses.publish(CoreResponse::Result(ResultReport {
                correlation_id,
                id,
                partition,
                result: None,
                position: None,
            })),
            CoreCommand::SlaveProjectionsStarted { id, channels } => {
                debug!(id = %id, groups = channels.len(), "Slave projections started");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed_projection::PersistedState;
    use crate::messages::worker::CreateProjection;
    use crate::model::ProjectionVersion;
    use tokio::sync::mpsc;

    fn create(id: Uuid) -> CreateProjection {
        CreateProjection {
            id,
            name: "p".to_string(),
            version: ProjectionVersion {
                projection_id: 1,
                epoch: 0,
                version: 0,
            },
            config: PersistedState::default().projection_config(false),
            handler_type: "JS".to_string(),
            query: "fromAll()".to_string(),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_acknowledged() {
        let core = LoopbackCore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = Uuid::new_v4();
        let id = Uuid::new_v4();

        core.handle(worker, CoreCommand::CreateAndPrepare(create(id)), &tx).await;
        assert!(matches!(rx.try_recv().unwrap(), CoreResponse::Prepared { id: got, .. } if got == id));

        core.handle(worker, CoreCommand::Start { id }, &tx).await;
        assert_eq!(rx.try_recv().unwrap(), CoreResponse::Started { id });

        core.handle(worker, CoreCommand::Stop { id }, &tx).await;
        assert_eq!(
            rx.try_recv().unwrap(),
            CoreResponse::Stopped {
                id,
                name: "p".to_string(),
                completed: false
            }
        );

        assert_eq!(core.instance_count().await, 1);
        core.handle(worker, CoreCommand::Dispose { id }, &tx).await;
        assert_eq!(core.instance_count().await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slave_gets_reader_assigned() {
        let core = LoopbackCore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        core.handle(
            Uuid::new_v4(),
            CoreCommand::CreateAndPrepareSlave {
                projection: create(id),
                master_worker_id: Uuid::new_v4(),
                master_correlation_id: Uuid::new_v4(),
            },
            &tx,
        )
        .await;
        assert!(matches!(rx.try_recv().unwrap(), CoreResponse::Prepared { .. }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            CoreResponse::SlaveProjectionReaderAssigned { id: got, .. } if got == id
        ));
    }
}
