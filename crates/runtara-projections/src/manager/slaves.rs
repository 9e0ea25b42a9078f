// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Slave projection batches requested by master projections.
//!
//! A batch completes once every slave it created has been assigned a reader
//! subscription by its worker. The master then gets the full channel map,
//! both as the command reply and as a worker command.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ProjectionManager;
use crate::bus::Publisher;
use crate::managed_projection::{PersistedState, SlaveMaster};
use crate::messages::management::{Envelope, ManagementReply, StartSlaveProjections};
use crate::messages::worker::{CoreCommand, WorkerCommand};
use crate::model::{
    ProjectionMode, SlaveProjectionCommunicationChannel, SlaveProjectionCommunicationChannels,
    SlaveProjectionRequestedNumber,
};
use crate::names::PROJECTION_QUERY_ID;

struct SlaveBatch {
    envelope: Envelope,
    master: SlaveMaster,
    channels: HashMap<String, Vec<Option<SlaveProjectionCommunicationChannel>>>,
    remaining: usize,
}

struct AwaitedSlave {
    batch_id: Uuid,
    group: String,
    slot: usize,
    worker_id: Uuid,
}

#[derive(Default)]
pub(super) struct SlaveBatches {
    batches: HashMap<Uuid, SlaveBatch>,
    awaiting: HashMap<Uuid, AwaitedSlave>,
}

impl SlaveBatches {
    pub(super) fn clear(&mut self) {
        self.batches.clear();
        self.awaiting.clear();
    }

    /// A slave went away before its reader was assigned: its batch can no
    /// longer complete and is answered with `reason`.
    pub(super) fn fail(&mut self, slave_id: Uuid, reason: String) {
        let Some(awaited) = self.awaiting.remove(&slave_id) else {
            return;
        };
        self.awaiting
            .retain(|_, other| other.batch_id != awaited.batch_id);
        if let Some(batch) = self.batches.remove(&awaited.batch_id) {
            warn!(
                master = %batch.master.master_correlation_id,
                reason = %reason,
                "Slave projection batch failed"
            );
            batch
                .envelope
                .reply(ManagementReply::OperationFailed { reason });
        }
    }
}

fn into_channels(
    channels: HashMap<String, Vec<Option<SlaveProjectionCommunicationChannel>>>,
) -> SlaveProjectionCommunicationChannels {
    channels
        .into_iter()
        .map(|(group, slots)| (group, slots.into_iter().flatten().collect()))
        .collect()
}

impl ProjectionManager {
    pub(super) fn start_slave_projections(
        &mut self,
        message: StartSlaveProjections,
        envelope: Envelope,
    ) {
        let master = SlaveMaster {
            master_worker_id: message.master_worker_id,
            master_correlation_id: message.master_correlation_id,
        };

        // (group, slave name, worker index) for every slave of the batch.
        let mut planned = Vec::new();
        let mut groups = HashSet::new();
        let mut names = HashSet::new();
        for definition in &message.slave_projections {
            if !groups.insert(definition.name.as_str()) {
                warn!(slave = %definition.name, "Slave projection requested twice");
                envelope.reply(ManagementReply::Conflict {
                    name: definition.name.clone(),
                });
                return;
            }
            let indexes: Vec<usize> = match definition.requested_number {
                SlaveProjectionRequestedNumber::One | SlaveProjectionRequestedNumber::OnePerNode => {
                    vec![self.next_worker_index()]
                }
                SlaveProjectionRequestedNumber::OnePerThread => {
                    (0..self.settings.workers.len()).collect()
                }
            };
            for index in indexes {
                let name = format!("{}-{}-{}", message.name, definition.name, index);
                if self.projections.contains_key(&name) || !names.insert(name.clone()) {
                    warn!(projection = %name, "Slave projection name already in use");
                    envelope.reply(ManagementReply::Conflict { name });
                    return;
                }
                planned.push((definition, name, index));
            }
        }

        if planned.is_empty() {
            envelope.reply(ManagementReply::SlaveProjectionsStarted {
                channels: SlaveProjectionCommunicationChannels::new(),
            });
            return;
        }

        let batch_id = Uuid::new_v4();
        let mut channels: HashMap<String, Vec<Option<SlaveProjectionCommunicationChannel>>> =
            HashMap::new();
        let mut created = Vec::with_capacity(planned.len());
        for (definition, name, index) in planned {
            let slots = channels.entry(definition.name.clone()).or_default();
            let slot = slots.len();
            slots.push(None);

            let state = PersistedState {
                handler_type: Some(definition.handler_type.clone()),
                query: Some(definition.query.clone()),
                mode: ProjectionMode::Transient,
                enabled: true,
                emit_enabled: Some(definition.emit_enabled),
                checkpoints_disabled: Some(!definition.checkpoints_enabled),
                epoch: Some(-1),
                version: Some(-1),
                run_as: definition
                    .enable_run_as
                    .then(|| definition.run_as.clone().into()),
                ..Default::default()
            };
            let id = self.create_managed_projection(name, PROJECTION_QUERY_ID, index, Some(master));
            self.slaves.awaiting.insert(
                id,
                AwaitedSlave {
                    batch_id,
                    group: definition.name.clone(),
                    slot,
                    worker_id: self.settings.workers[index],
                },
            );
            created.push((id, state));
        }

        info!(master = %message.name, slaves = created.len(), "Starting slave projections");
        self.slaves.batches.insert(
            batch_id,
            SlaveBatch {
                envelope,
                master,
                channels,
                remaining: created.len(),
            },
        );
        for (id, state) in created {
            self.with_projection(id, |projection| {
                projection.initialize_new(state, Envelope::noop())
            });
        }
    }

    pub(super) fn slave_reader_assigned(&mut self, slave_id: Uuid, subscription_id: Uuid) {
        let Some(awaited) = self.slaves.awaiting.remove(&slave_id) else {
            debug!(id = %slave_id, "Reader assigned to an unknown slave projection");
            return;
        };
        let Some(batch) = self.slaves.batches.get_mut(&awaited.batch_id) else {
            return;
        };
        if let Some(slot) = batch
            .channels
            .get_mut(&awaited.group)
            .and_then(|slots| slots.get_mut(awaited.slot))
        {
            *slot = Some(SlaveProjectionCommunicationChannel {
                managed_projection_correlation_id: slave_id,
                worker_id: awaited.worker_id,
                subscription_id,
            });
        }
        batch.remaining -= 1;
        if batch.remaining > 0 {
            return;
        }

        let Some(batch) = self.slaves.batches.remove(&awaited.batch_id) else {
            return;
        };
        let channels = into_channels(batch.channels);
        self.output.publish(WorkerCommand {
            worker_id: batch.master.master_worker_id,
            command: CoreCommand::SlaveProjectionsStarted {
                id: batch.master.master_correlation_id,
                channels: channels.clone(),
            },
        });
        batch
            .envelope
            .reply(ManagementReply::SlaveProjectionsStarted { channels });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn awaited(batch_id: Uuid, slot: usize) -> AwaitedSlave {
        AwaitedSlave {
            batch_id,
            group: "part".to_string(),
            slot,
            worker_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_fail_answers_batch_and_drops_its_slaves() {
        let mut slaves = SlaveBatches::default();
        let (envelope, reply) = Envelope::new();
        let batch_id = Uuid::new_v4();
        slaves.batches.insert(
            batch_id,
            SlaveBatch {
                envelope,
                master: SlaveMaster {
                    master_worker_id: Uuid::new_v4(),
                    master_correlation_id: Uuid::new_v4(),
                },
                channels: HashMap::from([("part".to_string(), vec![None, None])]),
                remaining: 2,
            },
        );
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        slaves.awaiting.insert(first, awaited(batch_id, 0));
        slaves.awaiting.insert(second, awaited(batch_id, 1));
        let unrelated = Uuid::new_v4();
        slaves.awaiting.insert(unrelated, awaited(Uuid::new_v4(), 0));

        slaves.fail(first, "gone".to_string());

        assert_eq!(
            reply.await.unwrap(),
            ManagementReply::OperationFailed {
                reason: "gone".to_string()
            }
        );
        assert!(slaves.batches.is_empty());
        assert_eq!(slaves.awaiting.keys().collect::<Vec<_>>(), vec![&unrelated]);
    }

    #[test]
    fn test_fail_ignores_assigned_slaves() {
        let mut slaves = SlaveBatches::default();
        slaves.fail(Uuid::new_v4(), "gone".to_string());
        assert!(slaves.awaiting.is_empty());
    }
}
