// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle commands sent to workers and the reports they send back.
//!
//! Ids are serialized as 32 hex digits without dashes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{decode_tagged, encode_tagged};
use crate::dispatcher::Correlated;
use crate::error::{ProjectionError, Result};
use crate::model::{
    ProjectionConfig, ProjectionStatistics, ProjectionVersion, SlaveProjectionCommunicationChannels,
    SourceDefinition,
};

/// Everything a worker needs to create a projection instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjection {
    /// Correlation id of the managed projection.
    #[serde(with = "uuid::serde::simple")]
    pub id: Uuid,
    /// Projection name.
    pub name: String,
    /// Definition identity.
    pub version: ProjectionVersion,
    /// Worker configuration.
    pub config: ProjectionConfig,
    /// Handler type.
    pub handler_type: String,
    /// Query text.
    pub query: String,
}

/// A lifecycle command addressed to one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "body", rename_all_fields = "camelCase")]
pub enum CoreCommand {
    /// Create an instance and parse its query.
    #[serde(rename = "$create-and-prepare")]
    CreateAndPrepare(CreateProjection),
    /// Create a slave instance reporting to a master projection.
    #[serde(rename = "$create-and-prepare-slave")]
    CreateAndPrepareSlave {
        /// Instance definition.
        #[serde(flatten)]
        projection: CreateProjection,
        /// Worker running the master projection.
        #[serde(with = "uuid::serde::simple")]
        master_worker_id: Uuid,
        /// Correlation id of the master projection.
        #[serde(with = "uuid::serde::simple")]
        master_correlation_id: Uuid,
    },
    /// Create an instance from an already parsed source definition.
    #[serde(rename = "$create-prepared")]
    CreatePrepared {
        /// Instance definition.
        #[serde(flatten)]
        projection: CreateProjection,
        /// Sources parsed by an earlier prepare.
        source_definition: SourceDefinition,
    },
    /// Load a prepared instance without starting it.
    #[serde(rename = "$load-stopped")]
    LoadStopped {
        /// Instance id.
        #[serde(with = "uuid::serde::simple")]
        id: Uuid,
    },
    /// Start a prepared instance.
    #[serde(rename = "$start")]
    Start {
        /// Instance id.
        #[serde(with = "uuid::serde::simple")]
        id: Uuid,
    },
    /// Stop an instance after its next checkpoint.
    #[serde(rename = "$stop")]
    Stop {
        /// Instance id.
        #[serde(with = "uuid::serde::simple")]
        id: Uuid,
    },
    /// Stop an instance immediately.
    #[serde(rename = "$kill")]
    Kill {
        /// Instance id.
        #[serde(with = "uuid::serde::simple")]
        id: Uuid,
    },
    /// Drop an instance.
    #[serde(rename = "$dispose")]
    Dispose {
        /// Instance id.
        #[serde(with = "uuid::serde::simple")]
        id: Uuid,
    },
    /// Read a partition state.
    #[serde(rename = "$get-state")]
    GetState {
        /// Request id echoed in the report.
        #[serde(with = "uuid::serde::simple")]
        correlation_id: Uuid,
        /// Instance id.
        #[serde(with = "uuid::serde::simple")]
        id: Uuid,
        /// Partition.
        partition: String,
    },
    /// Read a partition result.
    #[serde(rename = "$get-result")]
    GetResult {
        /// Request id echoed in the report.
        #[serde(with = "uuid::serde::simple")]
        correlation_id: Uuid,
        /// Instance id.
        #[serde(with = "uuid::serde::simple")]
        id: Uuid,
        /// Partition.
        partition: String,
    },
    /// Slave readers for a master projection are assigned.
    #[serde(rename = "$slave-projections-started")]
    SlaveProjectionsStarted {
        /// Master projection id.
        #[serde(with = "uuid::serde::simple")]
        id: Uuid,
        /// Slave channels.
        channels: SlaveProjectionCommunicationChannels,
    },
}

impl CoreCommand {
    /// Every tag a core command can be written under.
    pub const TAGS: [&'static str; 11] = [
        "$create-and-prepare",
        "$create-and-prepare-slave",
        "$create-prepared",
        "$load-stopped",
        "$start",
        "$stop",
        "$kill",
        "$dispose",
        "$get-state",
        "$get-result",
        "$slave-projections-started",
    ];

    /// Id of the instance the command targets.
    pub fn id(&self) -> Uuid {
        match self {
            Self::CreateAndPrepare(p)
            | Self::CreateAndPrepareSlave { projection: p, .. }
            | Self::CreatePrepared { projection: p, .. } => p.id,
            Self::LoadStopped { id }
            | Self::Start { id }
            | Self::Stop { id }
            | Self::Kill { id }
            | Self::Dispose { id }
            | Self::GetState { id, .. }
            | Self::GetResult { id, .. }
            | Self::SlaveProjectionsStarted { id, .. } => *id,
        }
    }

    /// Event type and JSON body for a worker stream.
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        encode_tagged(self)
    }

    /// Decode a worker-stream entry. Unknown tags are a protocol error.
    pub fn decode(tag: &str, body: &[u8]) -> Result<Self> {
        if !Self::TAGS.contains(&tag) {
            return Err(ProjectionError::Protocol {
                reason: format!("Unknown command: {}", tag),
            });
        }
        decode_tagged(tag, body)
    }
}

/// A partition state read by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateReport {
    /// Id of the `GetState` request.
    #[serde(with = "uuid::serde::simple")]
    pub correlation_id: Uuid,
    /// Instance id.
    #[serde(with = "uuid::serde::simple")]
    pub id: Uuid,
    /// Partition.
    pub partition: String,
    /// Serialized state.
    #[serde(default)]
    pub state: Option<String>,
    /// Position the state was computed at.
    #[serde(default)]
    pub position: Option<String>,
}

impl Correlated for StateReport {
    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

/// A partition result read by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultReport {
    /// Id of the `GetResult` request.
    #[serde(with = "uuid::serde::simple")]
    pub correlation_id: Uuid,
    /// Instance id.
    #[serde(with = "uuid::serde::simple")]
    pub id: Uuid,
    /// Partition.
    pub partition: String,
    /// Serialized result.
    #[serde(default)]
    pub result: Option<String>,
    /// Position the result was computed at.
    #[serde(default)]
    pub position: Option<String>,
}

impl Correlated for ResultReport {
    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

/// A status report sent by a worker to the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "body", rename_all_fields = "camelCase")]
pub enum CoreResponse {
    /// The worker announced itself.
    #[serde(rename = "$projection-worker-started")]
    WorkerStarted {
        /// Worker id.
        #[serde(with = "uuid::serde::simple")]
        id: Uuid,
    },
    /// The instance parsed its query.
    #[serde(rename = "$prepared")]
    Prepared {
        /// Instance id.
        #[serde(with = "uuid::serde::simple")]
        id: Uuid,
        /// Parsed sources.
        source_definition: SourceDefinition,
    },
    /// The instance is running.
    #[serde(rename = "$started")]
    Started {
        /// Instance id.
        #[serde(with = "uuid::serde::simple")]
        id: Uuid,
    },
    /// The instance stopped.
    #[serde(rename = "$stopped")]
    Stopped {
        /// Instance id.
        #[serde(with = "uuid::serde::simple")]
        id: Uuid,
        /// Projection name.
        name: String,
        /// Whether it stopped because it reached the end of its sources.
        completed: bool,
    },
    /// The instance faulted.
    #[serde(rename = "$faulted")]
    Faulted {
        /// Instance id.
        #[serde(with = "uuid::serde::simple")]
        id: Uuid,
        /// Fault reason.
        fault_message: String,
    },
    /// Periodic statistics.
    #[serde(rename = "$statistics-report")]
    StatisticsReport {
        /// Instance id.
        #[serde(with = "uuid::serde::simple")]
        id: Uuid,
        /// Worker-side statistics.
        statistics: ProjectionStatistics,
    },
    /// Answer to `GetState`.
    #[serde(rename = "$state")]
    State(StateReport),
    /// Answer to `GetResult`.
    #[serde(rename = "$result")]
    Result(ResultReport),
    /// A slave projection reader was subscribed.
    #[serde(rename = "$slave-projection-reader-assigned")]
    SlaveProjectionReaderAssigned {
        /// Instance id.
        #[serde(with = "uuid::serde::simple")]
        id: Uuid,
        /// Reader subscription id.
        #[serde(with = "uuid::serde::simple")]
        subscription_id: Uuid,
    },
}

impl CoreResponse {
    /// Every tag a core response can be written under.
    pub const TAGS: [&'static str; 9] = [
        "$projection-worker-started",
        "$prepared",
        "$started",
        "$stopped",
        "$faulted",
        "$statistics-report",
        "$state",
        "$result",
        "$slave-projection-reader-assigned",
    ];

    /// Event type and JSON body for the master stream.
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        encode_tagged(self)
    }

    /// Decode a master-stream entry. Returns `None` for tags that are not
    /// core responses.
    pub fn decode(tag: &str, body: &[u8]) -> Result<Option<Self>> {
        if !Self::TAGS.contains(&tag) {
            return Ok(None);
        }
        decode_tagged(tag, body).map(Some)
    }

    /// Short name used in fault messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkerStarted { .. } => "WorkerStarted",
            Self::Prepared { .. } => "Prepared",
            Self::Started { .. } => "Started",
            Self::Stopped { .. } => "Stopped",
            Self::Faulted { .. } => "Faulted",
            Self::StatisticsReport { .. } => "StatisticsReport",
            Self::State(_) => "State",
            Self::Result(_) => "Result",
            Self::SlaveProjectionReaderAssigned { .. } => "SlaveProjectionReaderAssigned",
        }
    }
}

/// A core command routed to a specific worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    /// Destination worker.
    pub worker_id: Uuid,
    /// The command.
    pub command: CoreCommand,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunAs;

    fn create(id: Uuid) -> CreateProjection {
        CreateProjection {
            id,
            name: "orders".to_string(),
            version: ProjectionVersion {
                projection_id: 3,
                epoch: -1,
                version: 0,
            },
            config: ProjectionConfig {
                run_as: RunAs::System,
                checkpoint_handled_threshold: 4000,
                checkpoint_unhandled_bytes_threshold: 10 * 1024 * 1024,
                checkpoint_after_ms: 2000,
                pending_events_threshold: 5000,
                max_write_batch_length: 500,
                maximum_allowed_writes_in_flight: 0,
                emit_event_enabled: false,
                checkpoints_enabled: true,
                create_temp_streams: false,
                stop_on_eof: false,
                is_slave_projection: false,
                track_emitted_streams: false,
            },
            handler_type: "JS".to_string(),
            query: "fromAll()".to_string(),
        }
    }

    #[test]
    fn test_ids_are_32_hex() {
        let id = Uuid::new_v4();
        let (tag, body) = CoreCommand::Start { id }.encode().unwrap();
        assert_eq!(tag, "$start");
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let encoded = json["id"].as_str().unwrap();
        assert_eq!(encoded.len(), 32);
        assert_eq!(encoded, id.simple().to_string());
    }

    #[test]
    fn test_create_prepared_body_is_flat() {
        let id = Uuid::new_v4();
        let command = CoreCommand::CreatePrepared {
            projection: create(id),
            source_definition: SourceDefinition {
                all_streams: true,
                ..Default::default()
            },
        };
        let (tag, body) = command.encode().unwrap();
        assert_eq!(tag, "$create-prepared");

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["name"], "orders");
        assert_eq!(json["version"]["projectionId"], 3);
        assert_eq!(json["sourceDefinition"]["allStreams"], true);

        let decoded = CoreCommand::decode(&tag, &body).unwrap();
        assert_eq!(decoded, command);
        assert_eq!(decoded.id(), id);
    }

    #[test]
    fn test_unknown_command_is_protocol_error() {
        let err = CoreCommand::decode("$bogus", b"{}").unwrap_err();
        assert!(err.to_string().contains("Unknown command: $bogus"));
    }

    #[test]
    fn test_response_decode() {
        let id = Uuid::new_v4();
        let body = format!(r#"{{"id":"{}","name":"orders","completed":true}}"#, id.simple());
        let response = CoreResponse::decode("$stopped", body.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(
            response,
            CoreResponse::Stopped {
                id,
                name: "orders".to_string(),
                completed: true
            }
        );
        assert!(CoreResponse::decode("$post", b"{}").unwrap().is_none());
    }

    #[test]
    fn test_state_report_is_correlated() {
        let correlation_id = Uuid::new_v4();
        let report = StateReport {
            correlation_id,
            id: Uuid::new_v4(),
            partition: String::new(),
            state: Some("{}".to_string()),
            position: None,
        };
        assert_eq!(report.correlation_id(), correlation_id);

        let (tag, body) = CoreResponse::State(report.clone()).encode().unwrap();
        assert_eq!(tag, "$state");
        assert_eq!(
            CoreResponse::decode(&tag, &body).unwrap(),
            Some(CoreResponse::State(report))
        );
    }
}
