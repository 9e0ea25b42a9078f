// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client-facing management commands and their replies.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use super::{decode_tagged, encode_tagged};
use crate::error::{ProjectionError, Result};
use crate::model::{
    DEFAULT_CHECKPOINT_AFTER_MS, DEFAULT_CHECKPOINT_HANDLED_THRESHOLD,
    DEFAULT_CHECKPOINT_UNHANDLED_BYTES_THRESHOLD, DEFAULT_MAX_ALLOWED_WRITES_IN_FLIGHT,
    DEFAULT_MAX_WRITE_BATCH_LENGTH, DEFAULT_PENDING_EVENTS_THRESHOLD, ProjectionMode,
    ProjectionStatistics, RunAs, SlaveProjectionCommunicationChannels, SlaveProjectionDefinition,
    SourceDefinition, StatisticsScope,
};

/// Create a new projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    /// Unique projection name.
    pub name: String,
    /// Projection mode.
    pub mode: ProjectionMode,
    /// Handler type, e.g. `JS` or `native:IndexStreams`.
    pub handler_type: String,
    /// Query text passed to the handler.
    pub query: String,
    /// Whether the projection starts enabled.
    pub enabled: bool,
    /// Whether checkpoints are written.
    pub checkpoints_enabled: bool,
    /// Whether the projection may emit events.
    pub emit_enabled: bool,
    /// Whether emitted streams are tracked.
    #[serde(default)]
    pub track_emitted_streams: bool,
    /// Whether the projection runs as the requester.
    #[serde(default)]
    pub enable_run_as: bool,
    /// Requesting principal.
    #[serde(default)]
    pub run_as: RunAs,
}

impl Post {
    /// An enabled, non-emitting projection posted by the system account.
    pub fn new(
        name: impl Into<String>,
        mode: ProjectionMode,
        handler_type: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mode,
            handler_type: handler_type.into(),
            query: query.into(),
            enabled: true,
            checkpoints_enabled: mode >= ProjectionMode::OneTime,
            emit_enabled: false,
            track_emitted_streams: false,
            enable_run_as: false,
            run_as: RunAs::System,
        }
    }
}

/// Whether a `SetRunAs` replaces or clears the principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetRunAsAction {
    /// Run as the requester.
    Set,
    /// Run with no principal.
    Clear,
}

/// Delete a stopped or faulted projection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delete {
    /// Projection name.
    pub name: String,
    /// Also delete the checkpoint stream.
    #[serde(default)]
    pub delete_checkpoint_stream: bool,
    /// Also delete the state stream.
    #[serde(default)]
    pub delete_state_stream: bool,
    /// Also delete every stream the projection emitted to.
    #[serde(default)]
    pub delete_emitted_streams: bool,
    /// Requesting principal.
    #[serde(default)]
    pub run_as: RunAs,
}

/// Change the query text of a projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateQuery {
    /// Projection name.
    pub name: String,
    /// New handler type; unchanged when absent.
    #[serde(default)]
    pub handler_type: Option<String>,
    /// New query text.
    pub query: String,
    /// New emit flag; unchanged when absent.
    #[serde(default)]
    pub emit_enabled: Option<bool>,
    /// Requesting principal.
    #[serde(default)]
    pub run_as: RunAs,
}

/// Tunable thresholds of a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionSettings {
    /// Whether the projection may emit events.
    pub emit_enabled: bool,
    /// Whether emitted streams are tracked.
    pub track_emitted_streams: bool,
    /// Minimum interval between checkpoints, in milliseconds.
    pub checkpoint_after_ms: i32,
    /// Handled events between checkpoints.
    pub checkpoint_handled_threshold: i32,
    /// Unhandled bytes that force a checkpoint.
    pub checkpoint_unhandled_bytes_threshold: i64,
    /// Pending events before reading pauses.
    pub pending_events_threshold: i32,
    /// Maximum events per emitted write.
    pub max_write_batch_length: i32,
    /// Maximum writes in flight, zero means unbounded.
    pub max_allowed_writes_in_flight: i32,
}

impl Default for ProjectionSettings {
    fn default() -> Self {
        Self {
            emit_enabled: false,
            track_emitted_streams: false,
            checkpoint_after_ms: DEFAULT_CHECKPOINT_AFTER_MS,
            checkpoint_handled_threshold: DEFAULT_CHECKPOINT_HANDLED_THRESHOLD,
            checkpoint_unhandled_bytes_threshold: DEFAULT_CHECKPOINT_UNHANDLED_BYTES_THRESHOLD,
            pending_events_threshold: DEFAULT_PENDING_EVENTS_THRESHOLD,
            max_write_batch_length: DEFAULT_MAX_WRITE_BATCH_LENGTH,
            max_allowed_writes_in_flight: DEFAULT_MAX_ALLOWED_WRITES_IN_FLIGHT,
        }
    }
}

/// Spawn slave projections for a master projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSlaveProjections {
    /// Master projection name.
    pub name: String,
    /// Worker the master runs on.
    #[serde(with = "uuid::serde::simple")]
    pub master_worker_id: Uuid,
    /// Correlation id of the master projection.
    #[serde(with = "uuid::serde::simple")]
    pub master_correlation_id: Uuid,
    /// Requested slave groups.
    pub slave_projections: Vec<SlaveProjectionDefinition>,
    /// Requesting principal.
    #[serde(default)]
    pub run_as: RunAs,
}

/// Body of commands that only name a projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Named {
    /// Projection name.
    pub name: String,
    /// Requesting principal.
    #[serde(default)]
    pub run_as: RunAs,
}

impl Named {
    /// Name a projection on behalf of `run_as`.
    pub fn new(name: impl Into<String>, run_as: RunAs) -> Self {
        Self {
            name: name.into(),
            run_as,
        }
    }
}

/// Body of partition queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionQuery {
    /// Projection name.
    pub name: String,
    /// Partition, empty for the root partition.
    #[serde(default)]
    pub partition: String,
}

/// A command addressed to the projection manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "body")]
pub enum ManagementCommand {
    /// Create a projection.
    #[serde(rename = "$post")]
    Post(Post),
    /// Disable a projection and stop it.
    #[serde(rename = "$disable")]
    Disable(Named),
    /// Enable a projection and start it.
    #[serde(rename = "$enable")]
    Enable(Named),
    /// Disable a projection and kill its worker instance.
    #[serde(rename = "$abort")]
    Abort(Named),
    /// Set or clear the run-as principal.
    #[serde(rename = "$set-runas")]
    SetRunAs {
        /// Target projection.
        #[serde(flatten)]
        target: Named,
        /// Whether to set or clear.
        action: SetRunAsAction,
    },
    /// Replace the query text.
    #[serde(rename = "$update-query")]
    UpdateQuery(UpdateQuery),
    /// Reset the projection to a new epoch.
    #[serde(rename = "$reset")]
    Reset(Named),
    /// Delete a projection.
    #[serde(rename = "$delete")]
    Delete(Delete),
    /// Read the query text.
    #[serde(rename = "$get-query")]
    GetQuery(Named),
    /// Read a partition state.
    #[serde(rename = "$get-state")]
    GetState(PartitionQuery),
    /// Read a partition result.
    #[serde(rename = "$get-result")]
    GetResult(PartitionQuery),
    /// Read statistics of one projection or a filtered set.
    #[serde(rename = "$get-statistics")]
    GetStatistics {
        /// Projection name, or every projection in `scope` when absent.
        #[serde(default)]
        name: Option<String>,
        /// Filter used without a name.
        scope: StatisticsScope,
    },
    /// Read the tunable thresholds.
    #[serde(rename = "$get-config")]
    GetConfig(Named),
    /// Replace the tunable thresholds.
    #[serde(rename = "$update-config")]
    UpdateConfig {
        /// Target projection.
        #[serde(flatten)]
        target: Named,
        /// New thresholds.
        settings: ProjectionSettings,
    },
    /// Spawn slave projections.
    #[serde(rename = "$start-slave-projections")]
    StartSlaveProjections(StartSlaveProjections),
}

impl ManagementCommand {
    /// Every tag a management command can be written under.
    pub const TAGS: [&'static str; 15] = [
        "$post",
        "$disable",
        "$enable",
        "$abort",
        "$set-runas",
        "$update-query",
        "$reset",
        "$delete",
        "$get-query",
        "$get-state",
        "$get-result",
        "$get-statistics",
        "$get-config",
        "$update-config",
        "$start-slave-projections",
    ];

    /// Target projection name, if the command has one.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Post(p) => Some(&p.name),
            Self::Disable(n)
            | Self::Enable(n)
            | Self::Abort(n)
            | Self::Reset(n)
            | Self::GetQuery(n)
            | Self::GetConfig(n)
            | Self::SetRunAs { target: n, .. }
            | Self::UpdateConfig { target: n, .. } => Some(&n.name),
            Self::UpdateQuery(u) => Some(&u.name),
            Self::Delete(d) => Some(&d.name),
            Self::GetState(q) | Self::GetResult(q) => Some(&q.name),
            Self::GetStatistics { name, .. } => name.as_deref(),
            Self::StartSlaveProjections(s) => Some(&s.name),
        }
    }

    /// Requesting principal of commands subject to authorization.
    pub fn run_as(&self) -> Option<&RunAs> {
        match self {
            Self::Post(p) => Some(&p.run_as),
            Self::Disable(n)
            | Self::Enable(n)
            | Self::Abort(n)
            | Self::Reset(n)
            | Self::GetQuery(n)
            | Self::GetConfig(n)
            | Self::SetRunAs { target: n, .. }
            | Self::UpdateConfig { target: n, .. } => Some(&n.run_as),
            Self::UpdateQuery(u) => Some(&u.run_as),
            Self::Delete(d) => Some(&d.run_as),
            Self::StartSlaveProjections(s) => Some(&s.run_as),
            Self::GetState(_) | Self::GetResult(_) | Self::GetStatistics { .. } => None,
        }
    }

    /// Event type and JSON body for a control stream.
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        encode_tagged(self)
    }

    /// Decode a control-stream entry. Returns `None` for tags that are not
    /// management commands.
    pub fn decode(tag: &str, body: &[u8]) -> Result<Option<Self>> {
        if !Self::TAGS.contains(&tag) {
            return Ok(None);
        }
        decode_tagged(tag, body).map(Some)
    }
}

/// Terminal reply to a management command.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagementReply {
    /// The command completed.
    Updated {
        /// Projection name.
        name: String,
    },
    /// No projection has the requested name.
    NotFound {
        /// Requested name.
        name: String,
    },
    /// A projection with the name already exists.
    Conflict {
        /// Duplicate name.
        name: String,
    },
    /// The command failed.
    OperationFailed {
        /// Failure reason.
        reason: String,
    },
    /// The requester may not run the command.
    NotAuthorized,
    /// State of a partition.
    ProjectionState {
        /// Projection name.
        name: String,
        /// Partition.
        partition: String,
        /// Serialized state, empty when not running.
        state: String,
        /// Position the state was computed at.
        position: Option<String>,
    },
    /// Result of a partition.
    ProjectionResult {
        /// Projection name.
        name: String,
        /// Partition.
        partition: String,
        /// Serialized result, empty when not running.
        result: String,
        /// Position the result was computed at.
        position: Option<String>,
    },
    /// Query text and source description.
    ProjectionQuery {
        /// Projection name.
        name: String,
        /// Query text.
        query: String,
        /// Whether emit is enabled.
        emit_enabled: bool,
        /// Parsed sources, once prepared.
        source_definition: Option<SourceDefinition>,
        /// Result stream, if the projection writes one.
        result_stream_name: Option<String>,
    },
    /// Tunable thresholds.
    ProjectionConfig {
        /// Projection name.
        name: String,
        /// Current thresholds.
        settings: ProjectionSettings,
    },
    /// Statistics of one or more projections.
    Statistics {
        /// One entry per projection.
        projections: Vec<ProjectionStatistics>,
    },
    /// Every requested slave projection has a reader.
    SlaveProjectionsStarted {
        /// Channels grouped by slave definition name.
        channels: SlaveProjectionCommunicationChannels,
    },
}

impl ManagementReply {
    /// Convert failure replies into errors.
    pub fn into_result(self) -> Result<Self> {
        match self {
            Self::NotFound { name } => Err(ProjectionError::NotFound { name }),
            Self::Conflict { name } => Err(ProjectionError::Conflict { name }),
            Self::OperationFailed { reason } => Err(ProjectionError::OperationFailed { reason }),
            Self::NotAuthorized => Err(ProjectionError::NotAuthorized),
            other => Ok(other),
        }
    }

    /// The failure reply matching an error.
    pub fn from_error(err: &ProjectionError) -> Self {
        match err {
            ProjectionError::NotFound { name } => Self::NotFound { name: name.clone() },
            ProjectionError::Conflict { name } => Self::Conflict { name: name.clone() },
            ProjectionError::NotAuthorized => Self::NotAuthorized,
            other => Self::OperationFailed {
                reason: other.to_string(),
            },
        }
    }
}

/// Where the reply to a command goes.
///
/// Commands read from a control stream carry an envelope without a receiver.
#[derive(Debug, Default)]
pub struct Envelope {
    reply_to: Option<oneshot::Sender<ManagementReply>>,
}

impl Envelope {
    /// An envelope and the receiver of its reply.
    pub fn new() -> (Self, oneshot::Receiver<ManagementReply>) {
        let (tx, rx) = oneshot::channel();
        (Self { reply_to: Some(tx) }, rx)
    }

    /// An envelope whose reply is discarded.
    pub fn noop() -> Self {
        Self::default()
    }

    /// Send the reply. A caller that stopped waiting is ignored.
    pub fn reply(self, reply: ManagementReply) {
        if let Some(tx) = self.reply_to
            && tx.send(reply).is_err()
        {
            debug!("Reply receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_encodes_under_tag() {
        let command = ManagementCommand::Post(Post::new(
            "orders",
            ProjectionMode::Continuous,
            "JS",
            "fromAll()",
        ));
        let (tag, body) = command.encode().unwrap();
        assert_eq!(tag, "$post");

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["name"], "orders");
        assert_eq!(json["mode"], "Continuous");
        assert_eq!(json["handlerType"], "JS");
        assert_eq!(json["runAs"]["name"], "$system");

        let decoded = ManagementCommand::decode(&tag, &body).unwrap().unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn test_flattened_target_body() {
        let command = ManagementCommand::SetRunAs {
            target: Named::new("orders", RunAs::user("ann", &["$admins"])),
            action: SetRunAsAction::Clear,
        };
        let (tag, body) = command.encode().unwrap();
        assert_eq!(tag, "$set-runas");
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["name"], "orders");
        assert_eq!(json["action"], "Clear");
        assert_eq!(command.name(), Some("orders"));
    }

    #[test]
    fn test_decode_ignores_foreign_tags() {
        assert!(ManagementCommand::decode("$started", b"{}").unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_malformed_body() {
        let err = ManagementCommand::decode("$delete", b"{\"nope\":1}").unwrap_err();
        assert_eq!(err.error_code(), "PROTOCOL_ERROR");
    }

    #[test]
    fn test_reply_into_result() {
        assert!(matches!(
            ManagementReply::Conflict {
                name: "a".to_string()
            }
            .into_result(),
            Err(ProjectionError::Conflict { .. })
        ));
        assert!(
            ManagementReply::Updated {
                name: "a".to_string()
            }
            .into_result()
            .is_ok()
        );
    }

    #[tokio::test]
    async fn test_envelope_delivers_once() {
        let (envelope, rx) = Envelope::new();
        envelope.reply(ManagementReply::NotAuthorized);
        assert_eq!(rx.await.unwrap(), ManagementReply::NotAuthorized);

        let (envelope, rx) = Envelope::new();
        drop(rx);
        envelope.reply(ManagementReply::NotAuthorized);
        Envelope::noop().reply(ManagementReply::NotAuthorized);
    }
}
