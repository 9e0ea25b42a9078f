// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain types shared by the manager, managed projections and workers.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default number of handled events between checkpoints.
pub const DEFAULT_CHECKPOINT_HANDLED_THRESHOLD: i32 = 4000;
/// Default minimum interval between checkpoints, in milliseconds.
pub const DEFAULT_CHECKPOINT_AFTER_MS: i32 = 2000;
/// Default number of unhandled bytes that forces a checkpoint.
pub const DEFAULT_CHECKPOINT_UNHANDLED_BYTES_THRESHOLD: i64 = 10 * 1024 * 1024;
/// Default number of pending events before the reader pauses.
pub const DEFAULT_PENDING_EVENTS_THRESHOLD: i32 = 5000;
/// Default maximum number of events in one emitted write.
pub const DEFAULT_MAX_WRITE_BATCH_LENGTH: i32 = 500;
/// Default maximum writes in flight; zero means unbounded.
pub const DEFAULT_MAX_ALLOWED_WRITES_IN_FLIGHT: i32 = 0;

/// Account name that marks the system principal in serialized form.
pub const SYSTEM_ACCOUNT: &str = "$system";

/// How long a projection lives and whether it is persisted.
///
/// Variants are ordered: only `OneTime` and above are written to the
/// registry, and only `Transient` projections expire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProjectionMode {
    /// Ephemeral query, never persisted, deleted after it expires.
    Transient,
    /// Ad-hoc query.
    AdHoc,
    /// Runs to the end of its sources and stops.
    OneTime,
    /// Runs indefinitely.
    Continuous,
}

impl fmt::Display for ProjectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "Transient",
            Self::AdHoc => "AdHoc",
            Self::OneTime => "OneTime",
            Self::Continuous => "Continuous",
        };
        f.write_str(s)
    }
}

/// Which projections the manager is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RunProjections {
    /// No projection runs, and bootstrap is skipped.
    None,
    /// Only system projections (names starting with `$`) run.
    System,
    /// Every projection runs.
    All,
}

impl RunProjections {
    /// Whether a projection with this name may run.
    pub fn allows(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::System => name.starts_with('$'),
            Self::None => false,
        }
    }
}

impl FromStr for RunProjections {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "system" => Ok(Self::System),
            "all" => Ok(Self::All),
            other => Err(format!("unknown run level: {}", other)),
        }
    }
}

/// Serialized form of a principal: a name plus roles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedRunAs {
    /// Principal name; `$system` for the system account, absent for anonymous.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Roles held by the principal.
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Principal a command or a projection runs as.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SerializedRunAs", into = "SerializedRunAs")]
pub enum RunAs {
    /// No identity.
    #[default]
    Anonymous,
    /// The system account.
    System,
    /// A named user.
    User {
        /// User name.
        name: String,
        /// Roles held by the user.
        roles: Vec<String>,
    },
}

impl RunAs {
    /// Shorthand for a named user.
    pub fn user(name: impl Into<String>, roles: &[&str]) -> Self {
        Self::User {
            name: name.into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    /// Whether this is the anonymous principal.
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }

    /// Whether the principal holds `role`; the system account holds every role.
    pub fn has_role(&self, role: &str) -> bool {
        match self {
            Self::System => true,
            Self::Anonymous => false,
            Self::User { roles, .. } => roles.iter().any(|r| r == role),
        }
    }
}

impl From<SerializedRunAs> for RunAs {
    fn from(value: SerializedRunAs) -> Self {
        match value.name {
            None => Self::Anonymous,
            Some(name) if name == SYSTEM_ACCOUNT => Self::System,
            Some(name) => Self::User {
                name,
                roles: value.roles,
            },
        }
    }
}

impl From<RunAs> for SerializedRunAs {
    fn from(value: RunAs) -> Self {
        match value {
            RunAs::Anonymous => Self::default(),
            RunAs::System => Self {
                name: Some(SYSTEM_ACCOUNT.to_string()),
                roles: vec!["$admins".to_string()],
            },
            RunAs::User { name, roles } => Self {
                name: Some(name),
                roles,
            },
        }
    }
}

/// Optimistic-concurrency identity of a projection definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionVersion {
    /// Id issued by the registry.
    pub projection_id: i64,
    /// Version at which the projection was last reset.
    pub epoch: i64,
    /// Current definition version.
    pub version: i64,
}

/// Parsed description of the sources a projection reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceDefinition {
    /// Reads `$all`.
    pub all_streams: bool,
    /// Accepts every event type.
    pub all_events: bool,
    /// Partitions state per stream.
    pub by_streams: bool,
    /// Partitions state by a custom function.
    pub by_custom_partitions: bool,
    /// Source categories.
    pub categories: Vec<String>,
    /// Source streams.
    pub streams: Vec<String>,
    /// Accepted event types.
    pub events: Vec<String>,
    /// Whether link events are resolved.
    pub include_links: bool,
    /// Result stream override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_stream_name: Option<String>,
}

impl SourceDefinition {
    /// Whether the projection reads more than one explicit stream and needs an order stream.
    pub fn is_multi_stream(&self) -> bool {
        self.streams.len() > 1
    }
}

/// Configuration handed to a worker with every create command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionConfig {
    /// Principal the handler runs as.
    pub run_as: RunAs,
    /// Handled events between checkpoints.
    pub checkpoint_handled_threshold: i32,
    /// Unhandled bytes that force a checkpoint.
    pub checkpoint_unhandled_bytes_threshold: i64,
    /// Minimum interval between checkpoints, in milliseconds.
    pub checkpoint_after_ms: i32,
    /// Pending events before reading pauses.
    pub pending_events_threshold: i32,
    /// Maximum events per emitted write.
    pub max_write_batch_length: i32,
    /// Maximum writes in flight, zero means unbounded.
    pub maximum_allowed_writes_in_flight: i32,
    /// Whether the projection may emit events.
    pub emit_event_enabled: bool,
    /// Whether checkpoints are written.
    pub checkpoints_enabled: bool,
    /// Whether temporary streams may be created.
    pub create_temp_streams: bool,
    /// Whether the projection stops at end of its sources.
    pub stop_on_eof: bool,
    /// Whether this is a slave projection.
    pub is_slave_projection: bool,
    /// Whether emitted streams are tracked for later deletion.
    pub track_emitted_streams: bool,
}

/// Worker-side statistics for a projection, enriched by the manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectionStatistics {
    /// Projection name.
    pub name: String,
    /// Registry id.
    pub projection_id: i64,
    /// Definition epoch, -1 when unknown.
    pub epoch: i64,
    /// Definition version, -1 when unknown.
    pub version: i64,
    /// Projection mode.
    pub mode: Option<ProjectionMode>,
    /// Composite `State/WorkerStatus` text.
    pub status: String,
    /// Reason of the last fault.
    pub state_reason: String,
    /// Whether the projection is enabled.
    pub enabled: bool,
    /// Last processed position as reported by the worker.
    pub position: String,
    /// Progress percentage, -1 when unknown.
    pub progress: f32,
    /// Events processed since the last restart.
    pub events_processed_after_restart: i64,
    /// Events buffered in the worker.
    pub buffered_events: i64,
    /// Checkpoint status text.
    pub checkpoint_status: String,
    /// Emitted writes in progress.
    pub writes_in_progress: i32,
    /// Source reads in progress.
    pub reads_in_progress: i32,
    /// Cached partition states.
    pub partitions_cached: i32,
    /// Result stream name, if any.
    pub result_stream_name: Option<String>,
}

/// Which projections a name-less `GetStatistics` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatisticsScope {
    /// Every non-deleted projection.
    All,
    /// Every non-deleted projection except transient ones.
    AllNonTransient,
    /// Only projections in this mode.
    Mode(ProjectionMode),
}

impl StatisticsScope {
    /// Whether a projection in `mode` is included.
    pub fn includes(&self, mode: ProjectionMode) -> bool {
        match self {
            Self::All => true,
            Self::AllNonTransient => mode != ProjectionMode::Transient,
            Self::Mode(m) => *m == mode,
        }
    }
}

/// How many slave projections are created for one definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlaveProjectionRequestedNumber {
    /// A single slave on the next worker.
    One,
    /// A single slave per node; equivalent to `One` on a single node.
    OnePerNode,
    /// One slave per worker.
    OnePerThread,
}

/// A slave projection requested by a master projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaveProjectionDefinition {
    /// Channel group name; slave names are `{master}-{name}-{index}`.
    pub name: String,
    /// Replication policy.
    pub requested_number: SlaveProjectionRequestedNumber,
    /// Handler type of the slaves.
    pub handler_type: String,
    /// Query text of the slaves.
    pub query: String,
    /// Whether slaves may emit.
    pub emit_enabled: bool,
    /// Whether slaves checkpoint.
    pub checkpoints_enabled: bool,
    /// Whether slaves run as the requester.
    pub enable_run_as: bool,
    /// Principal the slaves run as when `enable_run_as` is set.
    pub run_as: RunAs,
}

/// One slave projection reader a master can talk to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaveProjectionCommunicationChannel {
    /// Correlation id of the slave managed projection.
    #[serde(with = "uuid::serde::simple")]
    pub managed_projection_correlation_id: Uuid,
    /// Worker the slave runs on.
    #[serde(with = "uuid::serde::simple")]
    pub worker_id: Uuid,
    /// Reader subscription id assigned by the worker.
    #[serde(with = "uuid::serde::simple")]
    pub subscription_id: Uuid,
}

/// Slave channels grouped by definition name.
pub type SlaveProjectionCommunicationChannels =
    HashMap<String, Vec<SlaveProjectionCommunicationChannel>>;
