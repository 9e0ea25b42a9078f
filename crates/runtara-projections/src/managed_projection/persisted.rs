// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable snapshot of a projection definition.
//!
//! The latest snapshot is the last `$ProjectionUpdated` event of the
//! projection's definition stream.

use serde::{Deserialize, Serialize};

use crate::error::{ProjectionError, Result};
use crate::messages::management::ProjectionSettings;
use crate::model::{
    DEFAULT_CHECKPOINT_AFTER_MS, DEFAULT_CHECKPOINT_HANDLED_THRESHOLD,
    DEFAULT_CHECKPOINT_UNHANDLED_BYTES_THRESHOLD, DEFAULT_MAX_ALLOWED_WRITES_IN_FLIGHT,
    DEFAULT_MAX_WRITE_BATCH_LENGTH, DEFAULT_PENDING_EVENTS_THRESHOLD, ProjectionConfig,
    ProjectionMode, RunAs, SerializedRunAs, SourceDefinition,
};

/// Persisted definition of a projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedState {
    /// Handler type, e.g. `JS` or `native:IndexStreams`.
    pub handler_type: Option<String>,
    /// Query text.
    pub query: Option<String>,
    /// Projection mode.
    pub mode: ProjectionMode,
    /// Whether the projection should run.
    pub enabled: bool,
    /// Deletion finished.
    pub deleted: bool,
    /// Deletion in progress.
    pub deleting: bool,
    /// Delete emitted streams on deletion.
    pub delete_emitted_streams: bool,
    /// Delete the checkpoint stream on deletion.
    pub delete_checkpoint_stream: bool,
    /// Delete the state stream on deletion.
    pub delete_state_stream: bool,
    /// Stream cleanups still outstanding before a deletion completes.
    pub prerequisites_remaining_for_deletion: i32,
    /// Sources reported by the last prepare.
    pub source_definition: Option<SourceDefinition>,
    /// Whether the projection may emit events.
    pub emit_enabled: Option<bool>,
    /// Whether temporary streams may be created.
    pub create_temp_streams: Option<bool>,
    /// Whether checkpoints are disabled.
    pub checkpoints_disabled: Option<bool>,
    /// Whether emitted streams are tracked.
    pub track_emitted_streams: Option<bool>,
    /// Version at which the projection was last reset.
    pub epoch: Option<i64>,
    /// Definition version; the event number of the snapshot once written.
    pub version: Option<i64>,
    /// Principal the handler runs as.
    pub run_as: Option<SerializedRunAs>,
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
    /// Minimum interval between checkpoints, in milliseconds.
    pub checkpoint_after_ms: i32,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            handler_type: None,
            query: None,
            mode: ProjectionMode::Continuous,
            enabled: false,
            deleted: false,
            deleting: false,
            delete_emitted_streams: false,
            delete_checkpoint_stream: false,
            delete_state_stream: false,
            prerequisites_remaining_for_deletion: 0,
            source_definition: None,
            emit_enabled: None,
            create_temp_streams: None,
            checkpoints_disabled: None,
            track_emitted_streams: None,
            epoch: None,
            version: None,
            run_as: None,
            checkpoint_handled_threshold: DEFAULT_CHECKPOINT_HANDLED_THRESHOLD,
            checkpoint_unhandled_bytes_threshold: DEFAULT_CHECKPOINT_UNHANDLED_BYTES_THRESHOLD,
            pending_events_threshold: DEFAULT_PENDING_EVENTS_THRESHOLD,
            max_write_batch_length: DEFAULT_MAX_WRITE_BATCH_LENGTH,
            max_allowed_writes_in_flight: DEFAULT_MAX_ALLOWED_WRITES_IN_FLIGHT,
            checkpoint_after_ms: DEFAULT_CHECKPOINT_AFTER_MS,
        }
    }
}

impl PersistedState {
    /// Reject snapshots a worker could not run.
    pub fn validate(&self) -> Result<()> {
        match self.handler_type.as_deref() {
            None => return Err(ProjectionError::fatal("persisted state has no handler type")),
            Some("") => return Err(ProjectionError::fatal("persisted state has an empty handler type")),
            Some(_) => {}
        }
        if self.query.is_none() {
            return Err(ProjectionError::fatal("persisted state has no query"));
        }
        Ok(())
    }

    /// Emit flag, false when unset.
    pub fn emit_enabled(&self) -> bool {
        self.emit_enabled.unwrap_or(false)
    }

    /// Tracking flag, false when unset.
    pub fn track_emitted_streams(&self) -> bool {
        self.track_emitted_streams.unwrap_or(false)
    }

    /// Whether the projection reads several explicit streams and keeps an order stream.
    pub fn is_multi_stream(&self) -> bool {
        self.source_definition
            .as_ref()
            .is_some_and(SourceDefinition::is_multi_stream)
    }

    /// Principal the projection runs as.
    pub fn principal(&self) -> RunAs {
        self.run_as.clone().map(RunAs::from).unwrap_or_default()
    }

    /// Configuration handed to the worker. Checkpoint thresholds are zeroed
    /// when checkpoints are disabled.
    pub fn projection_config(&self, is_slave_projection: bool) -> ProjectionConfig {
        let checkpoints_enabled = self.checkpoints_disabled != Some(true);
        ProjectionConfig {
            run_as: self.principal(),
            checkpoint_handled_threshold: if checkpoints_enabled {
                self.checkpoint_handled_threshold
            } else {
                0
            },
            checkpoint_unhandled_bytes_threshold: if checkpoints_enabled {
                self.checkpoint_unhandled_bytes_threshold
            } else {
                0
            },
            checkpoint_after_ms: if checkpoints_enabled {
                self.checkpoint_after_ms
            } else {
                0
            },
            pending_events_threshold: self.pending_events_threshold,
            max_write_batch_length: self.max_write_batch_length,
            maximum_allowed_writes_in_flight: self.max_allowed_writes_in_flight,
            emit_event_enabled: self.emit_enabled(),
            checkpoints_enabled,
            create_temp_streams: self.create_temp_streams == Some(true),
            stop_on_eof: self.mode <= ProjectionMode::OneTime,
            is_slave_projection,
            track_emitted_streams: self.track_emitted_streams(),
        }
    }

    /// Tunable thresholds as exposed by `GetConfig`.
    pub fn settings(&self) -> ProjectionSettings {
        ProjectionSettings {
            emit_enabled: self.emit_enabled(),
            track_emitted_streams: self.track_emitted_streams(),
            checkpoint_after_ms: self.checkpoint_after_ms,
            checkpoint_handled_threshold: self.checkpoint_handled_threshold,
            checkpoint_unhandled_bytes_threshold: self.checkpoint_unhandled_bytes_threshold,
            pending_events_threshold: self.pending_events_threshold,
            max_write_batch_length: self.max_write_batch_length,
            max_allowed_writes_in_flight: self.max_allowed_writes_in_flight,
        }
    }

    /// Replace the tunable thresholds.
    pub fn apply_settings(&mut self, settings: &ProjectionSettings) {
        self.emit_enabled = Some(settings.emit_enabled);
        self.track_emitted_streams = Some(settings.track_emitted_streams);
        self.checkpoint_after_ms = settings.checkpoint_after_ms;
        self.checkpoint_handled_threshold = settings.checkpoint_handled_threshold;
        self.checkpoint_unhandled_bytes_threshold = settings.checkpoint_unhandled_bytes_threshold;
        self.pending_events_threshold = settings.pending_events_threshold;
        self.max_write_batch_length = settings.max_write_batch_length;
        self.max_allowed_writes_in_flight = settings.max_allowed_writes_in_flight;
    }
}
