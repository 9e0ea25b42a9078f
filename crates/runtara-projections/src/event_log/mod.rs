// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Append-only event log abstraction.
//!
//! The orchestration layer only needs to read, append and soft-delete named
//! streams, and to be woken when new data is committed. Result codes are
//! returned in-band so callers decide their own retry policy; only backend
//! faults are reported as `Err`.
//!
//! Two backends are provided:
//! - [`InMemoryEventLog`] for tests and embedding, with fault injection
//! - [`SqliteEventLog`] for durable single-node storage

mod memory;
mod sqlite;

pub use memory::InMemoryEventLog;
pub use sqlite::SqliteEventLog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Concurrency check applied to an append or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No check.
    Any,
    /// The stream must have no visible events.
    NoStream,
    /// The last event number must equal this value.
    Exact(i64),
}

/// Outcome of a write or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResult {
    /// Written.
    Success,
    /// The prepare phase timed out.
    PrepareTimeout,
    /// The commit phase timed out.
    CommitTimeout,
    /// Forwarding to the leader timed out.
    ForwardTimeout,
    /// The expected version check failed.
    WrongExpectedVersion,
    /// The stream was hard-deleted.
    StreamDeleted,
    /// The transaction was invalid.
    InvalidTransaction,
    /// Access was denied.
    AccessDenied,
}

impl OperationResult {
    /// Whether the same write may be resubmitted unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::PrepareTimeout
                | Self::CommitTimeout
                | Self::ForwardTimeout
                | Self::WrongExpectedVersion
        )
    }
}

impl std::fmt::Display for OperationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Outcome of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStreamResult {
    /// Events (possibly none) were read.
    Success,
    /// The stream has no visible events.
    NoStream,
    /// The stream was deleted.
    StreamDeleted,
    /// The read failed.
    Error,
    /// Access was denied.
    AccessDenied,
}

/// An event to append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    /// Unique id of the event.
    pub event_id: Uuid,
    /// Event type, used as the message tag on control streams.
    pub event_type: String,
    /// Payload bytes.
    pub data: Vec<u8>,
    /// Metadata bytes.
    pub metadata: Vec<u8>,
    /// Whether `data` is JSON.
    pub is_json: bool,
}

impl NewEvent {
    /// A JSON event.
    pub fn json(event_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            data,
            metadata: Vec::new(),
            is_json: true,
        }
    }

    /// A raw (non-JSON) event.
    pub fn raw(event_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            data: data.into(),
            metadata: Vec::new(),
            is_json: false,
        }
    }
}

/// An event read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Stream the event belongs to.
    pub stream: String,
    /// Number of the event within its stream, starting at 0.
    pub event_number: i64,
    /// Unique id of the event.
    pub event_id: Uuid,
    /// Event type.
    pub event_type: String,
    /// Payload bytes.
    pub data: Vec<u8>,
    /// Metadata bytes.
    pub metadata: Vec<u8>,
    /// Commit timestamp.
    pub created: DateTime<Utc>,
    /// Global commit position.
    pub position: i64,
}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteEventsCompleted {
    /// Outcome code.
    pub result: OperationResult,
    /// Number of the first written event, -1 when nothing was written.
    pub first_event_number: i64,
    /// Number of the last written event, -1 when nothing was written.
    pub last_event_number: i64,
}

impl WriteEventsCompleted {
    /// A failed write.
    pub fn failed(result: OperationResult) -> Self {
        Self {
            result,
            first_event_number: -1,
            last_event_number: -1,
        }
    }
}

/// Result of a forward or backward read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStreamSlice {
    /// Outcome code.
    pub result: ReadStreamResult,
    /// Events in read order.
    pub events: Vec<RecordedEvent>,
    /// Where the next read in the same direction should start.
    pub next_event_number: i64,
    /// Last event number of the stream, -1 when empty.
    pub last_event_number: i64,
    /// Whether the read reached the end in its direction.
    pub is_end_of_stream: bool,
    /// Global commit position of the log when the read happened.
    pub last_commit_position: i64,
}

impl ReadStreamSlice {
    /// An empty slice with the given result.
    pub fn empty(result: ReadStreamResult, from: i64, last_commit_position: i64) -> Self {
        Self {
            result,
            events: Vec::new(),
            next_event_number: from,
            last_event_number: -1,
            is_end_of_stream: true,
            last_commit_position,
        }
    }
}

/// Read/append interface against named streams.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append events to a stream.
    async fn append(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<WriteEventsCompleted>;

    /// Read up to `max_count` events with numbers `>= from`.
    async fn read_forward(&self, stream: &str, from: i64, max_count: usize)
    -> Result<ReadStreamSlice>;

    /// Read up to `max_count` events with numbers `<= from`, newest first.
    /// `from = -1` starts at the end of the stream.
    async fn read_backward(
        &self,
        stream: &str,
        from: i64,
        max_count: usize,
    ) -> Result<ReadStreamSlice>;

    /// Soft-delete a stream. Later appends continue its numbering.
    async fn delete_stream(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
    ) -> Result<OperationResult>;

    /// Resolve once the log's commit position passes `after_position`.
    async fn subscribe_awake(&self, stream: &str, after_position: i64) -> Result<()>;
}
