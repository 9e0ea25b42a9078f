// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory event log with scripted fault injection.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, watch};

use super::{
    EventLog, ExpectedVersion, NewEvent, OperationResult, ReadStreamResult, ReadStreamSlice,
    RecordedEvent, WriteEventsCompleted,
};
use crate::error::{ProjectionError, Result};

#[derive(Default)]
struct StreamData {
    events: Vec<RecordedEvent>,
    /// Events numbered below this are hidden by a soft delete.
    truncate_before: i64,
}

impl StreamData {
    fn next_number(&self) -> i64 {
        self.events.len() as i64
    }

    fn has_visible(&self) -> bool {
        self.next_number() > self.truncate_before
    }

    fn current_version(&self) -> i64 {
        if self.has_visible() {
            self.next_number() - 1
        } else {
            -1
        }
    }
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, StreamData>,
    position: i64,
    append_faults: HashMap<String, VecDeque<OperationResult>>,
    delete_faults: HashMap<String, VecDeque<OperationResult>>,
    append_attempts: HashMap<String, usize>,
    delete_attempts: HashMap<String, usize>,
}

fn version_matches(expected: ExpectedVersion, current: i64) -> bool {
    match expected {
        ExpectedVersion::Any => true,
        ExpectedVersion::NoStream => current == -1,
        ExpectedVersion::Exact(v) => current == v,
    }
}

/// Event log kept entirely in memory.
///
/// Faults can be scripted per stream: each queued [`OperationResult`] is
/// returned by one append (or delete) attempt without touching the stream.
pub struct InMemoryEventLog {
    inner: Mutex<Inner>,
    position_tx: watch::Sender<i64>,
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        let (position_tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            position_tx,
        }
    }

    /// Make the next appends to `stream` fail with `results`, in order.
    pub async fn fail_next_appends(&self, stream: &str, results: Vec<OperationResult>) {
        let mut inner = self.inner.lock().await;
        inner
            .append_faults
            .entry(stream.to_string())
            .or_default()
            .extend(results);
    }

    /// Make the next deletes of `stream` fail with `results`, in order.
    pub async fn fail_next_deletes(&self, stream: &str, results: Vec<OperationResult>) {
        let mut inner = self.inner.lock().await;
        inner
            .delete_faults
            .entry(stream.to_string())
            .or_default()
            .extend(results);
    }

    /// Number of append attempts made against `stream`, failed ones included.
    pub async fn append_attempts(&self, stream: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.append_attempts.get(stream).copied().unwrap_or(0)
    }

    /// Number of delete attempts made against `stream`, failed ones included.
    pub async fn delete_attempts(&self, stream: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.delete_attempts.get(stream).copied().unwrap_or(0)
    }

    /// Visible events of `stream`, oldest first.
    pub async fn stream_events(&self, stream: &str) -> Vec<RecordedEvent> {
        let inner = self.inner.lock().await;
        inner
            .streams
            .get(stream)
            .map(|s| s.events[s.truncate_before as usize..].to_vec())
            .unwrap_or_default()
    }

    /// Whether `stream` has been soft-deleted and not written since.
    pub async fn is_deleted(&self, stream: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .streams
            .get(stream)
            .is_some_and(|s| s.truncate_before > 0 && !s.has_visible())
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<WriteEventsCompleted> {
        let mut inner = self.inner.lock().await;
        *inner.append_attempts.entry(stream.to_string()).or_default() += 1;

        if let Some(result) = inner
            .append_faults
            .get_mut(stream)
            .and_then(|faults| faults.pop_front())
        {
            return Ok(WriteEventsCompleted::failed(result));
        }

        let mut position = inner.position;
        let data = inner.streams.entry(stream.to_string()).or_default();
        if !version_matches(expected_version, data.current_version()) {
            return Ok(WriteEventsCompleted::failed(
                OperationResult::WrongExpectedVersion,
            ));
        }

        let first = data.next_number();
        let now = Utc::now();
        for event in events {
            position += 1;
            let event_number = data.next_number();
            data.events.push(RecordedEvent {
                stream: stream.to_string(),
                event_number,
                event_id: event.event_id,
                event_type: event.event_type,
                data: event.data,
                metadata: event.metadata,
                created: now,
                position,
            });
        }
        let last = data.next_number() - 1;
        inner.position = position;
        self.position_tx.send_replace(position);

        Ok(WriteEventsCompleted {
            result: OperationResult::Success,
            first_event_number: first,
            last_event_number: last,
        })
    }

    async fn read_forward(
        &self,
        stream: &str,
        from: i64,
        max_count: usize,
    ) -> Result<ReadStreamSlice> {
        let inner = self.inner.lock().await;
        let head = inner.position;
        let Some(data) = inner.streams.get(stream).filter(|s| s.has_visible()) else {
            return Ok(ReadStreamSlice::empty(ReadStreamResult::NoStream, from, head));
        };

        let start = from.max(data.truncate_before);
        let end = (start + max_count as i64).min(data.next_number());
        let events: Vec<RecordedEvent> = if start < end {
            data.events[start as usize..end as usize].to_vec()
        } else {
            Vec::new()
        };
        let next_event_number = if events.is_empty() { start } else { end };
        let last_event_number = data.next_number() - 1;

        Ok(ReadStreamSlice {
            result: ReadStreamResult::Success,
            events,
            next_event_number,
            last_event_number,
            is_end_of_stream: next_event_number > last_event_number,
            last_commit_position: head,
        })
    }

    async fn read_backward(
        &self,
        stream: &str,
        from: i64,
        max_count: usize,
    ) -> Result<ReadStreamSlice> {
        let inner = self.inner.lock().await;
        let head = inner.position;
        let Some(data) = inner.streams.get(stream).filter(|s| s.has_visible()) else {
            return Ok(ReadStreamSlice::empty(ReadStreamResult::NoStream, -1, head));
        };

        let last_event_number = data.next_number() - 1;
        let start = if from < 0 || from > last_event_number {
            last_event_number
        } else {
            from
        };
        let lowest = (start - max_count as i64 + 1).max(data.truncate_before);
        let events: Vec<RecordedEvent> = if start >= lowest {
            data.events[lowest as usize..=start as usize]
                .iter()
                .rev()
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        let next = lowest - 1;
        let is_end_of_stream = next < data.truncate_before;

        Ok(ReadStreamSlice {
            result: ReadStreamResult::Success,
            events,
            next_event_number: if is_end_of_stream { -1 } else { next },
            last_event_number,
            is_end_of_stream,
            last_commit_position: head,
        })
    }

    async fn delete_stream(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
    ) -> Result<OperationResult> {
        let mut inner = self.inner.lock().await;
        *inner.delete_attempts.entry(stream.to_string()).or_default() += 1;

        if let Some(result) = inner
            .delete_faults
            .get_mut(stream)
            .and_then(|faults| faults.pop_front())
        {
            return Ok(result);
        }

        let position = inner.position + 1;
        let Some(data) = inner.streams.get_mut(stream) else {
            return Ok(OperationResult::Success);
        };
        if data.truncate_before > 0 && !data.has_visible() {
            return Ok(OperationResult::StreamDeleted);
        }
        if !version_matches(expected_version, data.current_version()) {
            return Ok(OperationResult::WrongExpectedVersion);
        }
        data.truncate_before = data.next_number();
        inner.position = position;
        self.position_tx.send_replace(position);

        Ok(OperationResult::Success)
    }

    async fn subscribe_awake(&self, _stream: &str, after_position: i64) -> Result<()> {
        let mut rx = self.position_tx.subscribe();
        rx.wait_for(|position| *position > after_position)
            .await
            .map_err(|_| ProjectionError::Unavailable {
                reason: "event log closed".to_string(),
            })?;
        Ok(())
    }
}
