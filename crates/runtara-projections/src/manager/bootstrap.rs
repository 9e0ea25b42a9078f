// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry reads and writes used to rebuild the live projection set.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{ProjectionError, Result};
use crate::event_log::{
    EventLog, ExpectedVersion, NewEvent, OperationResult, ReadStreamResult, RecordedEvent,
    WriteEventsCompleted,
};
use crate::names::{
    PROJECTIONS_REGISTRY_STREAM, REGISTRATION_RETRIES, REGISTRY_READ_PAGE_SIZE, event_types,
};

/// Standard projections created on an empty registry: name, handler, query.
pub(crate) const SYSTEM_PROJECTIONS: [(&str, &str, &str); 5] = [
    ("$streams", "IndexStreams", ""),
    ("$stream_by_category", "CategorizeStreamByPath", "first\r\n-"),
    ("$by_category", "CategorizeEventsByStreamPath", "first\r\n-"),
    ("$by_event_type", "IndexEventsByEventType", ""),
    (
        "$by_correlation_id",
        "ByCorrelationId",
        r#"{"correlationIdProperty":"$correlationId"}"#,
    ),
];

pub(crate) fn is_system_projection(name: &str) -> bool {
    SYSTEM_PROJECTIONS.iter().any(|(system, _, _)| *system == name)
}

/// Registry projection id 0 collides with "no projection".
pub(crate) fn registry_projection_id(event_number: i64) -> i64 {
    if event_number == 0 {
        i64::from(i32::MAX - 1)
    } else {
        event_number
    }
}

/// What the registry says about the live projection set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct RegistrySnapshot {
    /// The registry has no events at all.
    pub(crate) empty: bool,
    /// Surviving projections with the event number of their latest creation,
    /// in registration order.
    pub(crate) projections: Vec<(String, i64)>,
}

fn is_newer(candidate: &RecordedEvent, current: &RecordedEvent) -> bool {
    (candidate.created, candidate.event_number) > (current.created, current.event_number)
}

/// Read the registry backward and keep each name's latest marker, dropping
/// names whose latest marker is a deletion.
pub(crate) async fn read_registry(log: &dyn EventLog) -> Result<RegistrySnapshot> {
    let mut latest: HashMap<String, RecordedEvent> = HashMap::new();
    let mut from = -1;
    let mut first_page = true;
    let mut empty = false;

    loop {
        let slice = log
            .read_backward(PROJECTIONS_REGISTRY_STREAM, from, REGISTRY_READ_PAGE_SIZE)
            .await?;
        match slice.result {
            ReadStreamResult::Success => {}
            ReadStreamResult::NoStream => {
                empty = first_page;
                break;
            }
            other => {
                return Err(ProjectionError::Storage {
                    operation: "read projections registry".to_string(),
                    details: format!("{:?}", other),
                });
            }
        }
        if first_page && slice.events.is_empty() {
            empty = true;
        }
        first_page = false;

        for event in slice.events {
            if event.event_type != event_types::PROJECTION_CREATED
                && event.event_type != event_types::PROJECTION_DELETED
            {
                continue;
            }
            let name = match String::from_utf8(event.data.clone()) {
                Ok(name) => name,
                Err(e) => {
                    warn!(event_number = event.event_number, error = %e, "Skipping registry entry with invalid name");
                    continue;
                }
            };
            match latest.get(&name) {
                Some(current) if !is_newer(&event, current) => {}
                _ => {
                    latest.insert(name, event);
                }
            }
        }

        if slice.is_end_of_stream {
            break;
        }
        from = slice.next_event_number;
    }

    let mut projections: Vec<(String, i64)> = latest
        .into_iter()
        .filter(|(_, event)| event.event_type == event_types::PROJECTION_CREATED)
        .map(|(name, event)| (name, event.event_number))
        .collect();
    projections.sort_by_key(|(_, event_number)| *event_number);
    debug!(count = projections.len(), empty, "Projections registry read");

    Ok(RegistrySnapshot { empty, projections })
}

/// Append a raw-name marker to the registry, retrying transient codes up to
/// `REGISTRATION_RETRIES` times.
pub(crate) async fn write_registry_marker(
    log: &dyn EventLog,
    event_type: &str,
    name: &str,
) -> Result<WriteEventsCompleted> {
    let mut retries_left = REGISTRATION_RETRIES;
    loop {
        let completed = log
            .append(
                PROJECTIONS_REGISTRY_STREAM,
                ExpectedVersion::Any,
                vec![NewEvent::raw(event_type, name)],
            )
            .await?;
        if completed.result == OperationResult::Success
            || !completed.result.is_transient()
            || retries_left == 0
        {
            return Ok(completed);
        }
        retries_left -= 1;
        warn!(projection = %name, result = %completed.result, "Registry write failed, retrying");
    }
}

/// Mark the registry as initialized; only succeeds on an empty registry.
pub(crate) async fn write_initialized(log: &dyn EventLog) -> Result<WriteEventsCompleted> {
    loop {
        let completed = log
            .append(
                PROJECTIONS_REGISTRY_STREAM,
                ExpectedVersion::NoStream,
                vec![NewEvent::raw(event_types::PROJECTIONS_INITIALIZED, "")],
            )
            .await?;
        match completed.result {
            OperationResult::PrepareTimeout
            | OperationResult::CommitTimeout
            | OperationResult::ForwardTimeout => {
                debug!(result = %completed.result, "Registry initialization timed out, retrying");
            }
            _ => return Ok(completed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::InMemoryEventLog;

    async fn mark(log: &InMemoryEventLog, event_type: &str, name: &str) {
        log.append(
            PROJECTIONS_REGISTRY_STREAM,
            ExpectedVersion::Any,
            vec![NewEvent::raw(event_type, name)],
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_latest_marker_wins() {
        let log = InMemoryEventLog::new();
        mark(&log, event_types::PROJECTION_CREATED, "A").await;
        mark(&log, event_types::PROJECTION_CREATED, "B").await;
        mark(&log, event_types::PROJECTION_DELETED, "B").await;
        mark(&log, event_types::PROJECTION_CREATED, "A").await;

        let snapshot = read_registry(&log).await.unwrap();
        assert!(!snapshot.empty);
        assert_eq!(snapshot.projections, vec![("A".to_string(), 3)]);
    }

    #[tokio::test]
    async fn test_reads_every_page() {
        let log = InMemoryEventLog::new();
        for i in 0..(REGISTRY_READ_PAGE_SIZE + 5) {
            mark(&log, event_types::PROJECTION_CREATED, &format!("p{}", i)).await;
        }
        let snapshot = read_registry(&log).await.unwrap();
        assert_eq!(snapshot.projections.len(), REGISTRY_READ_PAGE_SIZE + 5);
        assert_eq!(snapshot.projections[0], ("p0".to_string(), 0));
    }

    #[tokio::test]
    async fn test_missing_registry_is_empty() {
        let log = InMemoryEventLog::new();
        let snapshot = read_registry(&log).await.unwrap();
        assert!(snapshot.empty);
        assert!(snapshot.projections.is_empty());
    }

    #[tokio::test]
    async fn test_registration_retried_once() {
        let log = InMemoryEventLog::new();
        log.fail_next_appends(
            PROJECTIONS_REGISTRY_STREAM,
            vec![OperationResult::CommitTimeout, OperationResult::CommitTimeout],
        )
        .await;
        let completed = write_registry_marker(&log, event_types::PROJECTION_CREATED, "p")
            .await
            .unwrap();
        assert_eq!(completed.result, OperationResult::CommitTimeout);
        assert_eq!(
            log.append_attempts(PROJECTIONS_REGISTRY_STREAM).await,
            1 + REGISTRATION_RETRIES as usize
        );
    }

    #[tokio::test]
    async fn test_initialized_only_once() {
        let log = InMemoryEventLog::new();
        assert_eq!(
            write_initialized(&log).await.unwrap().result,
            OperationResult::Success
        );
        assert_eq!(
            write_initialized(&log).await.unwrap().result,
            OperationResult::WrongExpectedVersion
        );
    }

    #[test]
    fn test_zero_projection_id_is_remapped() {
        assert_eq!(registry_projection_id(0), 2147483646);
        assert_eq!(registry_projection_id(7), 7);
    }
}
