// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed event log.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::watch;
use uuid::Uuid;

use super::{
    EventLog, ExpectedVersion, NewEvent, OperationResult, ReadStreamResult, ReadStreamSlice,
    RecordedEvent, WriteEventsCompleted,
};
use crate::error::{ProjectionError, Result};
use crate::migrations;

#[derive(Debug, Clone, sqlx::FromRow)]
struct EventRow {
    position: i64,
    stream: String,
    event_number: i64,
    event_id: String,
    event_type: String,
    data: Vec<u8>,
    metadata: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for RecordedEvent {
    type Error = ProjectionError;

    fn try_from(row: EventRow) -> Result<Self> {
        let event_id = Uuid::parse_str(&row.event_id).map_err(|e| ProjectionError::Storage {
            operation: "decode_event".to_string(),
            details: format!("invalid event id {}: {}", row.event_id, e),
        })?;
        Ok(Self {
            stream: row.stream,
            event_number: row.event_number,
            event_id,
            event_type: row.event_type,
            data: row.data,
            metadata: row.metadata,
            created: row.created_at,
            position: row.position,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, sqlx::FromRow)]
struct StreamRow {
    next_event_number: i64,
    truncate_before: i64,
}

impl StreamRow {
    fn has_visible(&self) -> bool {
        self.next_event_number > self.truncate_before
    }

    fn current_version(&self) -> i64 {
        if self.has_visible() {
            self.next_event_number - 1
        } else {
            -1
        }
    }
}

fn version_matches(expected: ExpectedVersion, current: i64) -> bool {
    match expected {
        ExpectedVersion::Any => true,
        ExpectedVersion::NoStream => current == -1,
        ExpectedVersion::Exact(v) => current == v,
    }
}

/// Busy, locked and pool-exhausted conditions are reported as commit timeouts.
fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| matches!(code.as_ref(), "5" | "6" | "517")),
        _ => false,
    }
}

fn storage_error(operation: &str, err: sqlx::Error) -> ProjectionError {
    ProjectionError::Storage {
        operation: operation.to_string(),
        details: err.to_string(),
    }
}

enum WriteOutcome {
    Written { first: i64, last: i64, position: i64 },
    Rejected(OperationResult),
}

/// Event log stored in a SQLite database.
#[derive(Clone)]
pub struct SqliteEventLog {
    pool: SqlitePool,
    position_tx: watch::Sender<i64>,
}

impl SqliteEventLog {
    /// Create a new event log from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        let (position_tx, _) = watch::channel(0);
        Self { pool, position_tx }
    }

    /// Create and initialize a new SQLite event log from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let log = SqliteEventLog::from_path(".data/projections.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| ProjectionError::Storage {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::open(&url).await
    }

    /// Connect to a SQLite URL and run migrations.
    ///
    /// A plain path (without the `sqlite:` scheme) is treated as a file path.
    pub async fn connect(url: &str) -> Result<Self> {
        if url.starts_with("sqlite:") {
            Self::open(url).await
        } else {
            Self::from_path(url).await
        }
    }

    async fn open(url: &str) -> Result<Self> {
        // Every connection to an in-memory database is a separate database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| ProjectionError::Storage {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| ProjectionError::Storage {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self::new(pool))
    }

    async fn stream_row(&self, stream: &str) -> std::result::Result<Option<StreamRow>, sqlx::Error> {
        sqlx::query_as::<_, StreamRow>(
            r#"
            SELECT next_event_number, truncate_before
            FROM streams
            WHERE stream = ?
            "#,
        )
        .bind(stream)
        .fetch_optional(&self.pool)
        .await
    }

    async fn head_position(&self) -> std::result::Result<i64, sqlx::Error> {
        let head: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(position), 0) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(head)
    }

    async fn write(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> std::result::Result<WriteOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, StreamRow>(
            "SELECT next_event_number, truncate_before FROM streams WHERE stream = ?",
        )
        .bind(stream)
        .fetch_optional(&mut *tx)
        .await?
        .unwrap_or_default();

        if !version_matches(expected_version, row.current_version()) {
            return Ok(WriteOutcome::Rejected(OperationResult::WrongExpectedVersion));
        }

        let first = row.next_event_number;
        let mut next = first;
        let mut position = 0;
        let now = Utc::now();
        for event in events {
            let inserted = sqlx::query(
                r#"
                INSERT INTO events (stream, event_number, event_id, event_type, data, metadata, is_json, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(stream)
            .bind(next)
            .bind(event.event_id.to_string())
            .bind(&event.event_type)
            .bind(&event.data)
            .bind(&event.metadata)
            .bind(event.is_json)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            position = inserted.last_insert_rowid();
            next += 1;
        }

        sqlx::query(
            r#"
            INSERT INTO streams (stream, next_event_number, truncate_before)
            VALUES (?, ?, 0)
            ON CONFLICT (stream) DO UPDATE SET next_event_number = excluded.next_event_number
            "#,
        )
        .bind(stream)
        .bind(next)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(WriteOutcome::Written {
            first,
            last: next - 1,
            position,
        })
    }

    async fn soft_delete(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
    ) -> std::result::Result<OperationResult, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let Some(row) = sqlx::query_as::<_, StreamRow>(
            "SELECT next_event_number, truncate_before FROM streams WHERE stream = ?",
        )
        .bind(stream)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(OperationResult::Success);
        };

        if row.truncate_before > 0 && !row.has_visible() {
            return Ok(OperationResult::StreamDeleted);
        }
        if !version_matches(expected_version, row.current_version()) {
            return Ok(OperationResult::WrongExpectedVersion);
        }

        sqlx::query("UPDATE streams SET truncate_before = next_event_number WHERE stream = ?")
            .bind(stream)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(OperationResult::Success)
    }

    async fn read(
        &self,
        stream: &str,
        from: i64,
        max_count: usize,
        forward: bool,
    ) -> std::result::Result<Result<ReadStreamSlice>, sqlx::Error> {
        let head = self.head_position().await?;
        let Some(row) = self.stream_row(stream).await?.filter(|r| r.has_visible()) else {
            let from = if forward { from } else { -1 };
            return Ok(Ok(ReadStreamSlice::empty(
                ReadStreamResult::NoStream,
                from,
                head,
            )));
        };
        let last_event_number = row.next_event_number - 1;

        if forward {
            let start = from.max(row.truncate_before);
            let rows = sqlx::query_as::<_, EventRow>(
                r#"
                SELECT position, stream, event_number, event_id, event_type, data, metadata, created_at
                FROM events
                WHERE stream = ? AND event_number >= ?
                ORDER BY event_number ASC
                LIMIT ?
                "#,
            )
            .bind(stream)
            .bind(start)
            .bind(max_count as i64)
            .fetch_all(&self.pool)
            .await?;

            let events = match rows
                .into_iter()
                .map(RecordedEvent::try_from)
                .collect::<Result<Vec<_>>>()
            {
                Ok(events) => events,
                Err(e) => return Ok(Err(e)),
            };
            let next_event_number = events.last().map_or(start, |e| e.event_number + 1);

            Ok(Ok(ReadStreamSlice {
                result: ReadStreamResult::Success,
                events,
                next_event_number,
                last_event_number,
                is_end_of_stream: next_event_number > last_event_number,
                last_commit_position: head,
            }))
        } else {
            let start = if from < 0 || from > last_event_number {
                last_event_number
            } else {
                from
            };
            let rows = sqlx::query_as::<_, EventRow>(
                r#"
                SELECT position, stream, event_number, event_id, event_type, data, metadata, created_at
                FROM events
                WHERE stream = ? AND event_number <= ? AND event_number >= ?
                ORDER BY event_number DESC
                LIMIT ?
                "#,
            )
            .bind(stream)
            .bind(start)
            .bind(row.truncate_before)
            .bind(max_count as i64)
            .fetch_all(&self.pool)
            .await?;

            let events = match rows
                .into_iter()
                .map(RecordedEvent::try_from)
                .collect::<Result<Vec<_>>>()
            {
                Ok(events) => events,
                Err(e) => return Ok(Err(e)),
            };
            let lowest = events.last().map_or(start + 1, |e| e.event_number);
            let is_end_of_stream = lowest - 1 < row.truncate_before;

            Ok(Ok(ReadStreamSlice {
                result: ReadStreamResult::Success,
                events,
                next_event_number: if is_end_of_stream { -1 } else { lowest - 1 },
                last_event_number,
                is_end_of_stream,
                last_commit_position: head,
            }))
        }
    }
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn append(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<WriteEventsCompleted> {
        match self.write(stream, expected_version, events).await {
            Ok(WriteOutcome::Written {
                first,
                last,
                position,
            }) => {
                if position > 0 {
                    self.position_tx.send_replace(position);
                }
                Ok(WriteEventsCompleted {
                    result: OperationResult::Success,
                    first_event_number: first,
                    last_event_number: last,
                })
            }
            Ok(WriteOutcome::Rejected(result)) => Ok(WriteEventsCompleted::failed(result)),
            Err(e) if is_busy(&e) => Ok(WriteEventsCompleted::failed(
                OperationResult::CommitTimeout,
            )),
            Err(e) => Err(storage_error("append", e)),
        }
    }

    async fn read_forward(
        &self,
        stream: &str,
        from: i64,
        max_count: usize,
    ) -> Result<ReadStreamSlice> {
        self.read(stream, from, max_count, true)
            .await
            .map_err(|e| storage_error("read_forward", e))?
    }

    async fn read_backward(
        &self,
        stream: &str,
        from: i64,
        max_count: usize,
    ) -> Result<ReadStreamSlice> {
        self.read(stream, from, max_count, false)
            .await
            .map_err(|e| storage_error("read_backward", e))?
    }

    async fn delete_stream(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
    ) -> Result<OperationResult> {
        match self.soft_delete(stream, expected_version).await {
            Ok(result) => Ok(result),
            Err(e) if is_busy(&e) => Ok(OperationResult::CommitTimeout),
            Err(e) => Err(storage_error("delete_stream", e)),
        }
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
