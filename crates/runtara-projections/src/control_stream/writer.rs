// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batched, fire-and-forget control-stream writer.
//!
//! Each destination stream has at most one append in flight. Events written
//! while a flush is running are queued and flushed as one batch when it
//! completes. Failed appends are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bus::Publisher;
use crate::error::Result;
use crate::event_log::{EventLog, ExpectedVersion, NewEvent, OperationResult, WriteEventsCompleted};
use crate::messages::worker::{CoreResponse, WorkerCommand};
use crate::names::{self, PROJECTIONS_MASTER_STREAM};

enum WriterMessage {
    Write { stream: String, event: NewEvent },
    Reset,
}

/// Handle to a control-stream writer task.
#[derive(Debug, Clone)]
pub struct ControlStreamWriter {
    inbox: mpsc::UnboundedSender<WriterMessage>,
}

impl std::fmt::Debug for WriterMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Write { stream, event } => f
                .debug_struct("Write")
                .field("stream", stream)
                .field("event_type", &event.event_type)
                .finish(),
            Self::Reset => f.write_str("Reset"),
        }
    }
}

impl ControlStreamWriter {
    /// Spawn a writer appending to `log` until `shutdown` is cancelled.
    pub fn spawn(log: Arc<dyn EventLog>, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = WriterTask {
            log,
            queues: HashMap::new(),
            scope: 0,
        };
        let handle = tokio::spawn(task.run(rx, shutdown));
        (Self { inbox: tx }, handle)
    }

    /// Queue a JSON event for `stream`.
    pub fn write(&self, stream: impl Into<String>, event_type: impl Into<String>, body: Vec<u8>) {
        self.inbox.publish(WriterMessage::Write {
            stream: stream.into(),
            event: NewEvent::json(event_type, body),
        });
    }

    /// Queue an already encoded message, logging encoding failures.
    pub fn write_encoded(&self, stream: impl Into<String>, encoded: Result<(String, Vec<u8>)>) {
        let stream = stream.into();
        match encoded {
            Ok((tag, body)) => self.write(stream, tag, body),
            Err(e) => error!(stream = %stream, error = %e, "Failed to encode control message"),
        }
    }

    /// Abandon queued events and ignore completions of in-flight flushes.
    pub fn reset(&self) {
        self.inbox.publish(WriterMessage::Reset);
    }
}

#[derive(Default)]
struct StreamQueue {
    pending: Vec<NewEvent>,
    flushing: bool,
}

struct Flushed {
    scope: u64,
    stream: String,
    count: usize,
    result: Result<WriteEventsCompleted>,
}

struct WriterTask {
    log: Arc<dyn EventLog>,
    queues: HashMap<String, StreamQueue>,
    scope: u64,
}

impl WriterTask {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<WriterMessage>, shutdown: CancellationToken) {
        let mut flushes: FuturesUnordered<BoxFuture<'static, Flushed>> = FuturesUnordered::new();
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(flushed) = flushes.next(), if !flushes.is_empty() => {
                    if let Some(flush) = self.flushed(flushed) {
                        flushes.push(flush);
                    }
                }

                message = inbox.recv() => match message {
                    Some(WriterMessage::Write { stream, event }) => {
                        let queue = self.queues.entry(stream.clone()).or_default();
                        queue.pending.push(event);
                        if !queue.flushing {
                            flushes.push(self.flush(stream));
                        }
                    }
                    Some(WriterMessage::Reset) => {
                        debug!(streams = self.queues.len(), "Resetting control stream writer");
                        self.scope += 1;
                        self.queues.clear();
                    }
                    None => break,
                },
            }
        }

        // Let appends that already started land before exiting.
        while flushes.next().await.is_some() {}
        info!("Control stream writer stopped");
    }

    fn flush(&mut self, stream: String) -> BoxFuture<'static, Flushed> {
        let queue = self.queues.entry(stream.clone()).or_default();
        let events = std::mem::take(&mut queue.pending);
        queue.flushing = true;
        let count = events.len();
        let log = self.log.clone();
        let scope = self.scope;
        async move {
            let result = log.append(&stream, ExpectedVersion::Any, events).await;
            Flushed {
                scope,
                stream,
                count,
                result,
            }
        }
        .boxed()
    }

    fn flushed(&mut self, flushed: Flushed) -> Option<BoxFuture<'static, Flushed>> {
        if flushed.scope != self.scope {
            debug!(stream = %flushed.stream, "Dropping flush completion of an abandoned scope");
            return None;
        }
        match flushed.result {
            Ok(completed) if completed.result == OperationResult::Success => {
                debug!(stream = %flushed.stream, count = flushed.count, "Control messages written");
            }
            Ok(completed) => {
                error!(stream = %flushed.stream, count = flushed.count, result = %completed.result, "Control messages dropped");
            }
            Err(e) => {
                error!(stream = %flushed.stream, count = flushed.count, error = %e, "Control messages dropped");
            }
        }
        let queue = self.queues.get_mut(&flushed.stream)?;
        queue.flushing = false;
        if queue.pending.is_empty() {
            return None;
        }
        Some(self.flush(flushed.stream))
    }
}

/// Publishes worker commands to their worker's stream.
#[derive(Debug, Clone)]
pub struct CoreCommandWriter {
    writer: ControlStreamWriter,
}

impl CoreCommandWriter {
    /// Write through `writer`.
    pub fn new(writer: ControlStreamWriter) -> Self {
        Self { writer }
    }
}

impl Publisher<WorkerCommand> for CoreCommandWriter {
    fn publish(&self, message: WorkerCommand) {
        self.writer.write_encoded(
            names::worker_stream(message.worker_id),
            message.command.encode(),
        );
    }
}

/// Publishes worker responses to the master stream.
#[derive(Debug, Clone)]
pub struct CoreResponseWriter {
    writer: ControlStreamWriter,
}

impl CoreResponseWriter {
    /// Write through `writer`.
    pub fn new(writer: ControlStreamWriter) -> Self {
        Self { writer }
    }
}

impl Publisher<CoreResponse> for CoreResponseWriter {
    fn publish(&self, message: CoreResponse) {
        self.writer
            .write_encoded(PROJECTIONS_MASTER_STREAM, message.encode());
    }
}
