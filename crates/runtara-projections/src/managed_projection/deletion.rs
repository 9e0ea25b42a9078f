// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stream cleanups run while a projection is being deleted.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{ProjectionError, Result};
use crate::event_log::{EventLog, ExpectedVersion, OperationResult};
use crate::names::{self, event_types};

const TRACKED_STREAMS_PAGE_SIZE: usize = 100;

/// Delete one stream, retrying on commit and forward timeouts.
///
/// A stream that is already gone counts as deleted.
pub(crate) async fn delete_stream(log: &dyn EventLog, stream: &str) -> Result<()> {
    loop {
        match log.delete_stream(stream, ExpectedVersion::Any).await? {
            OperationResult::Success | OperationResult::StreamDeleted => {
                info!(stream = %stream, "Projection stream deleted");
                return Ok(());
            }
            result @ (OperationResult::CommitTimeout | OperationResult::ForwardTimeout) => {
                info!(stream = %stream, result = %result, "Projection stream could not be deleted, retrying");
            }
            result => {
                return Err(ProjectionError::fatal(format!(
                    "Unsupported error code received: {} while deleting {}",
                    result, stream
                )));
            }
        }
    }
}

/// Delete every stream listed in the projection's tracking stream, then the
/// tracking stream and its checkpoint.
pub(crate) async fn delete_emitted_streams(log: Arc<dyn EventLog>, name: String) -> Result<()> {
    let tracking = names::emitted_streams_stream(&name);
    let mut from = 0;
    loop {
        let slice = log
            .read_forward(&tracking, from, TRACKED_STREAMS_PAGE_SIZE)
            .await?;
        for event in &slice.events {
            if event.event_type != event_types::STREAM_TRACKED {
                continue;
            }
            match std::str::from_utf8(&event.data) {
                Ok(stream) => delete_stream(log.as_ref(), stream).await?,
                Err(e) => {
                    warn!(projection = %name, event_number = event.event_number, error = %e, "Skipping tracked stream with invalid name");
                }
            }
        }
        if slice.is_end_of_stream {
            break;
        }
        from = slice.next_event_number;
    }
    debug!(projection = %name, "Tracked emitted streams deleted");

    delete_stream(log.as_ref(), &tracking).await?;
    delete_stream(log.as_ref(), &names::emitted_streams_checkpoint_stream(&name)).await
}
