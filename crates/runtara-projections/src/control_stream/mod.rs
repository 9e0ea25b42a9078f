// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-stream protocol between the manager and its workers.
//!
//! Commands and responses travel as events on well-known streams of the
//! [`EventLog`](crate::event_log::EventLog): the event type is the message
//! tag and the data is its JSON body.
//!
//! | Stream | Written by | Read by |
//! |--------|------------|---------|
//! | `$projections-$<worker id>` | [`CoreCommandWriter`] | [`CoreCommandReader`] |
//! | `$projections-$master` | [`CoreResponseWriter`], response reader | [`ResponseReader`] |
//! | `$projections-$control` | [`ResponseReader`] | [`CoreCommandReader`] |

mod command_reader;
mod response_reader;
mod writer;

pub use command_reader::CoreCommandReader;
pub use response_reader::ResponseReader;
pub use writer::{ControlStreamWriter, CoreCommandWriter, CoreResponseWriter};

use crate::error::Result;
use crate::event_log::{EventLog, ReadStreamResult, ReadStreamSlice};

/// Read the next page of `stream`, waiting for new commits when the reader
/// has caught up.
pub(crate) async fn next_page(
    log: &dyn EventLog,
    stream: &str,
    from: i64,
    page_size: usize,
) -> Result<ReadStreamSlice> {
    loop {
        let slice = log.read_forward(stream, from, page_size).await?;
        let caught_up = slice.result == ReadStreamResult::NoStream
            || (slice.result == ReadStreamResult::Success && slice.events.is_empty());
        if !caught_up {
            return Ok(slice);
        }
        log.subscribe_awake(stream, slice.last_commit_position).await?;
    }
}
