// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle states of a managed projection.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a managed projection.
///
/// Variants are ordered; `state >= Running` means the worker instance can
/// answer live state and result queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ManagedProjectionState {
    /// Waiting for a new definition.
    Creating,
    /// Reading the definition stream.
    Loading,
    /// Definition read, no worker instance yet.
    Loaded,
    /// Worker is parsing the query.
    Preparing,
    /// Worker parsed the query.
    Prepared,
    /// Worker was asked to start.
    Starting,
    /// Worker was asked to load the instance without starting it.
    LoadingStopped,
    /// Worker is processing events.
    Running,
    /// Worker was asked to stop.
    Stopping,
    /// Worker was asked to stop immediately.
    Aborting,
    /// Stopped by request.
    Stopped,
    /// Reached the end of its sources.
    Completed,
    /// Stopped forcefully.
    Aborted,
    /// Failed; see the fault reason.
    Faulted,
    /// Streams are being removed.
    Deleting,
}

impl ManagedProjectionState {
    /// Whether the projection is at rest and can be restarted.
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Completed | Self::Aborted | Self::Faulted
        )
    }
}

impl fmt::Display for ManagedProjectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "Creating",
            Self::Loading => "Loading",
            Self::Loaded => "Loaded",
            Self::Preparing => "Preparing",
            Self::Prepared => "Prepared",
            Self::Starting => "Starting",
            Self::LoadingStopped => "LoadingStopped",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Aborting => "Aborting",
            Self::Stopped => "Stopped",
            Self::Completed => "Completed",
            Self::Aborted => "Aborted",
            Self::Faulted => "Faulted",
            Self::Deleting => "Deleting",
        };
        f.write_str(s)
    }
}
