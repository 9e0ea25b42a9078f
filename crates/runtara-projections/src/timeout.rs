// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-slot timeout scheduler driven by an owner's periodic tick.

use std::time::Duration;

use tokio::time::Instant;

type TimeoutAction = Box<dyn FnOnce() + Send>;

/// Holds at most one pending timeout.
///
/// Scheduling replaces any pending timeout without running it.
#[derive(Default)]
pub struct TimeoutScheduler {
    slot: Option<(Instant, TimeoutAction)>,
}

impl TimeoutScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` on the first tick at or after `now + after`.
    pub fn schedule<F>(&mut self, now: Instant, after: Duration, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.slot = Some((now + after, Box::new(action)));
    }

    /// Fire the pending timeout if it is due. Returns whether it fired.
    pub fn tick(&mut self, now: Instant) -> bool {
        match self.slot.take() {
            Some((due, action)) if due <= now => {
                action();
                true
            }
            other => {
                self.slot = other;
                false
            }
        }
    }

    /// Whether a timeout is pending.
    pub fn is_pending(&self) -> bool {
        self.slot.is_some()
    }
}

impl std::fmt::Debug for TimeoutScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutScheduler")
            .field("due", &self.slot.as_ref().map(|(due, _)| *due))
            .finish()
    }
}
