// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fire-and-forget publishing seam between actors.

use tokio::sync::mpsc;
use tracing::debug;

/// Accepts messages without waiting for them to be processed.
pub trait Publisher<M>: Send + Sync {
    /// Publish a message. Delivery to a stopped receiver is silently dropped.
    fn publish(&self, message: M);
}

impl<M: Send> Publisher<M> for mpsc::UnboundedSender<M> {
    fn publish(&self, message: M) {
        if self.send(message).is_err() {
            debug!("Publisher receiver closed, message dropped");
        }
    }
}

/// Publisher that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

impl<M> Publisher<M> for NoopPublisher {
    fn publish(&self, _message: M) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_sender_publishes() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u32>();
        tx.publish(7);
        assert_eq!(rx.try_recv().unwrap(), 7);
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel::<u32>();
        drop(rx);
        tx.publish(1);
    }
}
