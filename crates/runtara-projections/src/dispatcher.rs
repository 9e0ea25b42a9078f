// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Correlation dispatcher.
//!
//! Matches an outgoing request to exactly one completion callback by a
//! caller-supplied correlation id. Responses for unknown or already
//! completed ids are dropped.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::bus::Publisher;

/// A response that carries the id of the request it answers.
pub trait Correlated {
    /// Correlation id of the originating request.
    fn correlation_id(&self) -> Uuid;
}

type Completion<Resp> = Box<dyn FnOnce(Resp) + Send>;

/// Routes correlated responses to the callbacks registered with their requests.
pub struct CorrelationDispatcher<Req, Resp> {
    publisher: Arc<dyn Publisher<Req>>,
    pending: HashMap<Uuid, Completion<Resp>>,
}

impl<Req, Resp: Correlated> CorrelationDispatcher<Req, Resp> {
    /// Create a dispatcher that emits requests on `publisher`.
    pub fn new(publisher: Arc<dyn Publisher<Req>>) -> Self {
        Self {
            publisher,
            pending: HashMap::new(),
        }
    }

    /// Record `on_complete` under `correlation_id` and emit `request`.
    pub fn publish<F>(&mut self, correlation_id: Uuid, request: Req, on_complete: F)
    where
        F: FnOnce(Resp) + Send + 'static,
    {
        self.pending.insert(correlation_id, Box::new(on_complete));
        self.publisher.publish(request);
    }

    /// Complete the matching request. Returns whether a callback ran.
    pub fn handle(&mut self, response: Resp) -> bool {
        let correlation_id = response.correlation_id();
        match self.pending.remove(&correlation_id) {
            Some(on_complete) => {
                on_complete(response);
                true
            }
            None => {
                debug!(correlation_id = %correlation_id, "Dropping uncorrelated response");
                false
            }
        }
    }

    /// Forget every pending request without invoking its callback.
    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Debug)]
    struct Reply(Uuid);

    impl Correlated for Reply {
        fn correlation_id(&self) -> Uuid {
            self.0
        }
    }

    fn dispatcher() -> (
        CorrelationDispatcher<&'static str, Reply>,
        mpsc::UnboundedReceiver<&'static str>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CorrelationDispatcher::new(Arc::new(tx)), rx)
    }

    #[test]
    fn test_callback_invoked_once() {
        let (mut dispatcher, mut rx) = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let id = Uuid::new_v4();

        let c = calls.clone();
        dispatcher.publish(id, "get-state", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(rx.try_recv().unwrap(), "get-state");

        assert!(dispatcher.handle(Reply(id)));
        assert!(!dispatcher.handle(Reply(id)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn test_unknown_response_dropped() {
        let (mut dispatcher, _rx) = dispatcher();
        assert!(!dispatcher.handle(Reply(Uuid::new_v4())));
    }

    #[test]
    fn test_cancel_all_prevents_callbacks() {
        let (mut dispatcher, _rx) = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

        for id in &ids {
            let c = calls.clone();
            dispatcher.publish(*id, "get-result", move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        dispatcher.cancel_all();

        for id in ids {
            assert!(!dispatcher.handle(Reply(id)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
