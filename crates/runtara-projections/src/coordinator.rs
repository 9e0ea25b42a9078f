// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Core coordinator: starts and stops the worker-side components together.
//!
//! ```text
//!  Stopped ──start──► Starting ──all started──► Started
//!     ▲                                            │
//!     └──────── all stopped ◄── Stopping ◄──stop───┘
//! ```
//!
//! Every start or stop round carries a fresh instance id. Reports carrying
//! another id belong to an earlier round and are ignored.

use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::Publisher;
use crate::manager::ManagerHandle;
use crate::timeout::TimeoutScheduler;

/// Interval of the coordinator tick driving its timeouts.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Default time components get to report a start or stop.
pub const DEFAULT_COMPONENT_TIMEOUT: Duration = Duration::from_secs(5);

/// A worker-side component started and stopped by the coordinator.
///
/// Implementations report completion through
/// [`CoordinatorHandle::component_started`] and
/// [`CoordinatorHandle::component_stopped`] with the given instance id.
pub trait CoreComponent: Send {
    /// Begin starting.
    fn start(&mut self, instance_id: Uuid, coordinator: CoordinatorHandle);
    /// Begin stopping.
    fn stop(&mut self, instance_id: Uuid, coordinator: CoordinatorHandle);
}

/// Coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// No component runs.
    Stopped,
    /// Waiting for components to start.
    Starting,
    /// Every component runs.
    Started,
    /// Waiting for components to stop.
    Stopping,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
enum CoordinatorMessage {
    StartComponents,
    StopComponents,
    ComponentStarted { instance_id: Uuid },
    ComponentStopped { instance_id: Uuid },
    TimedOut { instance_id: Uuid },
    GetState { reply: oneshot::Sender<CoordinatorState> },
}

/// Handle to a running coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    inbox: mpsc::UnboundedSender<CoordinatorMessage>,
}

impl CoordinatorHandle {
    /// Start every component. Ignored unless stopped.
    pub fn start_components(&self) {
        self.inbox.publish(CoordinatorMessage::StartComponents);
    }

    /// Stop every component. Ignored while stopped or stopping.
    pub fn stop_components(&self) {
        self.inbox.publish(CoordinatorMessage::StopComponents);
    }

    /// A component finished starting.
    pub fn component_started(&self, instance_id: Uuid) {
        self.inbox
            .publish(CoordinatorMessage::ComponentStarted { instance_id });
    }

    /// A component finished stopping.
    pub fn component_stopped(&self, instance_id: Uuid) {
        self.inbox
            .publish(CoordinatorMessage::ComponentStopped { instance_id });
    }

    /// Current state, or `None` once the coordinator has exited.
    pub async fn state(&self) -> Option<CoordinatorState> {
        let (reply, rx) = oneshot::channel();
        self.inbox.publish(CoordinatorMessage::GetState { reply });
        rx.await.ok()
    }
}

/// Spawn a coordinator over `components`.
///
/// Once every component has started, `manager` is told the system core is
/// ready.
pub fn spawn(
    components: Vec<Box<dyn CoreComponent>>,
    manager: Option<ManagerHandle>,
    component_timeout: Duration,
    shutdown: CancellationToken,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = CoordinatorHandle { inbox: tx };
    let coordinator = CoreCoordinator {
        components,
        manager,
        component_timeout,
        handle: handle.clone(),
        state: CoordinatorState::Stopped,
        instance_id: Uuid::nil(),
        pending: 0,
        timeouts: TimeoutScheduler::new(),
    };
    let join = tokio::spawn(coordinator.run(rx, shutdown));
    (handle, join)
}

struct CoreCoordinator {
    components: Vec<Box<dyn CoreComponent>>,
    manager: Option<ManagerHandle>,
    component_timeout: Duration,
    handle: CoordinatorHandle,
    state: CoordinatorState,
    instance_id: Uuid,
    pending: usize,
    timeouts: TimeoutScheduler,
}

impl CoreCoordinator {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<CoordinatorMessage>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                message = inbox.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },

                _ = ticker.tick(), if self.state != CoordinatorState::Stopped => {
                    self.timeouts.tick(Instant::now());
                }
            }
        }
        info!(state = %self.state, "Core coordinator stopped");
    }

    fn handle(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::StartComponents => self.start(),
            CoordinatorMessage::StopComponents => self.stop(),
            CoordinatorMessage::ComponentStarted { instance_id } => {
                if self.state != CoordinatorState::Starting || instance_id != self.instance_id {
                    debug!(instance_id = %instance_id, state = %self.state, "Ignoring stray component start");
                    return;
                }
                self.pending = self.pending.saturating_sub(1);
                self.started_if_done();
            }
            CoordinatorMessage::ComponentStopped { instance_id } => {
                if self.state != CoordinatorState::Stopping || instance_id != self.instance_id {
                    debug!(instance_id = %instance_id, state = %self.state, "Ignoring stray component stop");
                    return;
                }
                self.pending = self.pending.saturating_sub(1);
                self.stopped_if_done();
            }
            CoordinatorMessage::TimedOut { instance_id } => {
                if instance_id == self.instance_id
                    && matches!(
                        self.state,
                        CoordinatorState::Starting | CoordinatorState::Stopping
                    )
                {
                    warn!(
                        state = %self.state,
                        pending = self.pending,
                        "Core components did not report in time"
                    );
                }
            }
            CoordinatorMessage::GetState { reply } => {
                let _ = reply.send(self.state);
            }
        }
    }

    fn begin_round(&mut self, state: CoordinatorState) -> Uuid {
        self.state = state;
        self.instance_id = Uuid::new_v4();
        self.pending = self.components.len();
        let instance_id = self.instance_id;
        let inbox = self.handle.inbox.clone();
        self.timeouts
            .schedule(Instant::now(), self.component_timeout, move || {
                inbox.publish(CoordinatorMessage::TimedOut { instance_id });
            });
        instance_id
    }

    fn start(&mut self) {
        if self.state != CoordinatorState::Stopped {
            debug!(state = %self.state, "Start ignored");
            return;
        }
        let instance_id = self.begin_round(CoordinatorState::Starting);
        info!(instance_id = %instance_id, components = self.pending, "Starting core components");
        for component in &mut self.components {
            component.start(instance_id, self.handle.clone());
        }
        self.started_if_done();
    }

    fn stop(&mut self) {
        if !matches!(
            self.state,
            CoordinatorState::Starting | CoordinatorState::Started
        ) {
            debug!(state = %self.state, "Stop ignored");
            return;
        }
        let instance_id = self.begin_round(CoordinatorState::Stopping);
        info!(instance_id = %instance_id, components = self.pending, "Stopping core components");
        for component in &mut self.components {
            component.stop(instance_id, self.handle.clone());
        }
        self.stopped_if_done();
    }

    fn started_if_done(&mut self) {
        if self.pending > 0 {
            return;
        }
        self.state = CoordinatorState::Started;
        info!("Core components started");
        if let Some(manager) = &self.manager {
            manager.system_core_ready();
        }
    }

    fn stopped_if_done(&mut self) {
        if self.pending > 0 {
            return;
        }
        self.state = CoordinatorState::Stopped;
        info!("Core components stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records calls and reports back only when told to.
    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<(&'static str, Uuid)>>>,
        auto_report: bool,
    }

    impl CoreComponent for Recorder {
        fn start(&mut self, instance_id: Uuid, coordinator: CoordinatorHandle) {
            self.calls.lock().unwrap().push(("start", instance_id));
            if self.auto_report {
                coordinator.component_started(instance_id);
            }
        }

        fn stop(&mut self, instance_id: Uuid, coordinator: CoordinatorHandle) {
            self.calls.lock().unwrap().push(("stop", instance_id));
            if self.auto_report {
                coordinator.component_stopped(instance_id);
            }
        }
    }

    /// Reports are queued behind the command that caused them, so poll.
    async fn wait_for(handle: &CoordinatorHandle, expected: CoordinatorState) {
        for _ in 0..100 {
            if handle.state().await == Some(expected) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("coordinator never reached {}", expected);
    }

    #[tokio::test]
    async fn test_start_and_stop_round() {
        let recorder = Recorder {
            auto_report: true,
            ..Default::default()
        };
        let components: Vec<Box<dyn CoreComponent>> =
            vec![Box::new(recorder.clone()), Box::new(recorder.clone())];
        let shutdown = CancellationToken::new();
        let (handle, join) = spawn(components, None, DEFAULT_COMPONENT_TIMEOUT, shutdown.clone());

        assert_eq!(handle.state().await, Some(CoordinatorState::Stopped));
        handle.start_components();
        wait_for(&handle, CoordinatorState::Started).await;

        handle.stop_components();
        wait_for(&handle, CoordinatorState::Stopped).await;

        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0].1, calls[1].1);
        assert_ne!(calls[0].1, calls[2].1);

        shutdown.cancel();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_stray_reports_ignored() {
        let recorder = Recorder::default();
        let shutdown = CancellationToken::new();
        let (handle, join) = spawn(
            vec![Box::new(recorder.clone())],
            None,
            DEFAULT_COMPONENT_TIMEOUT,
            shutdown.clone(),
        );

        handle.start_components();
        assert_eq!(handle.state().await, Some(CoordinatorState::Starting));

        handle.component_started(Uuid::new_v4());
        assert_eq!(handle.state().await, Some(CoordinatorState::Starting));

        // A second start while starting is ignored.
        handle.start_components();
        assert_eq!(handle.state().await, Some(CoordinatorState::Starting));
        let instance_id = recorder.calls.lock().unwrap()[0].1;
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);

        handle.component_started(instance_id);
        wait_for(&handle, CoordinatorState::Started).await;

        shutdown.cancel();
        join.await.unwrap();
    }
}
