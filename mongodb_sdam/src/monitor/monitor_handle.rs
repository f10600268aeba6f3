use std::sync::{Arc, Mutex};

use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
};

use crate::{
    events::EventBus,
    state_machine::{MonitorState, StateMachine},
    topology::TopologyContext,
    ConnectionPool, Connector, ServerAddress, ServerDescription,
};

use super::{run_monitor_actor, MonitorActor, MonitorOptions};

/// State shared between a [`Monitor`] handle and its task.
#[derive(Debug)]
pub(crate) struct MonitorShared {
    state: Mutex<StateMachine<MonitorState>>,
    pub(crate) check_requested: Notify,
    pub(crate) reset_requested: Notify,
    pub(crate) shutdown: Notify,
}

impl MonitorShared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(StateMachine::new(MonitorState::Closed)),
            check_requested: Notify::new(),
            reset_requested: Notify::new(),
            shutdown: Notify::new(),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut StateMachine<MonitorState>) -> T) -> T {
        match self.state.lock() {
            Ok(mut state) => f(&mut *state),
            Err(poisoned) => {
                let mut state = poisoned.into_inner();
                f(&mut *state)
            }
        }
    }

    pub(crate) fn state(&self) -> MonitorState {
        self.with_state(|s| s.state())
    }

    /// Leaves `Closed` for the first check. Returns false when the monitor is past that point.
    pub(crate) fn start(&self) -> bool {
        self.with_state(|s| {
            if !s.is(MonitorState::Closed) {
                return false;
            }
            s.transition(MonitorState::Monitoring);
            true
        })
    }

    /// Moves to `next` unless a close is already under way.
    pub(crate) fn enter(&self, next: MonitorState) {
        self.with_state(|s| {
            if !matches!(s.state(), MonitorState::Closing | MonitorState::Closed) {
                s.transition(next);
            }
        })
    }

    /// Closing then Idle, the two steps of a reset, skipped when a close got there first.
    pub(crate) fn cycle_for_reset(&self) {
        self.with_state(|s| {
            if !matches!(s.state(), MonitorState::Closing | MonitorState::Closed) {
                s.transition(MonitorState::Closing);
                s.transition(MonitorState::Idle);
            }
        })
    }

    pub(crate) fn finish(&self) {
        self.with_state(|s| match s.state() {
            MonitorState::Closed => {}
            MonitorState::Closing => s.transition(MonitorState::Closed),
            _ => {
                s.transition(MonitorState::Closing);
                s.transition(MonitorState::Closed);
            }
        })
    }
}

/// Handle to the heartbeat task of one server.
#[derive(Debug)]
pub(crate) struct Monitor {
    address: ServerAddress,
    shared: Arc<MonitorShared>,
    description: watch::Receiver<Arc<ServerDescription>>,
    actor: Mutex<Option<MonitorActor>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    pub(crate) fn new(
        address: ServerAddress,
        connector: Box<dyn Connector>,
        pool: ConnectionPool,
        context: TopologyContext,
        events: EventBus,
        description: watch::Receiver<Arc<ServerDescription>>,
        options: MonitorOptions,
    ) -> Self {
        let shared = Arc::new(MonitorShared::new());
        let actor = MonitorActor::new(
            address.clone(),
            shared.clone(),
            connector,
            pool,
            context,
            events,
            description.clone(),
            options,
        );
        Self {
            address,
            shared,
            description,
            actor: Mutex::new(Some(actor)),
            task: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> MonitorState {
        self.shared.state()
    }

    fn is_running(&self) -> bool {
        matches!(self.state(), MonitorState::Idle | MonitorState::Monitoring)
    }

    /// Starts the heartbeat loop. The first check runs right away.
    pub(crate) fn connect(&self) {
        let actor = match self.actor.lock() {
            Ok(mut actor) => actor.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(actor) = actor else {
            tracing::trace!("Monitor for `{}` is already running", self.address);
            return;
        };

        if !self.shared.start() {
            tracing::trace!("Monitor for `{}` was closed before it started", self.address);
            return;
        }
        let task = tokio::spawn(run_monitor_actor(actor));
        match self.task.lock() {
            Ok(mut slot) => *slot = Some(task),
            Err(poisoned) => *poisoned.into_inner() = Some(task),
        }
    }

    /// Asks for a check as soon as the minimum heartbeat interval allows.
    pub(crate) fn request_check(&self) {
        if self.is_running() {
            self.shared.check_requested.notify_one();
        }
    }

    /// Drops the monitoring connection and checks again immediately. Only meaningful once the
    /// server has reported a topology version; otherwise the regular schedule is kept.
    pub(crate) fn reset(&self) {
        if !self.is_running() {
            return;
        }
        if self.description.borrow().topology_version.is_none() {
            return;
        }
        tracing::debug!("Resetting monitor for `{}`", self.address);
        self.shared.reset_requested.notify_one();
    }

    pub(crate) fn close(&self) {
        let started = match self.task.lock() {
            Ok(task) => task.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        };
        if !started {
            // Never started: make a later `connect` a no-op.
            match self.actor.lock() {
                Ok(mut actor) => actor.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            self.shared.finish();
            return;
        }
        self.shared.with_state(|s| {
            if !matches!(s.state(), MonitorState::Closing | MonitorState::Closed) {
                s.transition(MonitorState::Closing);
            }
        });
        self.shared.shutdown.notify_one();
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shared.shutdown.notify_one();
    }
}
