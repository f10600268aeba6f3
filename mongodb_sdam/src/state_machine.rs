use std::fmt::Debug;

/// A state enum that knows which moves out of itself are legal.
pub trait StateTransitions: Copy + Debug + PartialEq {
    fn can_transition_to(self, next: Self) -> bool;
}

/// The lifecycle shared by [`Topology`](crate::Topology) and [`Server`](crate::Server).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Connected,
    Closing,
}

impl StateTransitions for ConnectionState {
    fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;
        match self {
            Closed => matches!(next, Closed | Connecting),
            Connecting => matches!(next, Connecting | Closing | Connected | Closed),
            Connected => matches!(next, Connected | Closing | Closed),
            Closing => matches!(next, Closing | Closed),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorState {
    Closed,
    Idle,
    Monitoring,
    Closing,
}

impl StateTransitions for MonitorState {
    fn can_transition_to(self, next: Self) -> bool {
        use MonitorState::*;
        match self {
            Closing => matches!(next, Closing | Idle | Closed),
            Closed => matches!(next, Closed | Monitoring),
            Idle => matches!(next, Idle | Monitoring | Closing),
            Monitoring => matches!(next, Monitoring | Idle | Closing),
        }
    }
}

#[derive(Debug)]
pub(crate) struct StateMachine<S: StateTransitions> {
    state: S,
}

impl<S: StateTransitions> StateMachine<S> {
    pub(crate) fn new(initial: S) -> Self {
        Self { state: initial }
    }

    pub(crate) fn state(&self) -> S {
        self.state
    }

    /// Moves to `next`.
    ///
    /// # Panics
    /// An illegal move is a bug in the caller, not a runtime condition, so it panics.
    pub(crate) fn transition(&mut self, next: S) {
        if !self.state.can_transition_to(next) {
            panic!(
                "illegal state transition from {:?} to {:?}",
                self.state, next
            );
        }
        tracing::trace!("State transition {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub(crate) fn is(&self, state: S) -> bool {
        self.state == state
    }
}
