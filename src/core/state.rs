//! Purpose: Map raw transport connectivity to the client-facing connection state.
//! Exports: `Connectivity`, `ConnectionState`, `CallImmediately`, `StateCallback`,
//! `StateNotification`, `StateTracker`, `to_connection_state`.
//! Role: Client-only state machine; driven exclusively by the pump's null-tag path.
//! Invariants: The subscriber sees at most one notification per distinct consecutive state.
//! Invariants: `NoHostSpecified`/`AlwaysConnected` are fixed at construction; only
//! `close()` leaves them, when the pump observes queue closure.
use std::fmt;
use std::sync::Arc;

/// Raw link health as reported by a transport channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Connectivity {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    NoHostSpecified,
    AlwaysConnected,
    NotConnected,
    AttemptingToConnect,
    Connected,
    RecoveringFromFailure,
    Shutdown,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::NoHostSpecified => "NoHostSpecified",
            ConnectionState::AlwaysConnected => "AlwaysConnected",
            ConnectionState::NotConnected => "NotConnected",
            ConnectionState::AttemptingToConnect => "AttemptingToConnect",
            ConnectionState::Connected => "Connected",
            ConnectionState::RecoveringFromFailure => "RecoveringFromFailure",
            ConnectionState::Shutdown => "Shutdown",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallImmediately {
    Yes,
    No,
}

pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

pub fn to_connection_state(connectivity: Connectivity) -> ConnectionState {
    match connectivity {
        Connectivity::Idle => ConnectionState::NotConnected,
        Connectivity::Connecting => ConnectionState::AttemptingToConnect,
        Connectivity::Ready => ConnectionState::Connected,
        Connectivity::TransientFailure => ConnectionState::RecoveringFromFailure,
        Connectivity::Shutdown => ConnectionState::Shutdown,
    }
}

/// A subscriber invocation captured under the engine lock, delivered after release.
pub struct StateNotification {
    callback: StateCallback,
    state: ConnectionState,
}

impl StateNotification {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn deliver(self) {
        (self.callback)(self.state);
    }
}

pub struct StateTracker {
    state: ConnectionState,
    subscriber: Option<StateCallback>,
}

impl StateTracker {
    pub fn new(initial: ConnectionState) -> Self {
        Self {
            state: initial,
            subscriber: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Replaces the subscriber. With `CallImmediately::Yes` the new subscriber is
    /// invoked synchronously, by the caller's thread, with the current state.
    pub fn subscribe(&mut self, callback: StateCallback, call_immediately: CallImmediately) {
        if call_immediately == CallImmediately::Yes {
            callback(self.state);
        }
        self.subscriber = Some(callback);
    }

    /// Records a polled state; returns a notification only when it changed.
    pub fn observe(&mut self, state: ConnectionState) -> Option<StateNotification> {
        if state == self.state {
            return None;
        }
        self.state = state;
        self.subscriber.as_ref().map(|callback| StateNotification {
            callback: Arc::clone(callback),
            state,
        })
    }

    /// Forces the terminal state once the queue is closed; always notifies.
    pub fn close(&mut self) -> Option<StateNotification> {
        self.state = ConnectionState::NoHostSpecified;
        self.subscriber.take().map(|callback| StateNotification {
            callback,
            state: ConnectionState::NoHostSpecified,
        })
    }
}
