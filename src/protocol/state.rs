use std::fmt;

use serde::{Serialize, Deserialize};

/// Lifecycle of a link session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    /// No transport open
    Disconnected,
    /// Transport open, waiting for the first heartbeat
    Connecting,
    /// Heartbeats arriving
    Connected,
    /// Heartbeat lost but transport still open
    Degraded,
    /// Session shut down by the caller; terminal
    Closed,
}

impl LinkState {
    /// Whether `self -> next` is a legal transition.
    ///
    /// Connecting must precede Connected, Degraded is only entered from
    /// Connected, and Closed is reachable from everywhere except itself.
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) | (Connecting, Disconnected) => true,
            (Connected, Degraded) | (Connected, Disconnected) => true,
            (Degraded, Connected) | (Degraded, Disconnected) => true,
            _ => false,
        }
    }

    /// Whether parameter traffic can flow
    pub fn is_connected(self) -> bool {
        matches!(self, LinkState::Connected)
    }

    /// Whether the session has ended and will not recover by itself
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Closed)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Degraded => "degraded",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Event delivered to connection observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// The link moved between two states
    StateChanged {
        from: LinkState,
        to: LinkState,
    },
    /// The reconnect supervisor is about to try again
    ReconnectAttempt {
        attempt: u32,
        max: u32,
    },
    /// The reconnect supervisor gave up; the link stays Disconnected
    ReconnectExhausted {
        attempts: u32,
    },
}

/// Guards LinkState transitions so each one is applied and reported once
#[derive(Debug)]
pub struct LinkStateMachine {
    state: LinkState,
}

impl LinkStateMachine {
    /// Creates a machine in Disconnected
    pub fn new() -> Self {
        LinkStateMachine { state: LinkState::Disconnected }
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Applies a transition and returns the event to report.
    ///
    /// Returns `None` for self-transitions and illegal transitions, which is
    /// what keeps a loss episode from being reported twice.
    pub fn transition(&mut self, next: LinkState) -> Option<ConnectionEvent> {
        if self.state == next || !self.state.can_transition_to(next) {
            return None;
        }
        let from = self.state;
        self.state = next;
        Some(ConnectionEvent::StateChanged { from, to: next })
    }
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
