//! Connection state machine for PLC link lifecycle management.
//!
//! State transitions:
//! DISCONNECTED → CONNECTING → CONNECTED → DISCONNECTED → ...
//!
//! Exhausting the reconnect budget opens the circuit (FAILED), whether the
//! last failure was a connect attempt or an unstable connection. Only an
//! explicit reconnect request leaves that state.

use crate::error::{LinkError, LinkResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Connection states of a PLC link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No transport; requests are queued.
    #[default]
    Disconnected,
    /// A connect (or accept) attempt is in progress.
    Connecting,
    /// Transport is up; requests are sent immediately.
    Connected,
    /// Reconnect budget exhausted; requests fail immediately.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl ConnectionState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: ConnectionState) -> bool {
        use ConnectionState::{Connected, Connecting, Disconnected, Failed};

        matches!(
            (self, target),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                // Connect attempt failed, retry after backoff
                | (Connecting, Disconnected)
                // Transport fault
                | (Connected, Disconnected)
                | (Connecting, Failed)
                // Connection dropped again before it became stable
                | (Disconnected, Failed)
                // Circuit closed by an explicit reconnect
                | (Failed, Connecting)
        )
    }

    /// Returns true if requests can be written to the transport.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// State machine wrapper with transition history tracking.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: ConnectionState,
    previous: Option<ConnectionState>,
    transition_count: u64,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a new state machine starting in DISCONNECTED.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ConnectionState::Disconnected,
            previous: None,
            transition_count: 0,
        }
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.current
    }

    /// Get the previous state (if any transition occurred).
    #[must_use]
    pub fn previous_state(&self) -> Option<ConnectionState> {
        self.previous
    }

    /// Get total number of transitions.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt a state transition.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidStateTransition`] if the transition is not allowed.
    pub fn transition(&mut self, target: ConnectionState) -> LinkResult<()> {
        if self.current.can_transition_to(target) {
            debug!(from = %self.current, to = %target, "link state transition");
            self.previous = Some(self.current);
            self.current = target;
            self.transition_count += 1;
            Ok(())
        } else {
            Err(LinkError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            })
        }
    }
}
