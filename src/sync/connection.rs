// 12.1: connection state machine. pure, no timers. there is no terminal state:
// every failure path leads back toward Reconnecting.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Internal inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// subscription established and the authoritative snapshot applied
    Subscribed,
    Timeout,
    Failed,
    Offline,
    /// start another attempt
    Retry,
}

/// Signals from the environment (socket errors, network and visibility changes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSignal {
    Error,
    Timeout,
    Offline,
    Online,
    VisibilityRestored,
}

impl ConnectionState {
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn needs_reconnect(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }
}

pub fn transition(state: ConnectionState, event: ConnectionEvent) -> ConnectionState {
    use ConnectionEvent as E;
    use ConnectionState as S;

    match (state, event) {
        (S::Connecting | S::Reconnecting, E::Subscribed) => S::Connected,
        (S::Connecting | S::Reconnecting, E::Failed | E::Timeout) => S::Error,
        (S::Connecting | S::Reconnecting, E::Offline) => S::Disconnected,

        (S::Connected, E::Timeout | E::Failed | E::Offline) => S::Disconnected,

        (S::Disconnected | S::Error, E::Retry) => S::Reconnecting,
        // an error while already down keeps us in Error until the next retry
        (S::Disconnected, E::Failed) => S::Error,

        (state, _) => state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent as E;
    use ConnectionState as S;

    #[test]
    fn happy_path() {
        assert_eq!(transition(S::Connecting, E::Subscribed), S::Connected);
    }

    #[test]
    fn drop_and_recover() {
        let mut state = S::Connected;
        state = transition(state, E::Timeout);
        assert_eq!(state, S::Disconnected);
        state = transition(state, E::Retry);
        assert_eq!(state, S::Reconnecting);
        state = transition(state, E::Subscribed);
        assert_eq!(state, S::Connected);
    }

    #[test]
    fn failed_reconnect_lands_in_error_then_retries() {
        let state = transition(S::Reconnecting, E::Failed);
        assert_eq!(state, S::Error);
        assert!(state.needs_reconnect());
        assert_eq!(transition(state, E::Retry), S::Reconnecting);
    }

    #[test]
    fn no_terminal_state() {
        let all = [S::Connecting, S::Connected, S::Disconnected, S::Reconnecting, S::Error];
        for start in all {
            // Retry then Subscribed reaches Connected from anywhere
            let next = transition(transition(start, E::Retry), E::Subscribed);
            assert_eq!(next, S::Connected, "stuck from {start}");
        }
    }

    #[test]
    fn irrelevant_events_are_ignored() {
        assert_eq!(transition(S::Connected, E::Retry), S::Connected);
        assert_eq!(transition(S::Connected, E::Subscribed), S::Connected);
    }
}
