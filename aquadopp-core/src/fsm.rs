//! Protocol state machine table.
//!
//! Every public driver operation is an event. The table maps
//! `(state, event)` to the state entered on success and the action the
//! engine runs to get there. Pairs missing from the table are rejected with
//! [`DriverError::InvalidCommand`].
//!
//! ```text
//! UNCONFIGURED --connect--> COMMAND <--start/stop sampling--> AUTOSAMPLE
//!                           COMMAND <--enter/exit direct----> DIRECT_ACCESS
//! any connected state --failures/timeout--> LOST_CONNECTION --connect--> COMMAND
//! ```

use crate::error::DriverError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Connection state of one driver session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Unconfigured,
    Command,
    Autosample,
    DirectAccess,
    LostConnection,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 5] = [
        ConnectionState::Unconfigured,
        ConnectionState::Command,
        ConnectionState::Autosample,
        ConnectionState::DirectAccess,
        ConnectionState::LostConnection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Unconfigured => "UNCONFIGURED",
            ConnectionState::Command => "COMMAND",
            ConnectionState::Autosample => "AUTOSAMPLE",
            ConnectionState::DirectAccess => "DIRECT_ACCESS",
            ConnectionState::LostConnection => "LOST_CONNECTION",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations and link conditions that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolEvent {
    Connect,
    Disconnect,
    Get,
    Set,
    StartSampling,
    StopSampling,
    EnterDirectAccess,
    ExecuteDirect,
    ExitDirectAccess,
    AcquireSample,
    AcquireStatus,
    ClockSync,
    /// No complete frame arrived within the autosample timeout.
    SampleTimeout,
    /// Too many consecutive command failures, or the link closed.
    LinkFailed,
}

impl ProtocolEvent {
    pub const ALL: [ProtocolEvent; 14] = [
        ProtocolEvent::Connect,
        ProtocolEvent::Disconnect,
        ProtocolEvent::Get,
        ProtocolEvent::Set,
        ProtocolEvent::StartSampling,
        ProtocolEvent::StopSampling,
        ProtocolEvent::EnterDirectAccess,
        ProtocolEvent::ExecuteDirect,
        ProtocolEvent::ExitDirectAccess,
        ProtocolEvent::AcquireSample,
        ProtocolEvent::AcquireStatus,
        ProtocolEvent::ClockSync,
        ProtocolEvent::SampleTimeout,
        ProtocolEvent::LinkFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolEvent::Connect => "connect",
            ProtocolEvent::Disconnect => "disconnect",
            ProtocolEvent::Get => "get",
            ProtocolEvent::Set => "set",
            ProtocolEvent::StartSampling => "start_sampling",
            ProtocolEvent::StopSampling => "stop_sampling",
            ProtocolEvent::EnterDirectAccess => "enter_direct_access",
            ProtocolEvent::ExecuteDirect => "execute_direct",
            ProtocolEvent::ExitDirectAccess => "exit_direct_access",
            ProtocolEvent::AcquireSample => "acquire_sample",
            ProtocolEvent::AcquireStatus => "acquire_status",
            ProtocolEvent::ClockSync => "clock_sync",
            ProtocolEvent::SampleTimeout => "sample_timeout",
            ProtocolEvent::LinkFailed => "link_failed",
        }
    }
}

impl fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work the engine performs for an accepted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Handshake,
    Close,
    ReadShadow,
    WriteParameters,
    StartAutosample,
    StopAutosample,
    OpenPassthrough,
    Passthrough,
    ClosePassthrough,
    AcquireSample,
    AcquireStatus,
    SyncClock,
    ReportLost,
}

/// `(state, event) -> (next state, action)` table.
#[derive(Debug, Clone, Default)]
pub struct TransitionTable {
    transitions: HashMap<(ConnectionState, ProtocolEvent), (ConnectionState, Action)>,
}

impl TransitionTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The Aquadopp protocol table.
    pub fn standard() -> Self {
        use Action as A;
        use ConnectionState::*;
        use ProtocolEvent as E;

        let mut table = Self::new();
        let mut put = |from, event, to, action| {
            table.transitions.insert((from, event), (to, action));
        };

        put(Unconfigured, E::Connect, Command, A::Handshake);
        put(LostConnection, E::Connect, Command, A::Handshake);

        for state in ConnectionState::ALL {
            put(state, E::Disconnect, Unconfigured, A::Close);
            put(state, E::Get, state, A::ReadShadow);
        }

        put(Command, E::Set, Command, A::WriteParameters);
        put(Command, E::AcquireSample, Command, A::AcquireSample);
        put(Command, E::AcquireStatus, Command, A::AcquireStatus);
        put(Command, E::ClockSync, Command, A::SyncClock);

        put(Command, E::StartSampling, Autosample, A::StartAutosample);
        put(Autosample, E::StopSampling, Command, A::StopAutosample);
        put(Autosample, E::SampleTimeout, LostConnection, A::ReportLost);

        put(Command, E::EnterDirectAccess, DirectAccess, A::OpenPassthrough);
        put(DirectAccess, E::ExecuteDirect, DirectAccess, A::Passthrough);
        put(DirectAccess, E::ExitDirectAccess, Command, A::ClosePassthrough);

        for state in [Command, Autosample, DirectAccess] {
            put(state, E::LinkFailed, LostConnection, A::ReportLost);
        }

        table
    }

    /// Adds a transition. Fails if `(from, event)` is already mapped.
    pub fn add(
        &mut self,
        from: ConnectionState,
        event: ProtocolEvent,
        to: ConnectionState,
        action: Action,
    ) -> Result<(), DriverError> {
        if self.transitions.contains_key(&(from, event)) {
            return Err(DriverError::configuration(format!(
                "duplicate transition for '{}' in state {}",
                event, from
            )));
        }
        self.transitions.insert((from, event), (to, action));
        Ok(())
    }

    /// Looks up the transition for `event` in `state`.
    pub fn dispatch(
        &self,
        state: ConnectionState,
        event: ProtocolEvent,
    ) -> Result<(ConnectionState, Action), DriverError> {
        self.transitions
            .get(&(state, event))
            .copied()
            .ok_or(DriverError::InvalidCommand { state, event })
    }

    pub fn permits(&self, state: ConnectionState, event: ProtocolEvent) -> bool {
        self.transitions.contains_key(&(state, event))
    }

    /// Events accepted in `state`, in declaration order.
    pub fn events_from(&self, state: ConnectionState) -> Vec<ProtocolEvent> {
        ProtocolEvent::ALL
            .into_iter()
            .filter(|e| self.permits(state, *e))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_connect_paths() {
        let table = TransitionTable::standard();
        assert_eq!(
            table.dispatch(Unconfigured, ProtocolEvent::Connect).unwrap(),
            (Command, Action::Handshake)
        );
        assert_eq!(
            table
                .dispatch(LostConnection, ProtocolEvent::Connect)
                .unwrap(),
            (Command, Action::Handshake)
        );
        assert!(table.dispatch(Command, ProtocolEvent::Connect).is_err());
    }

    #[test]
    fn test_sampling_cycle() {
        let table = TransitionTable::standard();
        let (next, _) = table.dispatch(Command, ProtocolEvent::StartSampling).unwrap();
        assert_eq!(next, Autosample);
        let (next, _) = table.dispatch(next, ProtocolEvent::StopSampling).unwrap();
        assert_eq!(next, Command);
        assert_eq!(
            table.dispatch(Autosample, ProtocolEvent::SampleTimeout).unwrap(),
            (LostConnection, Action::ReportLost)
        );
    }

    #[test]
    fn test_set_only_in_command() {
        let table = TransitionTable::standard();
        for state in ConnectionState::ALL {
            assert_eq!(
                table.permits(state, ProtocolEvent::Set),
                state == Command,
                "{state}"
            );
        }
    }

    #[test]
    fn test_get_and_disconnect_everywhere() {
        let table = TransitionTable::standard();
        for state in ConnectionState::ALL {
            assert_eq!(
                table.dispatch(state, ProtocolEvent::Get).unwrap(),
                (state, Action::ReadShadow)
            );
            assert_eq!(
                table.dispatch(state, ProtocolEvent::Disconnect).unwrap().0,
                Unconfigured
            );
        }
    }

    #[test]
    fn test_lost_connection_is_terminal_until_connect() {
        let table = TransitionTable::standard();
        assert_eq!(
            table.events_from(LostConnection),
            vec![
                ProtocolEvent::Connect,
                ProtocolEvent::Disconnect,
                ProtocolEvent::Get
            ]
        );
    }

    #[test]
    fn test_direct_access_cycle() {
        let table = TransitionTable::standard();
        assert_eq!(
            table.dispatch(Command, ProtocolEvent::EnterDirectAccess).unwrap(),
            (DirectAccess, Action::OpenPassthrough)
        );
        assert!(table.permits(DirectAccess, ProtocolEvent::ExecuteDirect));
        assert!(!table.permits(DirectAccess, ProtocolEvent::Set));
        assert_eq!(
            table.dispatch(DirectAccess, ProtocolEvent::ExitDirectAccess).unwrap(),
            (Command, Action::ClosePassthrough)
        );
    }

    #[test]
    fn test_invalid_command_error() {
        let table = TransitionTable::standard();
        let err = table
            .dispatch(Unconfigured, ProtocolEvent::StartSampling)
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::InvalidCommand {
                state: Unconfigured,
                event: ProtocolEvent::StartSampling
            }
        ));
        assert_eq!(
            err.to_string(),
            "invalid command: cannot start_sampling in state UNCONFIGURED"
        );
    }

    #[test]
    fn test_duplicate_transition_rejected() {
        let mut table = TransitionTable::new();
        table
            .add(Command, ProtocolEvent::Set, Command, Action::WriteParameters)
            .unwrap();
        assert!(table
            .add(Command, ProtocolEvent::Set, Command, Action::WriteParameters)
            .is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_every_state_reachable() {
        let table = TransitionTable::standard();
        let mut seen = std::collections::HashSet::from([Unconfigured]);
        let mut frontier = vec![Unconfigured];
        while let Some(state) = frontier.pop() {
            for event in table.events_from(state) {
                let (next, _) = table.dispatch(state, event).unwrap();
                if seen.insert(next) {
                    frontier.push(next);
                }
            }
        }
        assert_eq!(seen.len(), ConnectionState::ALL.len());
    }
}
