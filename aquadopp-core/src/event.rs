//! Event broadcasting to the host.
//!
//! Decoded samples, parameter changes, state changes and errors leave the
//! driver only through these events.

use crate::error::{DriverError, ErrorKind};
use crate::fsm::ConnectionState;
use aquadopp_protocol::{DecodedSample, ParameterValue};
use serde::Serialize;
use tokio::sync::broadcast;

/// Event emitted by the driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DriverEvent {
    SampleAvailable(DecodedSample),
    ParameterUpdated {
        name: String,
        value: ParameterValue,
    },
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Error {
        kind: ErrorKind,
        detail: String,
    },
}

impl DriverEvent {
    pub fn error(err: &DriverError) -> Self {
        DriverEvent::Error {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DriverEvent::SampleAvailable(_) => "sample_available",
            DriverEvent::ParameterUpdated { .. } => "parameter_updated",
            DriverEvent::StateChanged { .. } => "state_changed",
            DriverEvent::Error { .. } => "error",
        }
    }
}

/// Fans driver events out to any number of host subscribers.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<DriverEvent>,
}

impl EventBroadcaster {
    /// Creates a broadcaster whose subscribers lag after `capacity`
    /// unread events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.sender.subscribe()
    }

    pub fn notify(&self, event: DriverEvent) {
        // Ignore send errors (no receivers)
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}
