//! Driver error types.

use crate::config::ConfigError;
use crate::fsm::{ConnectionState, ProtocolEvent};
use aquadopp_protocol::{ProtocolError, SampleError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from the protocol engine and the driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("cannot decode '{parameter}': {reason}")]
    Decode { parameter: String, reason: String },

    #[error("sample error: {0}")]
    Sample(#[from] SampleError),

    #[error("parameter '{name}': {reason}")]
    Parameter { name: String, reason: String },

    #[error("'{command}' timed out after {timeout_ms} ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("set aborted at '{parameter}' after committing {committed:?}: {source}")]
    SetAborted {
        parameter: String,
        committed: Vec<String>,
        source: Box<DriverError>,
    },

    #[error("invalid command: cannot {event} in state {state}")]
    InvalidCommand {
        state: ConnectionState,
        event: ProtocolEvent,
    },

    #[error("not connected")]
    NotConnected,

    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("driver stopped")]
    Stopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Error category reported in error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ConfigurationError,
    DecodeError,
    SampleError,
    ParameterError,
    TimeoutError,
    ProtocolException,
    InvalidCommand,
    ConnectionLost,
    IoError,
}

impl DriverError {
    pub(crate) fn parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        DriverError::Parameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        DriverError::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn unexpected(command: &str, detail: impl Into<String>) -> Self {
        DriverError::Protocol(ProtocolError::UnexpectedResponse {
            command: command.to_string(),
            detail: detail.into(),
        })
    }

    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::Configuration { .. } | DriverError::Config(_) => {
                ErrorKind::ConfigurationError
            }
            DriverError::Decode { .. } => ErrorKind::DecodeError,
            DriverError::Sample(_) => ErrorKind::SampleError,
            DriverError::Parameter { .. } => ErrorKind::ParameterError,
            DriverError::Timeout { .. } => ErrorKind::TimeoutError,
            DriverError::Protocol(_) => ErrorKind::ProtocolException,
            DriverError::SetAborted { source, .. } => source.kind(),
            DriverError::InvalidCommand { .. } => ErrorKind::InvalidCommand,
            DriverError::NotConnected
            | DriverError::ConnectionLost { .. }
            | DriverError::Stopped => ErrorKind::ConnectionLost,
            DriverError::Io(_) => ErrorKind::IoError,
        }
    }

    /// Returns whether the failed command may be retried on the same
    /// connection.
    pub fn is_retryable(&self) -> bool {
        match self {
            DriverError::Timeout { .. } => true,
            DriverError::Protocol(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Returns whether this error counts towards losing the connection.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            DriverError::Timeout { .. } | DriverError::Protocol(_) | DriverError::Io(_)
        )
    }

    /// Returns a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorKind::DecodeError => "DECODE_ERROR",
            ErrorKind::SampleError => "SAMPLE_ERROR",
            ErrorKind::ParameterError => "PARAMETER_ERROR",
            ErrorKind::TimeoutError => "TIMEOUT_ERROR",
            ErrorKind::ProtocolException => "PROTOCOL_EXCEPTION",
            ErrorKind::InvalidCommand => "INVALID_COMMAND",
            ErrorKind::ConnectionLost => "CONNECTION_LOST",
            ErrorKind::IoError => "IO_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ConfigurationError => "configuration error",
            ErrorKind::DecodeError => "decode error",
            ErrorKind::SampleError => "sample error",
            ErrorKind::ParameterError => "parameter error",
            ErrorKind::TimeoutError => "timeout",
            ErrorKind::ProtocolException => "protocol exception",
            ErrorKind::InvalidCommand => "invalid command",
            ErrorKind::ConnectionLost => "connection lost",
            ErrorKind::IoError => "I/O error",
        };
        f.write_str(s)
    }
}
