// Bridge error types
use crewdesk_types::{CommandError, CommandType, Mode, ModeSet};
use serde::ser::SerializeStruct;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Validation error: {0}")]
    Validation(#[from] CommandError),

    #[error("{command_type} is not allowed in {mode} mode (allowed in {allowed})")]
    ModeForbidden {
        command_type: CommandType,
        mode: Mode,
        allowed: ModeSet,
    },

    #[error("Invalid mode transition: {from} -> {to}")]
    InvalidTransition { from: Mode, to: Mode },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Reconnect gave up after {attempts} attempts: {last_error}")]
    ConnectionExhausted { attempts: u32, last_error: String },

    #[error("{command_type} timed out after {timeout_ms}ms")]
    Timeout {
        command_type: CommandType,
        timeout_ms: u64,
    },

    #[error("Backend rejected {command_type}: {message}")]
    Backend {
        command_type: CommandType,
        message: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Secret store error: {0}")]
    Secret(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Validation(_) => "validation",
            BridgeError::ModeForbidden { .. } => "mode_forbidden",
            BridgeError::InvalidTransition { .. } => "invalid_transition",
            BridgeError::Transport(_) => "transport",
            BridgeError::ConnectionClosed(_) => "connection_closed",
            BridgeError::ConnectionLost(_) => "connection_lost",
            BridgeError::ConnectionExhausted { .. } => "connection_exhausted",
            BridgeError::Timeout { .. } => "timeout",
            BridgeError::Backend { .. } => "backend",
            BridgeError::Protocol(_) => "protocol",
            BridgeError::Secret(_) => "secret",
            BridgeError::InvalidConfig(_) => "invalid_config",
            BridgeError::Io(_) => "io",
            BridgeError::Serialization(_) => "serialization",
        }
    }

    /// Whether re-issuing the same call later can succeed without the caller
    /// changing its input.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            BridgeError::ModeForbidden { .. }
                | BridgeError::Transport(_)
                | BridgeError::ConnectionClosed(_)
                | BridgeError::ConnectionLost(_)
                | BridgeError::ConnectionExhausted { .. }
                | BridgeError::Timeout { .. }
                | BridgeError::Backend { .. }
        )
    }
}

// The UI receives errors as `{kind, message, recoverable}`.
impl serde::Serialize for BridgeError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("BridgeError", 3)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.serialize_field("recoverable", &self.recoverable())?;
        state.end()
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_tagged_object() {
        let err = BridgeError::ModeForbidden {
            command_type: CommandType::ImplementCode,
            mode: Mode::Plan,
            allowed: ModeSet::only(Mode::Act),
        };
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "mode_forbidden");
        assert_eq!(value["recoverable"], true);
        assert_eq!(
            value["message"],
            "implement_code is not allowed in plan mode (allowed in [act])"
        );
    }

    #[test]
    fn validation_is_not_recoverable() {
        let err: BridgeError = CommandError::UnknownType("nope".to_string()).into();
        assert_eq!(err.kind(), "validation");
        assert!(!err.recoverable());
    }
}
