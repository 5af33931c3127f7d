//! Error taxonomy for the perception-action loop.
//!
//! Fatal conditions ([`RoamerError::ControlAcquisitionTimeout`],
//! [`RoamerError::ControlLost`], [`RoamerError::Configuration`]) end a
//! session; everything else is recovered from inside the loop.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::ParamType;

/// Session-level error spanning transport failures, model replies, parsing,
/// dispatch and configuration.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoamerError {
    #[error("control was not granted within the acquisition window")]
    ControlAcquisitionTimeout,

    #[error("control lost: the robot revoked the lease")]
    ControlLost,

    #[error("transport error during {operation}: {details}")]
    Transport { operation: String, details: String },

    #[error("model returned an empty response")]
    EmptyModelResponse,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("operation cancelled")]
    Cancelled,
}

impl RoamerError {
    /// Shorthand for [`RoamerError::Transport`].
    pub fn transport(operation: impl Into<String>, details: impl ToString) -> Self {
        RoamerError::Transport {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// `true` for errors that must end the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RoamerError::ControlAcquisitionTimeout
                | RoamerError::ControlLost
                | RoamerError::Configuration(_)
        )
    }
}

/// Failure to turn model text into a [`ParsedCommand`][crate::ParsedCommand].
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParseError {
    #[error("malformed command '{input}': {reason}")]
    Malformed { input: String, reason: String },

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("command {command}: expected {expected} parameters, got {got}")]
    ArityMismatch {
        command: String,
        expected: usize,
        got: usize,
    },

    #[error("command {command}: parameter '{param}' expected {expected}, got '{value}'")]
    TypeMismatch {
        command: String,
        param: String,
        expected: ParamType,
        value: String,
    },
}

/// Failure while validating or executing a dispatched command.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DispatchError {
    #[error("command {command}: missing parameter '{param}'")]
    MissingParam { command: String, param: String },

    #[error("command {command}: parameter '{param}' must be {expected}, got {actual}")]
    WrongParamType {
        command: String,
        param: String,
        expected: ParamType,
        actual: ParamType,
    },

    #[error("command {command}: parameter '{param}' is invalid: {reason}")]
    InvalidParam {
        command: String,
        param: String,
        reason: String,
    },

    #[error("command {0} has no actuator binding")]
    NotDispatchable(String),

    #[error("command {0} refused: control lease is not granted")]
    LeaseNotGranted(String),

    #[error("command {command} failed on the robot: {details}")]
    Actuator { command: String, details: String },

    #[error("command {command} timed out after {timeout_ms} ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("command {0} cancelled")]
    Cancelled(String),
}

/// Startup-time configuration problem. Raised before any lease is requested.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("autonomous mode is disabled in the configuration")]
    Disabled,

    #[error("LLM API key is not set")]
    MissingApiKey,

    #[error("LLM provider '{0}' is not supported")]
    UnsupportedProvider(String),

    #[error("LLM model name is not set")]
    MissingModel,

    #[error("custom LLM provider selected but no endpoint is set")]
    MissingEndpoint,

    #[error("max_loop_iterations must be at least 1")]
    InvalidIterations,
}
