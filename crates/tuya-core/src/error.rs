//! Error types for the device layer

use thiserror::Error;
use tuya_protocol::{ProtocolError, TransportError};

/// Outcome of a reliable send that did not reach the device
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Malformed request, never retried
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Retry budget spent against a failing transport
    #[error("Send to dp {dp} exhausted after {attempts} attempts: {last_error}")]
    SendExhausted {
        dp: u8,
        attempts: u32,
        last_error: TransportError,
    },
}

/// Inbound values that could not be reconciled
///
/// None of these touch cached state; the device logs them and moves on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("Unknown enum value {code} for dp {dp}")]
    UnknownEnumValue { dp: u8, code: u32 },

    #[error("Unexpected value for dp {dp}: {value}")]
    UnexpectedValue { dp: u8, value: String },

    #[error("Value {value} out of range for dp {dp}")]
    OutOfRange { dp: u8, value: u32 },
}

/// Errors returned by device commands
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Send failed: {0}")]
    Send(#[from] SendError),

    #[error("Invalid value: {0}")]
    InvalidValue(#[from] ReconcileError),

    #[error("Unknown gang: {0}")]
    UnknownGang(usize),

    #[error("Gang {gang} has no {control} control")]
    UnsupportedControl { gang: usize, control: &'static str },

    #[error("Invalid level: {0}. Must be between 0 and 1")]
    InvalidLevel(f64),

    #[error("Invalid level limits: min {min} must be below max {max}")]
    InvalidLimits { min: f64, max: f64 },

    #[error("dp {0} is not part of this device")]
    UnknownDatapoint(u8),

    #[error("Unknown option {label:?} for dp {dp}")]
    UnknownOption { dp: u8, label: String },

    #[error("Device actor is not running")]
    NotRunning,
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
