//! Common types used throughout the protocol

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol errors
///
/// These are caller/programmer errors: they fail fast and are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid datapoint ID: {0}. Must be between 0 and 255")]
    InvalidDatapointId(u32),

    #[error("Invalid payload for {datatype:?}: {reason}")]
    InvalidPayload { datatype: DataType, reason: String },

    #[error("Unsupported datatype: {0:#04X}")]
    UnsupportedDatatype(u8),

    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Unknown cluster command: {0:#04X}")]
    UnknownCommand(u8),
}

/// Transport-level failures reported by the external link collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Tuya cluster not available or device not properly initialized")]
    Unavailable,

    #[error("Request timeout")]
    Timeout,

    #[error("Device rejected the frame: {0}")]
    Rejected(String),

    #[error("Transport closed")]
    Closed,
}

/// Datatype tag carried in every datapoint frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DataType {
    /// [ bytes ]
    Raw = 0x00,
    /// [0/1]
    Bool = 0x01,
    /// [ 4 byte value ]
    Value = 0x02,
    /// [ N byte string ]
    String = 0x03,
    /// [ 0-255 ]
    Enum = 0x04,
    /// [ 1,2,4 bytes ] as bits
    Bitmap = 0x05,
}

impl TryFrom<u8> for DataType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(DataType::Raw),
            0x01 => Ok(DataType::Bool),
            0x02 => Ok(DataType::Value),
            0x03 => Ok(DataType::String),
            0x04 => Ok(DataType::Enum),
            0x05 => Ok(DataType::Bitmap),
            v => Err(ProtocolError::UnsupportedDatatype(v)),
        }
    }
}

impl DataType {
    /// Infer the wire datatype for a decoded value
    #[must_use]
    pub fn for_value(value: &DatapointValue) -> Self {
        match value {
            DatapointValue::Raw(_) => DataType::Raw,
            DatapointValue::Bool(_) => DataType::Bool,
            DatapointValue::Value(_) => DataType::Value,
            DatapointValue::String(_) => DataType::String,
            DatapointValue::Enum(_) => DataType::Enum,
            DatapointValue::Bitmap(_) => DataType::Bitmap,
        }
    }
}

/// Decoded semantic value of a datapoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatapointValue {
    Raw(Bytes),
    Bool(bool),
    Value(u32),
    String(String),
    Enum(u8),
    Bitmap(u32),
}

impl DatapointValue {
    /// Numeric view for `value`, `bitmap` and `enum` datapoints
    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            DatapointValue::Value(v) | DatapointValue::Bitmap(v) => Some(*v),
            DatapointValue::Enum(v) => Some(u32::from(*v)),
            _ => None,
        }
    }
}

impl std::fmt::Display for DatapointValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatapointValue::Raw(data) => write!(f, "{data:02X?}"),
            DatapointValue::Bool(v) => write!(f, "{v}"),
            DatapointValue::Value(v) => write!(f, "{v}"),
            DatapointValue::String(v) => write!(f, "{v:?}"),
            DatapointValue::Enum(v) => write!(f, "enum({v})"),
            DatapointValue::Bitmap(v) => write!(f, "{v:#b}"),
        }
    }
}

/// Where an inbound datapoint came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Device-initiated report (button press, periodic announce)
    Physical,
    /// Response to a command we sent
    App,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Physical => f.write_str("PHYSICAL"),
            Source::App => f.write_str("APP"),
        }
    }
}
