//! Tuya datapoint protocol for the manufacturer-specific Zigbee cluster
//!
//! This crate implements the wire side of Tuya devices: datapoint frames,
//! the value codec, per-device transaction sequencing and the transport
//! boundary the reconciliation core talks to.

pub mod codec;
pub mod commands;
pub mod frame;
pub mod sequencer;
pub mod transport;
pub mod types;

pub use codec::{decode, decode_parts, encode};
pub use commands::{CommandId, TUYA_CLUSTER_ID};
pub use frame::Frame;
pub use sequencer::Sequencer;
pub use transport::{DatapointTransport, InboundEvent, MemoryTransport, TransportEvent};
pub use types::*;
