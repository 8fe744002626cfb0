//! Tuya device layer
//!
//! Reliable delivery, state reconciliation, recovery tracking and debouncing
//! for Tuya datapoint devices, on top of the `tuya-protocol` codec.

pub mod config;
pub mod debounce;
pub mod device;
pub mod error;
pub mod network;
pub mod persistence;
pub mod profile;
pub mod reconcile;
pub mod recovery;
pub mod sender;

pub use config::{CoreConfig, DebounceTiming, ReconcileConfig, RetryPolicy};
pub use device::{DeviceEvent, DeviceHandle, DeviceSnapshot};
pub use error::{ConfigError, DeviceError, ReconcileError, SendError};
pub use network::{NetworkError, NetworkEvent, TuyaNetwork};
pub use profile::{GangProfile, PowerOnBehavior, ProductProfile, SirenControls, SirenSettings};
pub use reconcile::{ApplyOutcome, ReconcileEngine, StateKey, StateValue, Transition};
pub use recovery::{CompletionPolicy, RecoveryReport, RecoveryTracker};
pub use sender::{DatapointCommand, Delivery, ReliableSender};
