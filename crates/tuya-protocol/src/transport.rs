//! Transport boundary for datapoint frames
//!
//! The link layer (coordinator, radio, ZCL framing) is an external
//! collaborator. The core only needs to know whether a device is reachable
//! and to hand it a frame; inbound traffic arrives as [`TransportEvent`]s.

use crate::commands::CommandId;
use crate::frame::Frame;
use crate::types::{ProtocolError, TransportError};

use bytes::Bytes;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, Mutex};

/// Outbound primitive the reliable sender retries against
///
/// Implementations must be safe for concurrent use by many devices.
pub trait DatapointTransport: Send + Sync + 'static {
    /// Whether the Tuya cluster of the device at `address` is reachable
    fn is_available(&self, address: u16) -> bool;

    /// Transmit a frame, resolving once the device acknowledged or failed
    fn transmit(
        &self,
        address: u16,
        frame: Frame,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Raw events delivered by the link layer
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A Tuya cluster command arrived from a device
    Frame {
        address: u16,
        command: u8,
        payload: Bytes,
    },
    /// Device came (back) online
    Online { address: u16 },
    /// Device went offline
    Offline { address: u16 },
}

/// Parsed inbound cluster command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub command: CommandId,
    pub frame: Frame,
}

impl InboundEvent {
    /// Parse a cluster command payload
    #[allow(clippy::missing_errors_doc)]
    pub fn parse(command: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        let command = CommandId::from_u8(command).ok_or(ProtocolError::UnknownCommand(command))?;
        let frame = Frame::deserialize(payload)?;
        Ok(Self { command, frame })
    }
}

/// In-memory transport with scriptable outcomes
///
/// Records every transmitted frame, can fail on demand and, with echo
/// enabled, answers each successful transmit with a `response` command the
/// way real devices confirm a write.
pub struct MemoryTransport {
    available: AtomicBool,
    echo: AtomicBool,
    script: Mutex<VecDeque<Result<(), TransportError>>>,
    fallback: Mutex<Result<(), TransportError>>,
    sent: Mutex<Vec<(u16, Frame)>>,
    event_tx: broadcast::Sender<TransportEvent>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            available: AtomicBool::new(true),
            echo: AtomicBool::new(false),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(())),
            sent: Mutex::new(Vec::new()),
            event_tx,
        }
    }

    /// Answer successful transmits with a `response` event
    #[must_use]
    pub fn with_echo(self) -> Self {
        self.echo.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Queue outcomes for the next transmits, in order
    pub async fn push_outcomes(&self, outcomes: impl IntoIterator<Item = Result<(), TransportError>>) {
        self.script.lock().await.extend(outcomes);
    }

    /// Outcome used once the script is empty
    pub async fn set_fallback(&self, outcome: Result<(), TransportError>) {
        *self.fallback.lock().await = outcome;
    }

    /// Frames transmitted so far (including failed attempts)
    pub async fn sent(&self) -> Vec<(u16, Frame)> {
        self.sent.lock().await.clone()
    }

    /// Subscribe to inbound events
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    /// Deliver an event as if it came from the link layer
    pub fn inject(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Deliver a datapoint frame from a device
    pub fn inject_frame(&self, address: u16, command: CommandId, frame: &Frame) {
        self.inject(TransportEvent::Frame {
            address,
            command: command as u8,
            payload: frame.serialize(),
        });
    }
}

impl DatapointTransport for MemoryTransport {
    fn is_available(&self, _address: u16) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn transmit(&self, address: u16, frame: Frame) -> Result<(), TransportError> {
        tracing::debug!(
            "Transmit to {:#06x}: dp={} type={:?} seq={} data={:02X?}",
            address,
            frame.dp,
            frame.datatype,
            frame.transaction_id,
            frame.data.as_ref()
        );
        self.sent.lock().await.push((address, frame.clone()));

        let scripted = self.script.lock().await.pop_front();
        let outcome = match scripted {
            Some(outcome) => outcome,
            None => self.fallback.lock().await.clone(),
        };

        if outcome.is_ok() && self.echo.load(Ordering::SeqCst) {
            self.inject_frame(address, CommandId::Response, &frame);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    #[test]
    fn test_parse_inbound_reporting() {
        let frame = Frame::new(1, 1, DataType::Bool, Bytes::from_static(&[0x01]));
        let event = InboundEvent::parse(0x01, &frame.serialize()).unwrap();
        assert_eq!(event.command, CommandId::Reporting);
        assert_eq!(event.frame, frame);
    }

    #[test]
    fn test_parse_unknown_command() {
        let frame = Frame::new(1, 1, DataType::Bool, Bytes::from_static(&[0x01]));
        assert_eq!(
            InboundEvent::parse(0x09, &frame.serialize()),
            Err(ProtocolError::UnknownCommand(0x09))
        );
    }

    #[tokio::test]
    async fn test_memory_transport_script_then_fallback() {
        let transport = MemoryTransport::new();
        transport.push_outcomes([Err(TransportError::Timeout)]).await;
        let frame = Frame::new(0, 1, DataType::Bool, Bytes::from_static(&[0x00]));

        assert_eq!(
            transport.transmit(0x1234, frame.clone()).await,
            Err(TransportError::Timeout)
        );
        assert_eq!(transport.transmit(0x1234, frame).await, Ok(()));
        assert_eq!(transport.sent().await.len(), 2);
    }

    #[tokio::test]
    async fn test_echo_answers_with_response() {
        let transport = MemoryTransport::new().with_echo();
        let mut rx = transport.subscribe();
        let frame = Frame::new(5, 13, DataType::Bool, Bytes::from_static(&[0x01]));
        transport.transmit(0x0042, frame.clone()).await.unwrap();

        match rx.recv().await.unwrap() {
            TransportEvent::Frame {
                address,
                command,
                payload,
            } => {
                assert_eq!(address, 0x0042);
                assert_eq!(command, CommandId::Response as u8);
                assert_eq!(Frame::deserialize(&payload).unwrap(), frame);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
