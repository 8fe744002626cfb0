//! Tuya device registry and inbound routing

use crate::config::CoreConfig;
use crate::device::{DeviceEvent, DeviceHandle};
use crate::error::DeviceError;
use crate::persistence;
use crate::profile::{ProductProfile, ProfileError};
use crate::sender::{AttemptObserver, ReliableSender};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tuya_protocol::{DatapointTransport, InboundEvent, TransportEvent};

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Device not found: {0:#06x}")]
    DeviceNotFound(u16),

    #[error("Device already registered: {0:#06x}")]
    AlreadyRegistered(u16),

    #[error("Invalid profile: {0}")]
    Profile(#[from] ProfileError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

/// Network events
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    DeviceRegistered { address: u16, product: String },
    DeviceRemoved { address: u16 },
}

/// Registry of Tuya devices sharing one transport
pub struct TuyaNetwork<T> {
    /// Shared link-layer transport
    transport: Arc<T>,
    config: CoreConfig,
    /// Running devices (keyed by network address)
    devices: Arc<DashMap<u16, DeviceHandle>>,
    event_tx: broadcast::Sender<NetworkEvent>,
    /// Shared by every device actor
    device_tx: broadcast::Sender<DeviceEvent>,
    observer: Option<AttemptObserver>,
}

impl<T: DatapointTransport> TuyaNetwork<T> {
    #[must_use]
    pub fn new(transport: Arc<T>, config: CoreConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let (device_tx, _) = broadcast::channel(256);
        Self {
            transport,
            config,
            devices: Arc::new(DashMap::new()),
            event_tx,
            device_tx,
            observer: None,
        }
    }

    /// Report every transmit attempt of every device to `observer`
    #[must_use]
    pub fn with_attempt_observer(mut self, observer: AttemptObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.event_tx.subscribe()
    }

    /// Events from all devices
    pub fn subscribe_devices(&self) -> broadcast::Receiver<DeviceEvent> {
        self.device_tx.subscribe()
    }

    /// Start a device actor for `address`, restoring saved state if any
    #[allow(clippy::missing_errors_doc)]
    pub async fn register(
        &self,
        address: u16,
        profile: ProductProfile,
    ) -> Result<DeviceHandle, NetworkError> {
        profile.validate()?;
        if self.devices.contains_key(&address) {
            return Err(NetworkError::AlreadyRegistered(address));
        }

        let restored = match &self.config.state_dir {
            Some(dir) => persistence::load_snapshot(dir, address).await,
            None => None,
        };

        let mut sender = ReliableSender::new(Arc::clone(&self.transport), address, self.config.retry);
        if let Some(observer) = &self.observer {
            sender = sender.with_observer(Arc::clone(observer));
        }

        let product = profile.name.clone();
        let handle = match self.devices.entry(address) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(NetworkError::AlreadyRegistered(address));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let handle = DeviceHandle::spawn_with(
                    address,
                    profile,
                    sender,
                    self.config.clone(),
                    self.device_tx.clone(),
                    restored,
                );
                entry.insert(handle.clone());
                handle
            }
        };

        tracing::info!("Registered {} at {:#06x}", product, address);
        let _ = self
            .event_tx
            .send(NetworkEvent::DeviceRegistered { address, product });
        Ok(handle)
    }

    /// Stop and forget a device
    #[allow(clippy::missing_errors_doc)]
    pub async fn remove(&self, address: u16) -> Result<(), NetworkError> {
        let (_, handle) = self
            .devices
            .remove(&address)
            .ok_or(NetworkError::DeviceNotFound(address))?;
        handle.shutdown().await?;

        tracing::info!("Removed device {:#06x}", address);
        let _ = self.event_tx.send(NetworkEvent::DeviceRemoved { address });
        Ok(())
    }

    pub fn device(&self, address: u16) -> Option<DeviceHandle> {
        self.devices.get(&address).map(|r| r.value().clone())
    }

    /// Addresses of all registered devices
    pub fn devices(&self) -> Vec<u16> {
        let mut addresses: Vec<u16> = self.devices.iter().map(|r| *r.key()).collect();
        addresses.sort_unstable();
        addresses
    }

    /// Stop every device actor
    pub async fn shutdown(&self) {
        let handles: Vec<DeviceHandle> = self.devices.iter().map(|r| r.value().clone()).collect();
        self.devices.clear();
        for handle in handles {
            if let Err(e) = handle.shutdown().await {
                tracing::debug!("Device {:#06x} already stopped: {}", handle.address(), e);
            }
        }
    }

    /// Route link-layer events to device actors
    ///
    /// `reporting` and `response` commands reach the owning device tagged
    /// with their source; other commands, unknown addresses and malformed
    /// payloads are logged and dropped.
    pub fn start_event_listener(&self, mut rx: broadcast::Receiver<TransportEvent>) -> JoinHandle<()> {
        let devices = Arc::clone(&self.devices);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(TransportEvent::Frame {
                        address,
                        command,
                        payload,
                    }) => {
                        let Some(device) = devices.get(&address).map(|r| r.value().clone()) else {
                            tracing::debug!("Frame from unknown device {:#06x}, dropping", address);
                            continue;
                        };
                        let event = match InboundEvent::parse(command, &payload) {
                            Ok(event) => event,
                            Err(e) => {
                                tracing::warn!("Dropping frame from {:#06x}: {}", address, e);
                                continue;
                            }
                        };
                        if event.command.source().is_none() {
                            tracing::debug!(
                                "Ignoring {:?} command from {:#06x}",
                                event.command,
                                address
                            );
                            continue;
                        }
                        if let Err(e) = device.inbound(event) {
                            tracing::warn!("Device {:#06x} did not accept frame: {}", address, e);
                        }
                    }
                    Ok(TransportEvent::Online { address }) => {
                        if let Some(device) = devices.get(&address).map(|r| r.value().clone()) {
                            if let Err(e) = device.connected() {
                                tracing::warn!("Device {:#06x} did not accept online: {}", address, e);
                            }
                        }
                    }
                    Ok(TransportEvent::Offline { address }) => {
                        if let Some(device) = devices.get(&address).map(|r| r.value().clone()) {
                            if let Err(e) = device.disconnected() {
                                tracing::warn!("Device {:#06x} did not accept offline: {}", address, e);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Event listener lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Event channel closed, stopping listener");
                        break;
                    }
                }
            }
        })
    }
}
