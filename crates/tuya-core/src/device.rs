//! Per-device actor
//!
//! One task per physical device owns its sequencer, one reconciliation
//! engine per gang, the recovery tracker and the debounce gate. Everything
//! reaches it through [`DeviceHandle`] messages, so inbound frames, commands
//! and timer fires for one device are handled one at a time, in order.

use crate::config::CoreConfig;
use crate::debounce::DebounceGate;
use crate::error::{DeviceError, ReconcileError, SendError};
use crate::persistence;
use crate::profile::{GangControls, PowerOnBehavior, ProductProfile, SirenControls, SirenSettings};
use crate::reconcile::{ApplyOutcome, DatapointKind, GangSnapshot, ReconcileEngine, StateValue, Transition};
use crate::recovery::{RecoveryReport, RecoveryTracker};
use crate::sender::{DatapointCommand, Delivery, ReliableSender};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tuya_protocol::{codec, DatapointTransport, DatapointValue, InboundEvent, ProtocolError, Sequencer};

/// Pause between configuring a siren and starting it
const SIREN_SETTLE: Duration = Duration::from_millis(200);

/// Test beep settings are reverted this long after the beep started
const BEEP_RESTORE_DELAY: Duration = Duration::from_secs(3);

/// Events published by device actors
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Reconciled state changed (reported, acknowledged or derived)
    StateChanged {
        address: u16,
        gang: usize,
        transition: Transition,
    },
    /// Recovery window closed
    RecoveryCompleted { address: u16, report: RecoveryReport },
    /// A deferred write never reached the device
    CommandFailed {
        address: u16,
        dp: u8,
        error: SendError,
    },
    /// An inbound value was rejected; cached state kept
    Anomaly {
        address: u16,
        dp: u8,
        error: ReconcileError,
    },
    /// An inbound frame could not be decoded
    MalformedFrame { address: u16, error: ProtocolError },
    Availability { address: u16, online: bool },
}

/// Point-in-time view of a device's reconciled state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub address: u16,
    pub product: String,
    pub gangs: Vec<GangSnapshot>,
    #[serde(default)]
    pub online: bool,
    /// Recovery window open
    #[serde(default)]
    pub syncing: bool,
}

impl DeviceSnapshot {
    /// Cached value of `dp` in whichever gang owns it
    #[must_use]
    pub fn value(&self, dp: u8) -> Option<&StateValue> {
        self.gangs.iter().find_map(|g| g.values.get(&dp))
    }
}

enum DeviceMessage {
    Inbound(InboundEvent),
    Connected,
    Disconnected,
    SetSwitch {
        gang: usize,
        on: bool,
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
    SetLevel {
        gang: usize,
        level: f64,
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
    SetLevelLimits {
        gang: usize,
        min: f64,
        max: f64,
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
    Write {
        command: DatapointCommand,
        reply: oneshot::Sender<Result<Delivery, DeviceError>>,
    },
    WriteBulk {
        commands: Vec<DatapointCommand>,
        delay: Option<Duration>,
        reply: oneshot::Sender<Vec<Result<Delivery, DeviceError>>>,
    },
    Select {
        dp: u8,
        label: String,
        reply: oneshot::Sender<Result<Delivery, DeviceError>>,
    },
    SetPowerOnBehavior {
        behavior: PowerOnBehavior,
        reply: oneshot::Sender<Result<Delivery, DeviceError>>,
    },
    SyncPowerOnBehavior {
        reply: oneshot::Sender<Result<Delivery, DeviceError>>,
    },
    StartSiren {
        reply: oneshot::Sender<Result<Delivery, DeviceError>>,
    },
    StopSiren {
        reply: oneshot::Sender<Result<Delivery, DeviceError>>,
    },
    PlayTestBeep {
        reply: oneshot::Sender<Result<Delivery, DeviceError>>,
    },
    Snapshot {
        reply: oneshot::Sender<DeviceSnapshot>,
    },
}

/// Mailbox entry; shutdown ends the actor loop so it never reaches `handle`
enum Envelope {
    Message(DeviceMessage),
    Shutdown(oneshot::Sender<()>),
}

/// Debounced level change that reached its quiet period
struct LevelFire {
    gang: usize,
    level: f64,
    cold_start: bool,
}

enum TimerFire {
    Level(LevelFire),
    RestoreSiren,
}

/// Command checked against the profile, with the state to cache on ack
type PreparedCommand = (DatapointCommand, Option<(usize, u8, StateValue)>);

/// Cloneable handle to a running device actor
#[derive(Clone)]
pub struct DeviceHandle {
    address: u16,
    product: Arc<str>,
    tx: mpsc::UnboundedSender<Envelope>,
    events: broadcast::Sender<DeviceEvent>,
}

impl DeviceHandle {
    /// Spawn a device with its own event channel
    pub fn spawn<T: DatapointTransport>(
        address: u16,
        profile: ProductProfile,
        transport: Arc<T>,
        config: CoreConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let sender = ReliableSender::new(transport, address, config.retry);
        Self::spawn_with(address, profile, sender, config, events, None)
    }

    /// Spawn a device publishing on `events`, optionally seeded from a
    /// persisted snapshot
    pub fn spawn_with<T: DatapointTransport>(
        address: u16,
        profile: ProductProfile,
        sender: ReliableSender<T>,
        config: CoreConfig,
        events: broadcast::Sender<DeviceEvent>,
        restored: Option<DeviceSnapshot>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (deadline_tx, deadline_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let mut gangs: Vec<ReconcileEngine> = profile
            .gangs
            .iter()
            .map(|g| ReconcileEngine::new(g.datapoints.clone(), g.cascades.clone(), config.reconcile))
            .collect();

        if let Some(snapshot) = restored {
            if snapshot.product == profile.name {
                for (engine, gang) in gangs.iter_mut().zip(snapshot.gangs) {
                    engine.restore(gang);
                }
                tracing::info!("Restored state for {:#06x} ({})", address, profile.name);
            } else {
                tracing::warn!(
                    "Ignoring saved state for {:#06x}: product {} does not match {}",
                    address,
                    snapshot.product,
                    profile.name
                );
            }
        }

        let product: Arc<str> = Arc::from(profile.name.as_str());
        let state_dir = config.state_dir.clone();

        let actor = DeviceActor {
            address,
            recovery: RecoveryTracker::new(profile.recovery.policy, deadline_tx),
            profile,
            config,
            sender,
            sequencer: Sequencer::new(),
            gangs,
            debounce: DebounceGate::new(),
            siren_restore: DebounceGate::new(),
            saved_siren: None,
            timer_tx,
            events: events.clone(),
            online: false,
            state_dir,
        };

        tracing::info!("Starting device actor {:#06x} ({})", address, product);
        tokio::spawn(actor.run(rx, deadline_rx, timer_rx));

        Self {
            address,
            product,
            tx,
            events,
        }
    }

    #[must_use]
    pub fn address(&self) -> u16 {
        self.address
    }

    #[must_use]
    pub fn product(&self) -> &str {
        &self.product
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue an inbound cluster command (arrival order is preserved)
    #[allow(clippy::missing_errors_doc)]
    pub fn inbound(&self, event: InboundEvent) -> Result<(), DeviceError> {
        self.post(DeviceMessage::Inbound(event))
    }

    /// Device came online; opens a recovery window
    #[allow(clippy::missing_errors_doc)]
    pub fn connected(&self) -> Result<(), DeviceError> {
        self.post(DeviceMessage::Connected)
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn disconnected(&self) -> Result<(), DeviceError> {
        self.post(DeviceMessage::Disconnected)
    }

    /// Switch a gang on or off; resolves once the device acknowledged
    #[allow(clippy::missing_errors_doc)]
    pub async fn set_switch(&self, gang: usize, on: bool) -> Result<(), DeviceError> {
        self.request(|reply| DeviceMessage::SetSwitch { gang, on, reply })
            .await?
    }

    /// Schedule a debounced level change (0..=1)
    ///
    /// Resolves once scheduled; a failed write is published as
    /// [`DeviceEvent::CommandFailed`].
    #[allow(clippy::missing_errors_doc)]
    pub async fn set_level(&self, gang: usize, level: f64) -> Result<(), DeviceError> {
        self.request(|reply| DeviceMessage::SetLevel { gang, level, reply })
            .await?
    }

    #[allow(clippy::missing_errors_doc)]
    pub async fn set_level_limits(&self, gang: usize, min: f64, max: f64) -> Result<(), DeviceError> {
        self.request(|reply| DeviceMessage::SetLevelLimits {
            gang,
            min,
            max,
            reply,
        })
        .await?
    }

    /// Write a single datapoint
    ///
    /// Values for mapped dps are validated and re-encoded with the dp's
    /// datatype; unmapped dps are passed through uncached.
    #[allow(clippy::missing_errors_doc)]
    pub async fn write(&self, command: DatapointCommand) -> Result<Delivery, DeviceError> {
        self.request(|reply| DeviceMessage::Write { command, reply })
            .await?
    }

    #[allow(clippy::missing_errors_doc)]
    pub async fn write_bool(&self, dp: u32, value: bool) -> Result<Delivery, DeviceError> {
        self.write(DatapointCommand::new(dp, DatapointValue::Bool(value)))
            .await
    }

    #[allow(clippy::missing_errors_doc)]
    pub async fn write_value(&self, dp: u32, value: u32) -> Result<Delivery, DeviceError> {
        self.write(DatapointCommand::new(dp, DatapointValue::Value(value)))
            .await
    }

    #[allow(clippy::missing_errors_doc)]
    pub async fn write_enum(&self, dp: u32, value: u8) -> Result<Delivery, DeviceError> {
        self.write(DatapointCommand::new(dp, DatapointValue::Enum(value)))
            .await
    }

    #[allow(clippy::missing_errors_doc)]
    pub async fn write_string(&self, dp: u32, value: impl Into<String>) -> Result<Delivery, DeviceError> {
        self.write(DatapointCommand::new(dp, DatapointValue::String(value.into())))
            .await
    }

    #[allow(clippy::missing_errors_doc)]
    pub async fn write_raw(&self, dp: u32, value: Bytes) -> Result<Delivery, DeviceError> {
        self.write(DatapointCommand::new(dp, DatapointValue::Raw(value)))
            .await
    }

    /// Write commands sequentially, pausing `delay` (default from config)
    /// after each delivered one
    ///
    /// Commands for mapped dps are validated like [`write`](Self::write);
    /// rejected ones get an `Err` entry and are not sent.
    #[allow(clippy::missing_errors_doc)]
    pub async fn write_bulk(
        &self,
        commands: Vec<DatapointCommand>,
        delay: Option<Duration>,
    ) -> Result<Vec<Result<Delivery, DeviceError>>, DeviceError> {
        self.request(|reply| DeviceMessage::WriteBulk {
            commands,
            delay,
            reply,
        })
        .await
    }

    /// Write a choice dp by option label
    #[allow(clippy::missing_errors_doc)]
    pub async fn select(&self, dp: u8, label: impl Into<String>) -> Result<Delivery, DeviceError> {
        let label = label.into();
        self.request(|reply| DeviceMessage::Select { dp, label, reply })
            .await?
    }

    #[allow(clippy::missing_errors_doc)]
    pub async fn set_power_on_behavior(&self, behavior: PowerOnBehavior) -> Result<Delivery, DeviceError> {
        self.request(|reply| DeviceMessage::SetPowerOnBehavior { behavior, reply })
            .await?
    }

    /// Write the cached power-on behavior back to the device
    ///
    /// Devices forget the setting after a factory reset or re-pair; without
    /// a cached value `memory` is written.
    #[allow(clippy::missing_errors_doc)]
    pub async fn sync_power_on_behavior(&self) -> Result<Delivery, DeviceError> {
        self.request(|reply| DeviceMessage::SyncPowerOnBehavior { reply })
            .await?
    }

    /// Configure melody, volume and duration, then sound the alarm
    ///
    /// Uses the cached settings, or the profile defaults for any the
    /// device has not reported. The device stops by itself after the
    /// duration.
    #[allow(clippy::missing_errors_doc)]
    pub async fn start_siren(&self) -> Result<Delivery, DeviceError> {
        self.request(|reply| DeviceMessage::StartSiren { reply })
            .await?
    }

    #[allow(clippy::missing_errors_doc)]
    pub async fn stop_siren(&self) -> Result<Delivery, DeviceError> {
        self.request(|reply| DeviceMessage::StopSiren { reply })
            .await?
    }

    /// Sound a short test beep, restoring the previous settings afterwards
    #[allow(clippy::missing_errors_doc)]
    pub async fn play_test_beep(&self) -> Result<Delivery, DeviceError> {
        self.request(|reply| DeviceMessage::PlayTestBeep { reply })
            .await?
    }

    #[allow(clippy::missing_errors_doc)]
    pub async fn snapshot(&self) -> Result<DeviceSnapshot, DeviceError> {
        self.request(|reply| DeviceMessage::Snapshot { reply }).await
    }

    /// Stop the actor, cancelling its timers and saving state
    #[allow(clippy::missing_errors_doc)]
    pub async fn shutdown(&self) -> Result<(), DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope::Shutdown(reply))
            .map_err(|_| DeviceError::NotRunning)?;
        rx.await.map_err(|_| DeviceError::NotRunning)
    }

    fn post(&self, message: DeviceMessage) -> Result<(), DeviceError> {
        self.tx
            .send(Envelope::Message(message))
            .map_err(|_| DeviceError::NotRunning)
    }

    async fn request<R>(
        &self,
        message: impl FnOnce(oneshot::Sender<R>) -> DeviceMessage,
    ) -> Result<R, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.post(message(reply))?;
        rx.await.map_err(|_| DeviceError::NotRunning)
    }
}

struct DeviceActor<T> {
    address: u16,
    profile: ProductProfile,
    config: CoreConfig,
    sender: ReliableSender<T>,
    sequencer: Sequencer,
    gangs: Vec<ReconcileEngine>,
    recovery: RecoveryTracker,
    debounce: DebounceGate<usize>,
    siren_restore: DebounceGate<()>,
    /// Settings to put back once a test beep is over
    saved_siren: Option<SirenSettings>,
    timer_tx: mpsc::UnboundedSender<TimerFire>,
    events: broadcast::Sender<DeviceEvent>,
    online: bool,
    state_dir: Option<PathBuf>,
}

impl<T: DatapointTransport> DeviceActor<T> {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Envelope>,
        mut deadline_rx: mpsc::UnboundedReceiver<u64>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerFire>,
    ) {
        loop {
            tokio::select! {
                envelope = rx.recv() => match envelope {
                    Some(Envelope::Shutdown(reply)) => {
                        self.stop().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(Envelope::Message(message)) => self.handle(message).await,
                    None => break,
                },
                Some(session) = deadline_rx.recv() => {
                    if let Some(report) = self.recovery.on_deadline(session) {
                        self.publish_report(report);
                    }
                }
                Some(fire) = timer_rx.recv() => match fire {
                    TimerFire::Level(fire) => self.on_level_fire(fire).await,
                    TimerFire::RestoreSiren => self.on_restore_siren().await,
                },
            }
        }
        self.stop().await;
    }

    async fn handle(&mut self, message: DeviceMessage) {
        match message {
            DeviceMessage::Inbound(event) => self.on_inbound(event).await,
            DeviceMessage::Connected => self.on_connected(),
            DeviceMessage::Disconnected => self.on_disconnected(),
            DeviceMessage::SetSwitch { gang, on, reply } => {
                let _ = reply.send(self.set_switch(gang, on).await);
            }
            DeviceMessage::SetLevel { gang, level, reply } => {
                let _ = reply.send(self.set_level(gang, level));
            }
            DeviceMessage::SetLevelLimits {
                gang,
                min,
                max,
                reply,
            } => {
                let _ = reply.send(self.set_level_limits(gang, min, max).await);
            }
            DeviceMessage::Write { command, reply } => {
                let _ = reply.send(self.write(command).await);
            }
            DeviceMessage::WriteBulk {
                commands,
                delay,
                reply,
            } => {
                let delay = delay.unwrap_or_else(|| self.config.bulk_delay());
                let _ = reply.send(self.write_bulk(commands, delay).await);
            }
            DeviceMessage::Select { dp, label, reply } => {
                let _ = reply.send(self.select(dp, label).await);
            }
            DeviceMessage::SetPowerOnBehavior { behavior, reply } => {
                let _ = reply.send(self.set_power_on_behavior(behavior).await);
            }
            DeviceMessage::SyncPowerOnBehavior { reply } => {
                let _ = reply.send(self.sync_power_on_behavior().await);
            }
            DeviceMessage::StartSiren { reply } => {
                let _ = reply.send(self.start_siren().await);
            }
            DeviceMessage::StopSiren { reply } => {
                let _ = reply.send(self.stop_siren().await);
            }
            DeviceMessage::PlayTestBeep { reply } => {
                let _ = reply.send(self.play_test_beep().await);
            }
            DeviceMessage::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn on_inbound(&mut self, event: InboundEvent) {
        let Some(source) = event.command.source() else {
            tracing::debug!(
                "Ignoring {:?} command from {:#06x}",
                event.command,
                self.address
            );
            return;
        };
        let dp = event.frame.dp;

        let value = match codec::decode(&event.frame) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!("Malformed dp {} from {:#06x}: {}", dp, self.address, error);
                let _ = self.events.send(DeviceEvent::MalformedFrame {
                    address: self.address,
                    error,
                });
                return;
            }
        };
        tracing::debug!(
            "dp {} from {:#06x}: {} ({}, seq {})",
            dp,
            self.address,
            value,
            source,
            event.frame.transaction_id
        );

        let mut owned = false;
        let mut changed = false;
        for gang in 0..self.gangs.len() {
            match self.gangs[gang].apply(dp, &value, source) {
                Ok(ApplyOutcome::NotOwned) => {}
                Ok(ApplyOutcome::Applied(transitions)) => {
                    owned = true;
                    changed |= self.publish(gang, transitions);
                }
                Err(error) => {
                    owned = true;
                    tracing::warn!(
                        "{} on {:#06x}: {}, keeping previous value",
                        self.profile.gangs[gang].name,
                        self.address,
                        error
                    );
                    let _ = self.events.send(DeviceEvent::Anomaly {
                        address: self.address,
                        dp,
                        error,
                    });
                }
            }
        }

        if !owned {
            tracing::debug!("dp {} is not mapped for {}", dp, self.profile.name);
            return;
        }
        if let Some(report) = self.recovery.observe(dp) {
            self.publish_report(report);
        }
        if changed {
            self.persist().await;
        }
    }

    fn on_connected(&mut self) {
        tracing::info!("Device {:#06x} online", self.address);
        self.online = true;
        let _ = self.events.send(DeviceEvent::Availability {
            address: self.address,
            online: true,
        });
        let recovery = &self.profile.recovery;
        self.recovery.open(recovery.expected.clone(), recovery.timeout());
    }

    fn on_disconnected(&mut self) {
        tracing::info!("Device {:#06x} offline", self.address);
        self.online = false;
        self.recovery.cancel();
        let _ = self.events.send(DeviceEvent::Availability {
            address: self.address,
            online: false,
        });
    }

    async fn set_switch(&mut self, gang: usize, on: bool) -> Result<(), DeviceError> {
        let controls = self.controls(gang)?;
        let switch_dp = controls.switch.ok_or(DeviceError::UnsupportedControl {
            gang,
            control: "switch",
        })?;

        if self.gangs[gang].switch(switch_dp) == Some(on) {
            tracing::debug!(
                "{} already {}, skipping command",
                self.profile.gangs[gang].name,
                if on { "on" } else { "off" }
            );
            return Ok(());
        }
        self.debounce.cancel(&gang);

        if on {
            self.write_state(switch_dp, StateValue::Switch(true)).await?;
            if let (Some(level_dp), Some(startup)) = (controls.level, controls.startup_level) {
                let stopped = self.gangs[gang]
                    .ratio(level_dp)
                    .map_or(true, |r| r <= self.config.reconcile.ratio_epsilon);
                if stopped {
                    tracing::info!(
                        "{} starting from 0, setting level {:.0}%",
                        self.profile.gangs[gang].name,
                        startup * 100.0
                    );
                    tokio::time::sleep(self.config.debounce.startup_settle()).await;
                    self.write_state(level_dp, StateValue::Ratio(startup)).await?;
                }
            }
        } else {
            self.write_state(switch_dp, StateValue::Switch(false)).await?;
            if let Some(level_dp) = controls.level {
                self.write_state(level_dp, StateValue::Ratio(0.0)).await?;
            }
        }
        Ok(())
    }

    fn set_level(&mut self, gang: usize, level: f64) -> Result<(), DeviceError> {
        if !(0.0..=1.0).contains(&level) {
            return Err(DeviceError::InvalidLevel(level));
        }
        let controls = self.controls(gang)?;
        if controls.level.is_none() {
            return Err(DeviceError::UnsupportedControl {
                gang,
                control: "level",
            });
        }

        let running = controls
            .switch
            .and_then(|dp| self.gangs[gang].switch(dp))
            .unwrap_or(false);
        let cold_start = !running && level > 0.0;
        let delay = self.config.debounce.delay(cold_start);

        tracing::debug!(
            "{} level {:.0}% in {:?}{}",
            self.profile.gangs[gang].name,
            level * 100.0,
            delay,
            if cold_start { " (cold start)" } else { "" }
        );
        let timer_tx = self.timer_tx.clone();
        self.debounce.schedule(gang, level, delay, move |level| {
            let _ = timer_tx.send(TimerFire::Level(LevelFire {
                gang,
                level,
                cold_start,
            }));
        });
        Ok(())
    }

    async fn on_level_fire(&mut self, fire: LevelFire) {
        let Ok(controls) = self.controls(fire.gang) else {
            return;
        };
        let Some(level_dp) = controls.level else {
            return;
        };

        if fire.level > 0.0 {
            if let (true, Some(switch_dp)) = (fire.cold_start, controls.switch) {
                tracing::info!("{} motor startup sequence", self.profile.gangs[fire.gang].name);
                if !self.deferred_write(switch_dp, StateValue::Switch(true)).await {
                    return;
                }
                tokio::time::sleep(self.config.debounce.startup_settle()).await;
            }
            self.deferred_write(level_dp, StateValue::Ratio(fire.level)).await;
        } else {
            if let Some(switch_dp) = controls.switch {
                if !self.deferred_write(switch_dp, StateValue::Switch(false)).await {
                    return;
                }
            }
            self.deferred_write(level_dp, StateValue::Ratio(0.0)).await;
        }
    }

    async fn set_level_limits(&mut self, gang: usize, min: f64, max: f64) -> Result<(), DeviceError> {
        let in_range = |v: f64| (0.0..=1.0).contains(&v);
        if !in_range(min) || !in_range(max) || min >= max {
            return Err(DeviceError::InvalidLimits { min, max });
        }
        let controls = self.controls(gang)?;
        let (Some(min_dp), Some(max_dp)) = (controls.min_level, controls.max_level) else {
            return Err(DeviceError::UnsupportedControl {
                gang,
                control: "level limits",
            });
        };

        self.write_state(min_dp, StateValue::Ratio(min)).await?;
        self.write_state(max_dp, StateValue::Ratio(max)).await?;
        Ok(())
    }

    async fn write(&mut self, command: DatapointCommand) -> Result<Delivery, DeviceError> {
        let mapped = u8::try_from(command.dp)
            .ok()
            .filter(|dp| self.locate(*dp).is_some());

        match mapped {
            Some(dp) => self.write_mapped(dp, command.value).await,
            None => Ok(self
                .sender
                .send(&mut self.sequencer, command.dp, command.datatype, &command.value)
                .await?),
        }
    }

    async fn write_bulk(
        &mut self,
        commands: Vec<DatapointCommand>,
        delay: Duration,
    ) -> Vec<Result<Delivery, DeviceError>> {
        let mut results: Vec<Option<Result<Delivery, DeviceError>>> = Vec::with_capacity(commands.len());
        let mut outgoing = Vec::new();
        let mut pending = Vec::new();
        for (i, command) in commands.into_iter().enumerate() {
            match self.prepare(command) {
                Ok((command, cached)) => {
                    outgoing.push(command);
                    pending.push((i, cached));
                    results.push(None);
                }
                Err(e) => {
                    tracing::warn!("Bulk command {} for {:#06x} rejected: {}", i, self.address, e);
                    results.push(Some(Err(e)));
                }
            }
        }

        let sent = self
            .sender
            .send_bulk(&mut self.sequencer, &outgoing, delay)
            .await;

        let mut changed = false;
        for ((i, cached), result) in pending.into_iter().zip(sent) {
            if let (Ok(_), Some((gang, dp, state))) = (&result, cached) {
                changed |= self.commit_local(gang, dp, state);
            }
            results[i] = Some(result.map_err(DeviceError::from));
        }
        if changed {
            self.persist().await;
        }
        results.into_iter().flatten().collect()
    }

    /// Validate a command for a mapped dp and normalize it to the dp's
    /// datatype; unmapped dps pass through uncached
    fn prepare(&self, command: DatapointCommand) -> Result<PreparedCommand, DeviceError> {
        let mapped = u8::try_from(command.dp)
            .ok()
            .and_then(|dp| self.locate(dp).map(|(gang, kind)| (gang, dp, kind)));
        let Some((gang, dp, kind)) = mapped else {
            return Ok((command, None));
        };

        let state = kind.interpret_write(dp, &command.value)?;
        let normalized = DatapointCommand {
            dp: command.dp,
            datatype: kind.datatype(),
            value: kind.encode(dp, &state)?,
        };
        Ok((normalized, Some((gang, dp, state))))
    }

    async fn select(&mut self, dp: u8, label: String) -> Result<Delivery, DeviceError> {
        let (_, kind) = self.locate(dp).ok_or(DeviceError::UnknownDatapoint(dp))?;
        let Some(option) = kind
            .options()
            .iter()
            .find(|o| o.label.eq_ignore_ascii_case(&label))
            .cloned()
        else {
            return Err(DeviceError::UnknownOption { dp, label });
        };

        self.write_state(
            dp,
            StateValue::Choice {
                code: option.code,
                label: option.label,
            },
        )
        .await
    }

    async fn set_power_on_behavior(&mut self, behavior: PowerOnBehavior) -> Result<Delivery, DeviceError> {
        let dp = self.profile.power_on_dp.ok_or(DeviceError::UnsupportedControl {
            gang: 0,
            control: "power-on behavior",
        })?;
        let delivery = self
            .write_state(
                dp,
                StateValue::Choice {
                    code: behavior as u8,
                    label: behavior.label().to_string(),
                },
            )
            .await?;
        tracing::info!("Power-on behavior for {:#06x} set: {}", self.address, behavior.label());
        Ok(delivery)
    }

    async fn sync_power_on_behavior(&mut self) -> Result<Delivery, DeviceError> {
        let dp = self.profile.power_on_dp.ok_or(DeviceError::UnsupportedControl {
            gang: 0,
            control: "power-on behavior",
        })?;
        let behavior = match self.cached(dp) {
            Some(StateValue::Choice { code, .. }) => {
                PowerOnBehavior::try_from(*code).unwrap_or(PowerOnBehavior::Memory)
            }
            _ => PowerOnBehavior::Memory,
        };
        self.set_power_on_behavior(behavior).await
    }

    async fn start_siren(&mut self) -> Result<Delivery, DeviceError> {
        let controls = self.siren_controls()?;
        let settings = self.siren_settings(&controls);
        tracing::info!("Starting siren on {:#06x} ({:?})", self.address, settings);
        self.sound(&controls, settings).await
    }

    async fn stop_siren(&mut self) -> Result<Delivery, DeviceError> {
        let controls = self.siren_controls()?;
        self.write_state(controls.alarm_dp, StateValue::Switch(false))
            .await
    }

    async fn play_test_beep(&mut self) -> Result<Delivery, DeviceError> {
        let controls = self.siren_controls()?;
        // A beep during a pending restore keeps the original settings
        if self.saved_siren.is_none() {
            self.saved_siren = Some(self.siren_settings(&controls));
        }

        let result = self.sound(&controls, SirenSettings::TEST_BEEP).await;
        let timer_tx = self.timer_tx.clone();
        self.siren_restore.schedule((), (), BEEP_RESTORE_DELAY, move |()| {
            let _ = timer_tx.send(TimerFire::RestoreSiren);
        });
        result
    }

    async fn on_restore_siren(&mut self) {
        let (Some(settings), Ok(controls)) = (self.saved_siren.take(), self.siren_controls()) else {
            return;
        };
        tracing::debug!("Restoring siren settings on {:#06x}", self.address);
        for (dp, value) in controls.writes(settings) {
            match self.write_mapped(dp, value).await {
                Ok(_) => {}
                Err(DeviceError::Send(error)) => {
                    let _ = self.events.send(DeviceEvent::CommandFailed {
                        address: self.address,
                        dp,
                        error,
                    });
                }
                Err(e) => tracing::warn!("Siren setting dp {} not restored: {}", dp, e),
            }
        }
    }

    /// Configure the siren, let it settle, then sound it
    async fn sound(&mut self, controls: &SirenControls, settings: SirenSettings) -> Result<Delivery, DeviceError> {
        for (dp, value) in controls.writes(settings) {
            self.write_mapped(dp, value).await?;
        }
        tokio::time::sleep(SIREN_SETTLE).await;
        self.write_state(controls.alarm_dp, StateValue::Switch(true))
            .await
    }

    fn siren_controls(&self) -> Result<SirenControls, DeviceError> {
        self.profile.siren.clone().ok_or(DeviceError::UnsupportedControl {
            gang: 0,
            control: "siren",
        })
    }

    /// Cached siren settings, falling back to the profile defaults
    fn siren_settings(&self, controls: &SirenControls) -> SirenSettings {
        let code = |dp| match self.cached(dp) {
            Some(StateValue::Choice { code, .. }) => Some(*code),
            _ => None,
        };
        let duration = match self.cached(controls.duration_dp) {
            Some(StateValue::Number(n)) => *n,
            _ => controls.defaults.duration_s,
        };
        SirenSettings {
            melody: code(controls.melody_dp).unwrap_or(controls.defaults.melody),
            volume: code(controls.volume_dp).unwrap_or(controls.defaults.volume),
            duration_s: duration,
        }
    }

    /// Validate `value` against a mapped dp and write it
    async fn write_mapped(&mut self, dp: u8, value: DatapointValue) -> Result<Delivery, DeviceError> {
        let (_, kind) = self.locate(dp).ok_or(DeviceError::UnknownDatapoint(dp))?;
        let state = kind.interpret_write(dp, &value)?;
        self.write_state(dp, state).await
    }

    /// Send `state` to a mapped dp and cache it once acknowledged
    async fn write_state(&mut self, dp: u8, state: StateValue) -> Result<Delivery, DeviceError> {
        let (gang, kind) = self.locate(dp).ok_or(DeviceError::UnknownDatapoint(dp))?;
        let value = kind.encode(dp, &state)?;
        let delivery = self
            .sender
            .send(&mut self.sequencer, u32::from(dp), kind.datatype(), &value)
            .await?;
        if self.commit_local(gang, dp, state) {
            self.persist().await;
        }
        Ok(delivery)
    }

    /// Write issued from a timer; failures become events
    async fn deferred_write(&mut self, dp: u8, state: StateValue) -> bool {
        match self.write_state(dp, state).await {
            Ok(_) => true,
            Err(DeviceError::Send(error)) => {
                let _ = self.events.send(DeviceEvent::CommandFailed {
                    address: self.address,
                    dp,
                    error,
                });
                false
            }
            Err(e) => {
                tracing::warn!("Deferred write to dp {} rejected: {}", dp, e);
                false
            }
        }
    }

    fn commit_local(&mut self, gang: usize, dp: u8, state: StateValue) -> bool {
        match self.gangs[gang].record_local(dp, state) {
            ApplyOutcome::Applied(transitions) => self.publish(gang, transitions),
            ApplyOutcome::NotOwned => false,
        }
    }

    /// Broadcast changed transitions; true if any
    fn publish(&self, gang: usize, transitions: Vec<Transition>) -> bool {
        let mut changed = false;
        for transition in transitions.into_iter().filter(|t| t.changed) {
            changed = true;
            let _ = self.events.send(DeviceEvent::StateChanged {
                address: self.address,
                gang,
                transition,
            });
        }
        changed
    }

    fn publish_report(&self, report: RecoveryReport) {
        let _ = self.events.send(DeviceEvent::RecoveryCompleted {
            address: self.address,
            report,
        });
    }

    fn controls(&self, gang: usize) -> Result<GangControls, DeviceError> {
        self.profile
            .gangs
            .get(gang)
            .map(|g| g.controls.clone())
            .ok_or(DeviceError::UnknownGang(gang))
    }

    fn cached(&self, dp: u8) -> Option<&StateValue> {
        self.gangs.iter().find_map(|engine| engine.get(dp))
    }

    fn locate(&self, dp: u8) -> Option<(usize, DatapointKind)> {
        self.gangs
            .iter()
            .enumerate()
            .find_map(|(gang, engine)| engine.kind(dp).map(|kind| (gang, kind.clone())))
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            address: self.address,
            product: self.profile.name.clone(),
            gangs: self.gangs.iter().map(ReconcileEngine::snapshot).collect(),
            online: self.online,
            syncing: self.recovery.is_active(),
        }
    }

    async fn persist(&self) {
        if let Some(dir) = &self.state_dir {
            if let Err(e) = persistence::save_snapshot(dir, &self.snapshot()).await {
                tracing::warn!("Failed to save state for {:#06x}: {}", self.address, e);
            }
        }
    }

    async fn stop(&mut self) {
        self.debounce.cancel_all();
        self.siren_restore.cancel_all();
        self.recovery.cancel();
        self.persist().await;
        tracing::info!("Device actor {:#06x} stopped", self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::StateKey;
    use tuya_protocol::{CommandId, DataType, Frame, MemoryTransport, TransportError};

    fn frame(dp: u8, value: DatapointValue) -> InboundEvent {
        let datatype = DataType::for_value(&value);
        InboundEvent {
            command: CommandId::Reporting,
            frame: codec::encode(0, u32::from(dp), datatype, &value).unwrap(),
        }
    }

    fn fan(transport: &Arc<MemoryTransport>) -> DeviceHandle {
        DeviceHandle::spawn(
            0x1A2B,
            ProductProfile::fan_controller_3_gang(),
            Arc::clone(transport),
            CoreConfig::default(),
        )
    }

    async fn sent_values(transport: &MemoryTransport) -> Vec<(u8, DatapointValue)> {
        transport
            .sent()
            .await
            .iter()
            .map(|(_, f)| (f.dp, codec::decode(f).unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn test_inbound_updates_owning_gang() {
        let transport = Arc::new(MemoryTransport::new());
        let device = fan(&transport);
        let mut events = device.subscribe();

        device.inbound(frame(8, DatapointValue::Value(500))).unwrap();
        let snapshot = device.snapshot().await.unwrap();
        assert_eq!(snapshot.gangs[1].values.get(&8), Some(&StateValue::Ratio(0.5)));
        assert_eq!(snapshot.gangs[1].values.get(&7), Some(&StateValue::Switch(true)));
        assert!(snapshot.gangs[0].values.is_empty());

        match events.recv().await.unwrap() {
            DeviceEvent::StateChanged { gang, transition, .. } => {
                assert_eq!(gang, 1);
                assert_eq!(transition.key, StateKey::Dp(8));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_enum_raises_anomaly() {
        let transport = Arc::new(MemoryTransport::new());
        let device = fan(&transport);
        let mut events = device.subscribe();

        device.inbound(frame(14, DatapointValue::Enum(1))).unwrap();
        device.inbound(frame(14, DatapointValue::Enum(9))).unwrap();
        let snapshot = device.snapshot().await.unwrap();
        assert_eq!(
            snapshot.value(14),
            Some(&StateValue::Choice {
                code: 1,
                label: "on".into()
            })
        );

        let _ = events.recv().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            DeviceEvent::Anomaly {
                dp: 14,
                error: ReconcileError::UnknownEnumValue { dp: 14, code: 9 },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_set_switch_skips_when_state_matches() {
        let transport = Arc::new(MemoryTransport::new());
        let device = DeviceHandle::spawn(
            0x0001,
            ProductProfile::wall_switch(2).unwrap(),
            Arc::clone(&transport),
            CoreConfig::default(),
        );

        device.set_switch(1, true).await.unwrap();
        device.set_switch(1, true).await.unwrap();
        assert_eq!(sent_values(&transport).await, vec![(2, DatapointValue::Bool(true))]);
        assert_eq!(
            device.snapshot().await.unwrap().value(2),
            Some(&StateValue::Switch(true))
        );
        assert!(matches!(
            device.set_switch(5, true).await,
            Err(DeviceError::UnknownGang(5))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_leaves_state_unchanged() {
        let transport = Arc::new(MemoryTransport::new());
        transport.set_fallback(Err(TransportError::Timeout)).await;
        let device = DeviceHandle::spawn(
            0x0001,
            ProductProfile::wall_switch(1).unwrap(),
            Arc::clone(&transport),
            CoreConfig::default(),
        );

        let result = device.set_switch(0, true).await;
        assert!(matches!(
            result,
            Err(DeviceError::Send(SendError::SendExhausted { dp: 1, attempts: 2, .. }))
        ));
        assert_eq!(device.snapshot().await.unwrap().value(1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_level_debounce_from_stopped() {
        let transport = Arc::new(MemoryTransport::new());
        let device = fan(&transport);

        for level in [0.2, 0.5, 0.8] {
            device.set_level(0, level).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(transport.sent().await.is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(
            sent_values(&transport).await,
            vec![(1, DatapointValue::Bool(true)), (2, DatapointValue::Value(800))]
        );
        let snapshot = device.snapshot().await.unwrap();
        assert_eq!(snapshot.value(2), Some(&StateValue::Ratio(0.8)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_off_cancels_pending_level() {
        let transport = Arc::new(MemoryTransport::new());
        let device = fan(&transport);
        device.inbound(frame(2, DatapointValue::Value(400))).unwrap();

        device.set_level(0, 0.9).await.unwrap();
        device.set_switch(0, false).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(
            sent_values(&transport).await,
            vec![(1, DatapointValue::Bool(false)), (2, DatapointValue::Value(0))]
        );
    }

    #[tokio::test]
    async fn test_invalid_level_rejected() {
        let transport = Arc::new(MemoryTransport::new());
        let device = fan(&transport);
        assert!(matches!(
            device.set_level(0, 1.5).await,
            Err(DeviceError::InvalidLevel(_))
        ));
        assert!(matches!(
            device.set_level_limits(0, 0.6, 0.4).await,
            Err(DeviceError::InvalidLimits { .. })
        ));
    }

    #[tokio::test]
    async fn test_select_by_label() {
        let transport = Arc::new(MemoryTransport::new());
        let device = DeviceHandle::spawn(
            0x0042,
            ProductProfile::siren(),
            Arc::clone(&transport),
            CoreConfig::default(),
        );

        device.select(21, "School Bell").await.unwrap();
        assert_eq!(sent_values(&transport).await, vec![(21, DatapointValue::Enum(17))]);
        assert!(matches!(
            device.select(5, "deafening").await,
            Err(DeviceError::UnknownOption { dp: 5, .. })
        ));
        assert!(matches!(
            device.set_power_on_behavior(PowerOnBehavior::On).await,
            Err(DeviceError::UnsupportedControl { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_reencodes_mapped_dp() {
        let transport = Arc::new(MemoryTransport::new());
        let device = fan(&transport);

        device.write_value(1, 1).await.unwrap();
        device.write_raw(99, Bytes::from_static(&[0xAA])).await.unwrap();
        let sent = transport.sent().await;
        assert_eq!(sent[0].1.datatype, DataType::Bool);
        assert_eq!(
            sent[1].1,
            Frame::new(1, 99, DataType::Raw, Bytes::from_static(&[0xAA]))
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_actor() {
        let transport = Arc::new(MemoryTransport::new());
        let device = fan(&transport);
        device.shutdown().await.unwrap();
        assert!(matches!(
            device.snapshot().await,
            Err(DeviceError::NotRunning)
        ));
        assert!(matches!(device.shutdown().await, Err(DeviceError::NotRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_level_change_while_running_uses_steady_delay() {
        let transport = Arc::new(MemoryTransport::new());
        let device = fan(&transport);
        device.inbound(frame(1, DatapointValue::Bool(true))).unwrap();
        device.inbound(frame(2, DatapointValue::Value(400))).unwrap();
        device.snapshot().await.unwrap();

        device.set_level(0, 0.6).await.unwrap();
        tokio::time::sleep(Duration::from_millis(799)).await;
        assert!(transport.sent().await.is_empty());

        tokio::time::sleep(Duration::from_millis(51)).await;
        assert_eq!(sent_values(&transport).await, vec![(2, DatapointValue::Value(600))]);
    }

    #[tokio::test]
    async fn test_write_rejects_level_above_scale() {
        let transport = Arc::new(MemoryTransport::new());
        let device = fan(&transport);

        assert!(matches!(
            device.write_value(2, 1500).await,
            Err(DeviceError::InvalidValue(ReconcileError::OutOfRange {
                dp: 2,
                value: 1500
            }))
        ));
        assert!(transport.sent().await.is_empty());
        assert_eq!(device.snapshot().await.unwrap().value(2), None);
    }

    #[tokio::test]
    async fn test_bulk_validates_mapped_dps() {
        let transport = Arc::new(MemoryTransport::new());
        let device = fan(&transport);

        let results = device
            .write_bulk(
                vec![
                    DatapointCommand::new(8, DatapointValue::Bool(true)),
                    DatapointCommand::new(9, DatapointValue::Value(5000)),
                    DatapointCommand::new(9, DatapointValue::Value(400)),
                    DatapointCommand::new(99, DatapointValue::Raw(Bytes::from_static(&[0x01]))),
                ],
                Some(Duration::ZERO),
            )
            .await
            .unwrap();

        assert!(matches!(
            results[0],
            Err(DeviceError::InvalidValue(ReconcileError::UnexpectedValue { dp: 8, .. }))
        ));
        assert!(matches!(
            results[1],
            Err(DeviceError::InvalidValue(ReconcileError::OutOfRange { dp: 9, value: 5000 }))
        ));
        assert!(results[2].is_ok());
        assert!(results[3].is_ok());
        assert_eq!(
            sent_values(&transport).await,
            vec![
                (9, DatapointValue::Value(400)),
                (99, DatapointValue::Raw(Bytes::from_static(&[0x01])))
            ]
        );

        let snapshot = device.snapshot().await.unwrap();
        assert_eq!(snapshot.value(8), None);
        assert_eq!(snapshot.value(9), Some(&StateValue::Ratio(0.4)));
    }

    fn siren(transport: &Arc<MemoryTransport>) -> DeviceHandle {
        DeviceHandle::spawn(
            0x0042,
            ProductProfile::siren(),
            Arc::clone(transport),
            CoreConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_siren_configures_then_sounds() {
        let transport = Arc::new(MemoryTransport::new());
        let device = siren(&transport);

        let start = tokio::time::Instant::now();
        device.start_siren().await.unwrap();
        assert!(start.elapsed() >= SIREN_SETTLE);
        assert_eq!(
            sent_values(&transport).await,
            vec![
                (21, DatapointValue::Enum(5)),
                (5, DatapointValue::Enum(2)),
                (7, DatapointValue::Value(10)),
                (13, DatapointValue::Bool(true)),
            ]
        );

        device.stop_siren().await.unwrap();
        assert_eq!(
            device.snapshot().await.unwrap().value(13),
            Some(&StateValue::Switch(false))
        );
        assert!(matches!(
            fan(&transport).start_siren().await,
            Err(DeviceError::UnsupportedControl { control: "siren", .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_test_beep_restores_previous_settings() {
        let transport = Arc::new(MemoryTransport::new());
        let device = siren(&transport);
        device.inbound(frame(21, DatapointValue::Enum(3))).unwrap();
        device.inbound(frame(5, DatapointValue::Enum(0))).unwrap();
        device.inbound(frame(7, DatapointValue::Value(30))).unwrap();

        device.play_test_beep().await.unwrap();
        let beep = vec![
            (21, DatapointValue::Enum(1)),
            (5, DatapointValue::Enum(1)),
            (7, DatapointValue::Value(2)),
            (13, DatapointValue::Bool(true)),
        ];
        assert_eq!(sent_values(&transport).await, beep);

        // Second beep before the restore keeps the original settings
        tokio::time::sleep(Duration::from_secs(1)).await;
        device.play_test_beep().await.unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;

        let sent = sent_values(&transport).await;
        assert_eq!(sent.len(), 11);
        assert_eq!(&sent[4..8], beep.as_slice());
        assert_eq!(
            &sent[8..],
            &[
                (21, DatapointValue::Enum(3)),
                (5, DatapointValue::Enum(0)),
                (7, DatapointValue::Value(30)),
            ]
        );
        assert!(matches!(
            device.snapshot().await.unwrap().value(21),
            Some(StateValue::Choice { code: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_power_on_behavior() {
        let transport = Arc::new(MemoryTransport::new());
        let device = fan(&transport);

        device.sync_power_on_behavior().await.unwrap();
        device.inbound(frame(14, DatapointValue::Enum(0))).unwrap();
        device.sync_power_on_behavior().await.unwrap();
        assert_eq!(
            sent_values(&transport).await,
            vec![(14, DatapointValue::Enum(2)), (14, DatapointValue::Enum(0))]
        );

        let six = DeviceHandle::spawn(
            0x0006,
            ProductProfile::wall_switch(6).unwrap(),
            Arc::clone(&transport),
            CoreConfig::default(),
        );
        assert!(matches!(
            six.sync_power_on_behavior().await,
            Err(DeviceError::UnsupportedControl { .. })
        ));
    }
}
