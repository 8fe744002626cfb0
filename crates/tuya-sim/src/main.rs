//! Tuya Sim - drives simulated Tuya devices through the device layer

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tuya_core::sender::{Attempt, AttemptObserver};
use tuya_core::{
    CoreConfig, DatapointCommand, DeviceEvent, PowerOnBehavior, ProductProfile, TuyaNetwork,
};
use tuya_protocol::{DatapointValue, MemoryTransport};

mod sim;

use sim::SimulatedDevice;

const FAN_ADDRESS: u16 = 0x4F21;
const SWITCH_ADDRESS: u16 = 0x1C03;
const SIREN_ADDRESS: u16 = 0x7A10;

/// Log every device event as it happens
fn start_event_logger(mut rx: broadcast::Receiver<DeviceEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(DeviceEvent::StateChanged {
                    address,
                    gang,
                    transition,
                }) => {
                    tracing::info!(
                        "[{:#06x}] gang {} {}: {} -> {} ({}{})",
                        address,
                        gang + 1,
                        transition.key,
                        transition
                            .old
                            .as_ref()
                            .map_or_else(|| "unset".to_string(), ToString::to_string),
                        transition.new,
                        transition.source,
                        if transition.derived { ", derived" } else { "" }
                    );
                }
                Ok(DeviceEvent::RecoveryCompleted { address, report }) => {
                    tracing::info!(
                        "[{:#06x}] synchronized in {:?} with dps {:?}{}",
                        address,
                        report.duration,
                        report.received,
                        if report.by_deadline { " (timeout)" } else { "" }
                    );
                }
                Ok(DeviceEvent::CommandFailed { address, dp, error }) => {
                    tracing::warn!("[{:#06x}] deferred write to dp {} failed: {}", address, dp, error);
                }
                Ok(DeviceEvent::Anomaly { address, dp, error }) => {
                    tracing::warn!("[{:#06x}] dp {} rejected: {}", address, dp, error);
                }
                Ok(DeviceEvent::MalformedFrame { address, error }) => {
                    tracing::warn!("[{:#06x}] malformed frame: {}", address, error);
                }
                Ok(DeviceEvent::Availability { address, online }) => {
                    tracing::info!(
                        "[{:#06x}] {}",
                        address,
                        if online { "online" } else { "offline" }
                    );
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event logger lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tuya_sim=debug,tuya_core=debug,info".into()),
        )
        .init();

    tracing::info!("Starting Tuya device simulation");

    let config = CoreConfig::from_env().await?;
    if let Some(dir) = &config.state_dir {
        tracing::info!("Persisting device state under {:?}", dir);
    }

    let transport = Arc::new(MemoryTransport::new().with_echo());
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let observer: AttemptObserver = Arc::new(move |_: &Attempt| {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    let network = TuyaNetwork::new(Arc::clone(&transport), config).with_attempt_observer(observer);
    network.start_event_listener(transport.subscribe());
    start_event_logger(network.subscribe_devices());

    let fan = network
        .register(FAN_ADDRESS, ProductProfile::fan_controller_3_gang())
        .await?;
    let switch_profile = ProductProfile::wall_switch(4)
        .ok_or_else(|| anyhow::anyhow!("4-gang switch profile unavailable"))?;
    let switch = network.register(SWITCH_ADDRESS, switch_profile.clone()).await?;
    let siren = network
        .register(SIREN_ADDRESS, ProductProfile::siren())
        .await?;

    let mut sim_fan = SimulatedDevice::new(
        FAN_ADDRESS,
        ProductProfile::fan_controller_3_gang(),
        Arc::clone(&transport),
    );
    let mut sim_switch = SimulatedDevice::new(SWITCH_ADDRESS, switch_profile, Arc::clone(&transport));
    let mut sim_siren =
        SimulatedDevice::new(SIREN_ADDRESS, ProductProfile::siren(), Arc::clone(&transport));

    for device in [&mut sim_fan, &mut sim_switch, &mut sim_siren] {
        device.power_up();
        tracing::debug!("[sim] {:#06x} baseline sent", device.address());
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    fan.sync_power_on_behavior().await?;

    // Slider drag on fan gang 1: coalesced into one cold-start write
    for level in [0.2, 0.5, 0.8] {
        fan.set_level(0, level).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Physical button on fan gang 2, then app turns it off again
    sim_fan.report(8, DatapointValue::Value(650));
    tokio::time::sleep(Duration::from_millis(100)).await;
    fan.set_switch(1, false).await?;
    fan.set_level_limits(0, 0.1, 0.9).await?;
    fan.select(21, "inverted").await?;

    switch.set_power_on_behavior(PowerOnBehavior::Memory).await?;
    switch.set_switch(2, true).await?;
    let bulk = switch
        .write_bulk(
            vec![
                DatapointCommand::new(1, DatapointValue::Bool(true)),
                DatapointCommand::new(4, DatapointValue::Bool(true)),
            ],
            None,
        )
        .await?;
    tracing::info!(
        "Bulk write: {}/{} delivered",
        bulk.iter().filter(|r| r.is_ok()).count(),
        bulk.len()
    );

    siren.select(21, "Westminster Chimes").await?;
    siren.select(5, "medium").await?;
    sim_siren.report(15, DatapointValue::Value(15));
    siren.play_test_beep().await?;
    tokio::time::sleep(Duration::from_secs(4)).await;
    siren.start_siren().await?;

    // Radio drops out: the write is retried, then reported as failed
    transport.set_available(false);
    match switch.set_switch(3, true).await {
        Ok(()) => tracing::warn!("Write unexpectedly succeeded while unavailable"),
        Err(e) => tracing::info!("Write while unavailable failed as expected: {}", e),
    }
    transport.set_available(true);

    // Firmware sends a power-on code the profile does not know
    sim_fan.report(14, DatapointValue::Enum(7));

    // Power cycle the switch; recovery window reopens
    sim_switch.power_down();
    tokio::time::sleep(Duration::from_millis(100)).await;
    sim_switch.power_up();
    tokio::time::sleep(Duration::from_millis(500)).await;

    for device in [&fan, &switch, &siren] {
        let snapshot = device.snapshot().await?;
        tracing::info!(
            "Final state of {:#06x} ({}):\n{}",
            device.address(),
            device.product(),
            serde_json::to_string_pretty(&snapshot)?
        );
    }

    network.shutdown().await;
    tracing::info!(
        "Simulation complete: {} transmit attempts",
        attempts.load(Ordering::Relaxed)
    );
    Ok(())
}
