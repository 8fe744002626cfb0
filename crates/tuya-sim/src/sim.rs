//! Simulated Tuya devices
//!
//! Each simulated device pushes `reporting` frames into the shared memory
//! transport the way real hardware announces itself after joining or
//! regaining power.

use std::sync::Arc;
use tuya_core::reconcile::DatapointKind;
use tuya_core::ProductProfile;
use tuya_protocol::{codec, CommandId, DatapointValue, MemoryTransport, Sequencer, TransportEvent};

pub struct SimulatedDevice {
    address: u16,
    profile: ProductProfile,
    transport: Arc<MemoryTransport>,
    sequencer: Sequencer,
}

impl SimulatedDevice {
    pub fn new(address: u16, profile: ProductProfile, transport: Arc<MemoryTransport>) -> Self {
        Self {
            address,
            profile,
            transport,
            sequencer: Sequencer::new(),
        }
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    /// Come online and report the recovery baseline
    pub fn power_up(&mut self) {
        tracing::info!("[sim] {:#06x} ({}) powering up", self.address, self.profile.name);
        self.transport.inject(TransportEvent::Online {
            address: self.address,
        });

        let baseline: Vec<(u8, DatapointValue)> = self
            .profile
            .recovery
            .expected
            .iter()
            .filter_map(|dp| {
                let gang = self.profile.gang_for_dp(*dp)?;
                let kind = self.profile.gangs[gang].datapoints.get(dp)?;
                Some((*dp, baseline_value(kind)))
            })
            .collect();

        for (dp, value) in baseline {
            self.report(dp, value);
        }
    }

    pub fn power_down(&self) {
        tracing::info!("[sim] {:#06x} lost power", self.address);
        self.transport.inject(TransportEvent::Offline {
            address: self.address,
        });
    }

    /// Device-initiated report for `dp`
    pub fn report(&mut self, dp: u8, value: DatapointValue) {
        let datatype = tuya_protocol::DataType::for_value(&value);
        match codec::encode(self.sequencer.next(), u32::from(dp), datatype, &value) {
            Ok(frame) => self
                .transport
                .inject_frame(self.address, CommandId::Reporting, &frame),
            Err(e) => tracing::warn!("[sim] cannot encode dp {}: {}", dp, e),
        }
    }
}

/// Plausible power-up value for a datapoint
fn baseline_value(kind: &DatapointKind) -> DatapointValue {
    match kind {
        DatapointKind::Switch => DatapointValue::Bool(false),
        DatapointKind::Level { .. } => DatapointValue::Value(0),
        DatapointKind::Choice { options } => {
            DatapointValue::Enum(options.first().map_or(0, |o| o.code))
        }
        DatapointKind::Percentage => DatapointValue::Value(100),
        DatapointKind::Number => DatapointValue::Value(10),
        DatapointKind::Text => DatapointValue::String(String::new()),
        DatapointKind::Bytes => DatapointValue::Raw(Default::default()),
    }
}
