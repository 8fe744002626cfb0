//! Tuya manufacturer-specific cluster command definitions

use crate::types::Source;

/// Tuya-specific cluster ID (61184)
pub const TUYA_CLUSTER_ID: u16 = 0xEF00;

/// Command IDs on the Tuya cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandId {
    /// Send a datapoint to the device
    Datapoint = 0x00,
    /// Device reports a datapoint change on its own
    Reporting = 0x01,
    /// Device responds to a command we sent
    Response = 0x02,
    /// Reporting configuration
    ReportingConfiguration = 0x06,
}

impl CommandId {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(CommandId::Datapoint),
            0x01 => Some(CommandId::Reporting),
            0x02 => Some(CommandId::Response),
            0x06 => Some(CommandId::ReportingConfiguration),
            _ => None,
        }
    }

    /// Source tag for inbound commands that carry device state
    ///
    /// Only `reporting` and `response` feed reconciliation; the remaining
    /// commands are either outbound or carry no state.
    #[must_use]
    pub fn source(&self) -> Option<Source> {
        match self {
            CommandId::Reporting => Some(Source::Physical),
            CommandId::Response => Some(Source::App),
            CommandId::Datapoint | CommandId::ReportingConfiguration => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_source_mapping() {
        assert_eq!(CommandId::Reporting.source(), Some(Source::Physical));
        assert_eq!(CommandId::Response.source(), Some(Source::App));
        assert_eq!(CommandId::Datapoint.source(), None);
        assert_eq!(CommandId::from_u8(0x06), Some(CommandId::ReportingConfiguration));
        assert_eq!(CommandId::from_u8(0x03), None);
    }
}
