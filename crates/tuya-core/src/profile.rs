//! Product profiles
//!
//! Static datapoint assignment tables. A gang is one parameterized instance
//! of the generic device state machine: its dp set, how each dp is
//! interpreted and which dps drive its on/off and level controls.

use crate::error::ConfigError;
use crate::reconcile::{Cascade, ChoiceOption, DatapointKind};
use crate::recovery::CompletionPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tuya_protocol::DatapointValue;

/// Profile validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("Profile {0} has no gangs")]
    NoGangs(String),

    #[error("dp {dp} is owned by gangs {first} and {second}")]
    SharedDatapoint { dp: u8, first: usize, second: usize },

    #[error("Gang {gang} references dp {dp} it does not own")]
    ForeignDatapoint { gang: usize, dp: u8 },

    #[error("dp {0} is not owned by any gang")]
    UnownedDatapoint(u8),
}

/// Which dps drive a gang's controls
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GangControls {
    pub switch: Option<u8>,
    pub level: Option<u8>,
    pub min_level: Option<u8>,
    pub max_level: Option<u8>,
    /// Level written when switching on from a stopped state
    pub startup_level: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GangProfile {
    pub name: String,
    pub datapoints: BTreeMap<u8, DatapointKind>,
    #[serde(default)]
    pub cascades: Vec<Cascade>,
    #[serde(default)]
    pub controls: GangControls,
}

/// Recovery window configuration for a product class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryProfile {
    pub expected: BTreeSet<u8>,
    pub policy: CompletionPolicy,
    pub timeout_ms: u64,
}

impl RecoveryProfile {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Alarm sound configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SirenSettings {
    pub melody: u8,
    pub volume: u8,
    pub duration_s: u32,
}

impl SirenSettings {
    /// Fur Elise at medium volume for 2 s
    pub const TEST_BEEP: SirenSettings = SirenSettings {
        melody: 1,
        volume: 1,
        duration_s: 2,
    };
}

/// Which dps configure and trigger a siren
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SirenControls {
    pub alarm_dp: u8,
    pub melody_dp: u8,
    pub volume_dp: u8,
    pub duration_dp: u8,
    /// Used for settings the device has not reported yet
    pub defaults: SirenSettings,
}

impl SirenControls {
    /// Writes that configure `settings`, in the order the device expects
    #[must_use]
    pub fn writes(&self, settings: SirenSettings) -> [(u8, DatapointValue); 3] {
        [
            (self.melody_dp, DatapointValue::Enum(settings.melody)),
            (self.volume_dp, DatapointValue::Enum(settings.volume)),
            (self.duration_dp, DatapointValue::Value(settings.duration_s)),
        ]
    }

    fn datapoints(&self) -> [u8; 4] {
        [self.alarm_dp, self.melody_dp, self.volume_dp, self.duration_dp]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductProfile {
    pub name: String,
    pub gangs: Vec<GangProfile>,
    pub recovery: RecoveryProfile,
    /// Power-on behavior dp, owned by the first gang
    #[serde(default)]
    pub power_on_dp: Option<u8>,
    #[serde(default)]
    pub siren: Option<SirenControls>,
}

/// Relay state after mains power returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PowerOnBehavior {
    Off = 0,
    On = 1,
    Memory = 2,
}

impl PowerOnBehavior {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            PowerOnBehavior::Off => "off",
            PowerOnBehavior::On => "on",
            PowerOnBehavior::Memory => "memory",
        }
    }

    #[must_use]
    pub fn options() -> Vec<ChoiceOption> {
        [PowerOnBehavior::Off, PowerOnBehavior::On, PowerOnBehavior::Memory]
            .iter()
            .map(|b| ChoiceOption::new(*b as u8, b.label()))
            .collect()
    }
}

impl TryFrom<u8> for PowerOnBehavior {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(PowerOnBehavior::Off),
            1 => Ok(PowerOnBehavior::On),
            2 => Ok(PowerOnBehavior::Memory),
            v => Err(v),
        }
    }
}

const GANG_NAMES: [&str; 6] = ["Gang 1", "Gang 2", "Gang 3", "Gang 4", "Gang 5", "Gang 6"];

const POWER_ON_DP: u8 = 14;
const BACKLIGHT_DP: u8 = 21;
const FAN_LEVEL_SCALE: u32 = 1000;

const MELODIES: [&str; 18] = [
    "Doorbell Chime",
    "Fur Elise",
    "Westminster Chimes",
    "Fast double door bell",
    "William Tell Overture",
    "Turkish March",
    "Safe/Security Alarm",
    "Chemical Spill Alert",
    "Piercing Alarm Clock",
    "Smoke Alarm",
    "Dog Barking",
    "Police Siren",
    "Doorbell Chime (reverb)",
    "Mechanical Telephone",
    "Fire/Ambulance",
    "3/1 Elevator",
    "Buzzing Alarm Clock",
    "School Bell",
];

impl ProductProfile {
    /// Multi-gang wall switch driven entirely over Tuya datapoints: gang `i`
    /// owns dp `i`
    ///
    /// The 4 and 6 gang Zemismart models ship this way. Smaller counts
    /// describe DP-only firmwares with the same layout; switches that expose
    /// their relays on the standard on/off cluster are out of scope. dp 14
    /// (power-on behavior) exists up to 4 gangs. Returns `None` outside
    /// 1..=6 gangs.
    #[must_use]
    pub fn wall_switch(gangs: u8) -> Option<Self> {
        if !(1..=6).contains(&gangs) {
            return None;
        }
        let has_power_on = gangs <= 4;

        let gang_profiles = (1..=gangs)
            .map(|dp| {
                let mut datapoints = BTreeMap::from([(dp, DatapointKind::Switch)]);
                if dp == 1 && has_power_on {
                    datapoints.insert(
                        POWER_ON_DP,
                        DatapointKind::Choice {
                            options: PowerOnBehavior::options(),
                        },
                    );
                }
                GangProfile {
                    name: GANG_NAMES[usize::from(dp - 1)].to_string(),
                    datapoints,
                    cascades: Vec::new(),
                    controls: GangControls {
                        switch: Some(dp),
                        ..GangControls::default()
                    },
                }
            })
            .collect();

        Some(Self {
            name: format!("wall_switch_{gangs}_gang"),
            gangs: gang_profiles,
            recovery: RecoveryProfile {
                expected: (1..=gangs).collect(),
                policy: CompletionPolicy::FullCoverage,
                timeout_ms: 10_000,
            },
            power_on_dp: has_power_on.then_some(POWER_ON_DP),
            siren: None,
        })
    }

    /// 3-gang fan controller with per-gang speed and speed limits
    #[must_use]
    pub fn fan_controller_3_gang() -> Self {
        let level = DatapointKind::Level {
            scale: FAN_LEVEL_SCALE,
        };

        let gangs = [(1u8, 2u8, 3u8, 5u8), (7, 8, 9, 11), (15, 16, 17, 19)]
            .iter()
            .enumerate()
            .map(|(i, &(on_off, speed, min, max))| {
                let mut datapoints = BTreeMap::from([
                    (on_off, DatapointKind::Switch),
                    (speed, level.clone()),
                    (min, level.clone()),
                    (max, level.clone()),
                ]);
                if i == 0 {
                    datapoints.insert(
                        POWER_ON_DP,
                        DatapointKind::Choice {
                            options: PowerOnBehavior::options(),
                        },
                    );
                    datapoints.insert(
                        BACKLIGHT_DP,
                        DatapointKind::Choice {
                            options: vec![
                                ChoiceOption::new(0, "off"),
                                ChoiceOption::new(1, "normal"),
                                ChoiceOption::new(2, "inverted"),
                            ],
                        },
                    );
                }
                GangProfile {
                    name: format!("Fan {}", GANG_NAMES[i]),
                    datapoints,
                    cascades: vec![Cascade::LevelImpliesSwitch {
                        level_dp: speed,
                        switch_dp: on_off,
                    }],
                    controls: GangControls {
                        switch: Some(on_off),
                        level: Some(speed),
                        min_level: Some(min),
                        max_level: Some(max),
                        startup_level: Some(0.1),
                    },
                }
            })
            .collect();

        Self {
            name: "fan_controller_3_gang".to_string(),
            gangs,
            recovery: RecoveryProfile {
                expected: BTreeSet::from([1, 2, 7, 8, 15, 16]),
                policy: CompletionPolicy::AtLeast(4),
                timeout_ms: 8_000,
            },
            power_on_dp: Some(POWER_ON_DP),
            siren: None,
        }
    }

    /// Battery siren with volume, duration and melody settings
    #[must_use]
    pub fn siren() -> Self {
        let datapoints = BTreeMap::from([
            (
                5,
                DatapointKind::Choice {
                    options: vec![
                        ChoiceOption::new(0, "low"),
                        ChoiceOption::new(1, "medium"),
                        ChoiceOption::new(2, "high"),
                    ],
                },
            ),
            (7, DatapointKind::Number),
            (13, DatapointKind::Switch),
            (15, DatapointKind::Percentage),
            (
                21,
                DatapointKind::Choice {
                    options: (0u8..)
                        .zip(MELODIES)
                        .map(|(code, label)| ChoiceOption::new(code, label))
                        .collect(),
                },
            ),
        ]);

        Self {
            name: "siren".to_string(),
            gangs: vec![GangProfile {
                name: "Siren".to_string(),
                datapoints,
                cascades: vec![Cascade::BatteryLow { battery_dp: 15 }],
                controls: GangControls {
                    switch: Some(13),
                    ..GangControls::default()
                },
            }],
            recovery: RecoveryProfile {
                expected: BTreeSet::from([5, 7, 13, 21]),
                policy: CompletionPolicy::FullCoverage,
                timeout_ms: 10_000,
            },
            power_on_dp: None,
            siren: Some(SirenControls {
                alarm_dp: 13,
                melody_dp: 21,
                volume_dp: 5,
                duration_dp: 7,
                // Turkish March, high, 10 s
                defaults: SirenSettings {
                    melody: 5,
                    volume: 2,
                    duration_s: 10,
                },
            }),
        }
    }

    /// Load a profile from a JSON file
    #[allow(clippy::missing_errors_doc)]
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Gang that owns `dp`
    #[must_use]
    pub fn gang_for_dp(&self, dp: u8) -> Option<usize> {
        self.gangs.iter().position(|g| g.datapoints.contains_key(&dp))
    }

    /// Check ownership is disjoint and every reference points at an owned dp
    #[allow(clippy::missing_errors_doc)]
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.gangs.is_empty() {
            return Err(ProfileError::NoGangs(self.name.clone()));
        }

        let mut owner: BTreeMap<u8, usize> = BTreeMap::new();
        for (gang, profile) in self.gangs.iter().enumerate() {
            for dp in profile.datapoints.keys() {
                if let Some(first) = owner.insert(*dp, gang) {
                    return Err(ProfileError::SharedDatapoint {
                        dp: *dp,
                        first,
                        second: gang,
                    });
                }
            }

            let controls = &profile.controls;
            let referenced = [
                controls.switch,
                controls.level,
                controls.min_level,
                controls.max_level,
            ]
            .into_iter()
            .flatten()
            .chain(profile.cascades.iter().flat_map(|c| match c {
                Cascade::LevelImpliesSwitch {
                    level_dp,
                    switch_dp,
                } => vec![*level_dp, *switch_dp],
                Cascade::BatteryLow { battery_dp } => vec![*battery_dp],
            }));
            for dp in referenced {
                if !profile.datapoints.contains_key(&dp) {
                    return Err(ProfileError::ForeignDatapoint { gang, dp });
                }
            }
        }

        if let Some(dp) = self.power_on_dp {
            if owner.get(&dp) != Some(&0) {
                return Err(ProfileError::ForeignDatapoint { gang: 0, dp });
            }
        }
        if let Some(siren) = &self.siren {
            if let Some(dp) = siren.datapoints().into_iter().find(|dp| !owner.contains_key(dp)) {
                return Err(ProfileError::UnownedDatapoint(dp));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_profiles_validate() {
        for gangs in 1..=6 {
            ProductProfile::wall_switch(gangs).unwrap().validate().unwrap();
        }
        ProductProfile::fan_controller_3_gang().validate().unwrap();
        ProductProfile::siren().validate().unwrap();
        assert!(ProductProfile::wall_switch(0).is_none());
        assert!(ProductProfile::wall_switch(7).is_none());
    }

    #[test]
    fn test_wall_switch_layout() {
        let four = ProductProfile::wall_switch(4).unwrap();
        assert_eq!(four.gangs.len(), 4);
        assert_eq!(four.gang_for_dp(3), Some(2));
        assert_eq!(four.gang_for_dp(14), Some(0));
        assert_eq!(four.recovery.expected, BTreeSet::from([1, 2, 3, 4]));
        assert_eq!(four.recovery.policy, CompletionPolicy::FullCoverage);

        let six = ProductProfile::wall_switch(6).unwrap();
        assert_eq!(six.power_on_dp, None);
        assert_eq!(six.gang_for_dp(14), None);
    }

    #[test]
    fn test_fan_gang_ownership() {
        let fan = ProductProfile::fan_controller_3_gang();
        let second: Vec<u8> = fan.gangs[1].datapoints.keys().copied().collect();
        assert_eq!(second, vec![7, 8, 9, 11]);
        assert_eq!(fan.gang_for_dp(21), Some(0));
        assert_eq!(fan.recovery.policy, CompletionPolicy::AtLeast(4));
    }

    #[test]
    fn test_siren_melodies() {
        let siren = ProductProfile::siren();
        let melody = &siren.gangs[0].datapoints[&21];
        assert_eq!(melody.options().len(), 18);
        assert_eq!(melody.options()[17].label, "School Bell");
    }

    #[test]
    fn test_shared_dp_rejected() {
        let mut fan = ProductProfile::fan_controller_3_gang();
        fan.gangs[1].datapoints.insert(1, DatapointKind::Switch);
        assert_eq!(
            fan.validate(),
            Err(ProfileError::SharedDatapoint {
                dp: 1,
                first: 0,
                second: 1
            })
        );
    }

    #[test]
    fn test_siren_controls_must_be_owned() {
        let mut siren = ProductProfile::siren();
        if let Some(controls) = siren.siren.as_mut() {
            controls.duration_dp = 40;
        }
        assert_eq!(siren.validate(), Err(ProfileError::UnownedDatapoint(40)));

        let controls = ProductProfile::siren().siren.unwrap();
        assert_eq!(
            controls.writes(SirenSettings::TEST_BEEP),
            [
                (21, DatapointValue::Enum(1)),
                (5, DatapointValue::Enum(1)),
                (7, DatapointValue::Value(2)),
            ]
        );
    }

    #[test]
    fn test_small_wall_switch_is_datapoint_only() {
        let two = ProductProfile::wall_switch(2).unwrap();
        assert_eq!(two.power_on_dp, Some(14));
        assert_eq!(two.gangs[1].controls.switch, Some(2));
        assert!(two.siren.is_none());
    }

    #[test]
    fn test_profile_json_roundtrip() {
        let fan = ProductProfile::fan_controller_3_gang();
        let json = serde_json::to_string(&fan).unwrap();
        let parsed: ProductProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, fan);

        let siren = ProductProfile::siren();
        let json = serde_json::to_string(&siren).unwrap();
        assert_eq!(serde_json::from_str::<ProductProfile>(&json).unwrap(), siren);
    }

    #[test]
    fn test_power_on_behavior_conversion() {
        assert_eq!(PowerOnBehavior::try_from(2), Ok(PowerOnBehavior::Memory));
        assert_eq!(PowerOnBehavior::try_from(3), Err(3));
        assert_eq!(PowerOnBehavior::options()[1].label, "on");
    }
}
