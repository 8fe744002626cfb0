//! State reconciliation
//!
//! Merges inbound datapoint reports into the cached state of one gang,
//! suppressing duplicates and resolving derived state as explicit
//! transitions.

use crate::config::ReconcileConfig;
use crate::error::ReconcileError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tuya_protocol::{DataType, DatapointValue, Source};

/// Reconciled value cached per datapoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StateValue {
    Switch(bool),
    /// Normalized 0..=1
    Ratio(f64),
    Number(u32),
    Choice { code: u8, label: String },
    Text(String),
    Bytes(Vec<u8>),
    /// Derived alarm
    Flag(bool),
}

impl StateValue {
    /// Equality with ratios compared within `epsilon`
    #[must_use]
    pub fn approx_eq(&self, other: &StateValue, epsilon: f64) -> bool {
        match (self, other) {
            (StateValue::Ratio(a), StateValue::Ratio(b)) => (a - b).abs() <= epsilon,
            (a, b) => a == b,
        }
    }
}

impl std::fmt::Display for StateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateValue::Switch(on) => f.write_str(if *on { "on" } else { "off" }),
            StateValue::Ratio(r) => write!(f, "{:.0}%", r * 100.0),
            StateValue::Number(n) => write!(f, "{n}"),
            StateValue::Choice { label, .. } => f.write_str(label),
            StateValue::Text(s) => write!(f, "{s:?}"),
            StateValue::Bytes(b) => write!(f, "{b:02X?}"),
            StateValue::Flag(v) => write!(f, "{v}"),
        }
    }
}

/// State that is computed rather than reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    BatteryLow,
}

/// What a transition refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKey {
    Dp(u8),
    Flag(Flag),
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateKey::Dp(dp) => write!(f, "dp {dp}"),
            StateKey::Flag(flag) => write!(f, "{flag:?}"),
        }
    }
}

/// Named enum code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub code: u8,
    pub label: String,
}

impl ChoiceOption {
    pub fn new(code: u8, label: impl Into<String>) -> Self {
        Self {
            code,
            label: label.into(),
        }
    }
}

/// How a datapoint's raw value is interpreted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatapointKind {
    /// bool, or any non-zero number
    Switch,
    /// value / scale, clamped to 0..=1
    Level { scale: u32 },
    /// Enum code mapped through a label table
    Choice { options: Vec<ChoiceOption> },
    /// 0..=100
    Percentage,
    Number,
    Text,
    Bytes,
}

impl DatapointKind {
    /// Wire datatype used when writing this datapoint
    #[must_use]
    pub fn datatype(&self) -> DataType {
        match self {
            DatapointKind::Switch => DataType::Bool,
            DatapointKind::Level { .. } | DatapointKind::Percentage | DatapointKind::Number => {
                DataType::Value
            }
            DatapointKind::Choice { .. } => DataType::Enum,
            DatapointKind::Text => DataType::String,
            DatapointKind::Bytes => DataType::Raw,
        }
    }

    /// Options of a `Choice` datapoint
    #[must_use]
    pub fn options(&self) -> &[ChoiceOption] {
        match self {
            DatapointKind::Choice { options } => options,
            _ => &[],
        }
    }

    /// Raw level for a ratio, rounded to the scale
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn level_raw(scale: u32, ratio: f64) -> u32 {
        (ratio.clamp(0.0, 1.0) * f64::from(scale)).round() as u32
    }

    /// Wire value for writing `state` to this datapoint
    #[allow(clippy::missing_errors_doc)]
    pub fn encode(&self, dp: u8, state: &StateValue) -> Result<DatapointValue, ReconcileError> {
        match (self, state) {
            (DatapointKind::Switch, StateValue::Switch(on)) => Ok(DatapointValue::Bool(*on)),
            (DatapointKind::Level { scale }, StateValue::Ratio(ratio)) => {
                Ok(DatapointValue::Value(Self::level_raw(*scale, *ratio)))
            }
            (DatapointKind::Choice { options }, StateValue::Choice { code, .. }) => {
                if options.iter().any(|o| o.code == *code) {
                    Ok(DatapointValue::Enum(*code))
                } else {
                    Err(ReconcileError::UnknownEnumValue {
                        dp,
                        code: u32::from(*code),
                    })
                }
            }
            (DatapointKind::Percentage, StateValue::Number(pct)) if *pct > 100 => {
                Err(ReconcileError::OutOfRange { dp, value: *pct })
            }
            (DatapointKind::Percentage | DatapointKind::Number, StateValue::Number(n)) => {
                Ok(DatapointValue::Value(*n))
            }
            (DatapointKind::Text, StateValue::Text(s)) => Ok(DatapointValue::String(s.clone())),
            (DatapointKind::Bytes, StateValue::Bytes(b)) => {
                Ok(DatapointValue::Raw(bytes::Bytes::copy_from_slice(b)))
            }
            (_, state) => Err(ReconcileError::UnexpectedValue {
                dp,
                value: state.to_string(),
            }),
        }
    }

    /// Interpret a decoded value
    #[allow(clippy::missing_errors_doc)]
    pub fn interpret(&self, dp: u8, value: &DatapointValue) -> Result<StateValue, ReconcileError> {
        let unexpected = || ReconcileError::UnexpectedValue {
            dp,
            value: value.to_string(),
        };

        match self {
            DatapointKind::Switch => match value {
                DatapointValue::Bool(on) => Ok(StateValue::Switch(*on)),
                other => other
                    .as_u32()
                    .map(|n| StateValue::Switch(n != 0))
                    .ok_or_else(unexpected),
            },
            DatapointKind::Level { scale } => {
                let raw = value.as_u32().ok_or_else(unexpected)?;
                let scale = f64::from((*scale).max(1));
                Ok(StateValue::Ratio((f64::from(raw) / scale).clamp(0.0, 1.0)))
            }
            DatapointKind::Choice { options } => {
                let code = value.as_u32().ok_or_else(unexpected)?;
                options
                    .iter()
                    .find(|o| u32::from(o.code) == code)
                    .map(|o| StateValue::Choice {
                        code: o.code,
                        label: o.label.clone(),
                    })
                    .ok_or(ReconcileError::UnknownEnumValue { dp, code })
            }
            DatapointKind::Percentage => {
                let pct = value.as_u32().ok_or_else(unexpected)?;
                if pct > 100 {
                    return Err(ReconcileError::OutOfRange { dp, value: pct });
                }
                Ok(StateValue::Number(pct))
            }
            DatapointKind::Number => value.as_u32().map(StateValue::Number).ok_or_else(unexpected),
            DatapointKind::Text => match value {
                DatapointValue::String(s) => Ok(StateValue::Text(s.clone())),
                _ => Err(unexpected()),
            },
            DatapointKind::Bytes => match value {
                DatapointValue::Raw(b) => Ok(StateValue::Bytes(b.to_vec())),
                _ => Err(unexpected()),
            },
        }
    }

    /// Interpret a value about to be written
    ///
    /// Stricter than [`interpret`](Self::interpret): a level above its scale
    /// is rejected instead of clamped.
    #[allow(clippy::missing_errors_doc)]
    pub fn interpret_write(&self, dp: u8, value: &DatapointValue) -> Result<StateValue, ReconcileError> {
        if let DatapointKind::Level { scale } = self {
            if let Some(raw) = value.as_u32().filter(|raw| raw > scale) {
                return Err(ReconcileError::OutOfRange { dp, value: raw });
            }
        }
        self.interpret(dp, value)
    }
}

/// Derived state rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Cascade {
    /// level > 0 means on, level == 0 means off
    LevelImpliesSwitch { level_dp: u8, switch_dp: u8 },
    /// Percentage below the configured threshold raises [`Flag::BatteryLow`]
    BatteryLow { battery_dp: u8 },
}

/// A state change (or confirmed no-op) handed to the capability layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub key: StateKey,
    pub changed: bool,
    pub old: Option<StateValue>,
    pub new: StateValue,
    pub source: Source,
    /// Produced by a cascade rule rather than a report
    pub derived: bool,
}

/// Result of applying one datapoint
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// dp belongs to another gang; nothing touched
    NotOwned,
    /// Primary transition first, then any cascades
    Applied(Vec<Transition>),
}

impl ApplyOutcome {
    /// Transitions that actually changed state
    #[must_use]
    pub fn changes(&self) -> Vec<&Transition> {
        match self {
            ApplyOutcome::NotOwned => Vec::new(),
            ApplyOutcome::Applied(transitions) => transitions.iter().filter(|t| t.changed).collect(),
        }
    }
}

/// Serializable view of one gang's cached state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GangSnapshot {
    pub values: BTreeMap<u8, StateValue>,
    #[serde(default)]
    pub flags: BTreeMap<Flag, bool>,
    #[serde(default)]
    pub last_source: Option<Source>,
}

/// Reconciliation engine for one gang
#[derive(Debug, Clone)]
pub struct ReconcileEngine {
    datapoints: BTreeMap<u8, DatapointKind>,
    cascades: Vec<Cascade>,
    config: ReconcileConfig,
    values: BTreeMap<u8, StateValue>,
    flags: BTreeMap<Flag, bool>,
    last_source: Option<Source>,
}

impl ReconcileEngine {
    #[must_use]
    pub fn new(
        datapoints: BTreeMap<u8, DatapointKind>,
        cascades: Vec<Cascade>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            datapoints,
            cascades,
            config,
            values: BTreeMap::new(),
            flags: BTreeMap::new(),
            last_source: None,
        }
    }

    #[must_use]
    pub fn owns(&self, dp: u8) -> bool {
        self.datapoints.contains_key(&dp)
    }

    #[must_use]
    pub fn kind(&self, dp: u8) -> Option<&DatapointKind> {
        self.datapoints.get(&dp)
    }

    #[must_use]
    pub fn get(&self, dp: u8) -> Option<&StateValue> {
        self.values.get(&dp)
    }

    #[must_use]
    pub fn switch(&self, dp: u8) -> Option<bool> {
        match self.values.get(&dp) {
            Some(StateValue::Switch(on)) => Some(*on),
            _ => None,
        }
    }

    #[must_use]
    pub fn ratio(&self, dp: u8) -> Option<f64> {
        match self.values.get(&dp) {
            Some(StateValue::Ratio(r)) => Some(*r),
            _ => None,
        }
    }

    #[must_use]
    pub fn flag(&self, flag: Flag) -> Option<bool> {
        self.flags.get(&flag).copied()
    }

    #[must_use]
    pub fn last_source(&self) -> Option<Source> {
        self.last_source
    }

    /// Apply an inbound datapoint
    ///
    /// Values that cannot be interpreted are returned as errors and leave
    /// the cache untouched.
    #[allow(clippy::missing_errors_doc)]
    pub fn apply(
        &mut self,
        dp: u8,
        value: &DatapointValue,
        source: Source,
    ) -> Result<ApplyOutcome, ReconcileError> {
        let Some(kind) = self.datapoints.get(&dp) else {
            return Ok(ApplyOutcome::NotOwned);
        };
        let state = kind.interpret(dp, value)?;
        Ok(ApplyOutcome::Applied(self.commit(dp, state, source)))
    }

    /// Record a write the device acknowledged
    pub fn record_local(&mut self, dp: u8, state: StateValue) -> ApplyOutcome {
        if !self.owns(dp) {
            return ApplyOutcome::NotOwned;
        }
        ApplyOutcome::Applied(self.commit(dp, state, Source::App))
    }

    /// Seed the cache from a persisted snapshot, dropping dps this gang does
    /// not own
    pub fn restore(&mut self, snapshot: GangSnapshot) {
        self.values = snapshot
            .values
            .into_iter()
            .filter(|(dp, _)| self.datapoints.contains_key(dp))
            .collect();
        self.flags = snapshot.flags;
        self.last_source = snapshot.last_source;
    }

    #[must_use]
    pub fn snapshot(&self) -> GangSnapshot {
        GangSnapshot {
            values: self.values.clone(),
            flags: self.flags.clone(),
            last_source: self.last_source,
        }
    }

    fn commit(&mut self, dp: u8, new: StateValue, source: Source) -> Vec<Transition> {
        let key = StateKey::Dp(dp);
        let old = self.values.get(&dp).cloned();

        if let Some(current) = &old {
            if current.approx_eq(&new, self.config.ratio_epsilon) {
                tracing::trace!("dp {} unchanged at {} ({})", dp, current, source);
                return vec![Transition {
                    key,
                    changed: false,
                    old: old.clone(),
                    new: current.clone(),
                    source,
                    derived: false,
                }];
            }
        }

        match &old {
            Some(current) => tracing::info!("dp {}: {} -> {} ({})", dp, current, new, source),
            None => tracing::info!("dp {}: {} ({})", dp, new, source),
        }
        self.values.insert(dp, new.clone());
        self.last_source = Some(source);

        let derived = self.derive(dp, &new);
        let mut transitions = vec![Transition {
            key,
            changed: true,
            old,
            new,
            source,
            derived: false,
        }];

        for (key, value) in derived {
            if let Some(transition) = self.set_derived(key, value, source) {
                transitions.push(transition);
            }
        }
        transitions
    }

    /// Derived values implied by a changed primary
    fn derive(&self, dp: u8, new: &StateValue) -> Vec<(StateKey, StateValue)> {
        self.cascades
            .iter()
            .filter_map(|rule| match (rule, new) {
                (
                    Cascade::LevelImpliesSwitch {
                        level_dp,
                        switch_dp,
                    },
                    StateValue::Ratio(level),
                ) if *level_dp == dp => {
                    Some((StateKey::Dp(*switch_dp), StateValue::Switch(*level > 0.0)))
                }
                (Cascade::BatteryLow { battery_dp }, StateValue::Number(pct)) if *battery_dp == dp => {
                    Some((
                        StateKey::Flag(Flag::BatteryLow),
                        StateValue::Flag(*pct < self.config.battery_low_threshold),
                    ))
                }
                _ => None,
            })
            .collect()
    }

    fn set_derived(&mut self, key: StateKey, new: StateValue, source: Source) -> Option<Transition> {
        let old = match key {
            StateKey::Dp(dp) => self.values.get(&dp).cloned(),
            StateKey::Flag(flag) => self.flags.get(&flag).map(|v| StateValue::Flag(*v)),
        };
        if old.as_ref().is_some_and(|o| o.approx_eq(&new, self.config.ratio_epsilon)) {
            return None;
        }

        tracing::info!(
            "{} derived: {} -> {}",
            key,
            old.as_ref().map_or_else(|| "unset".to_string(), ToString::to_string),
            new
        );
        match (key, &new) {
            (StateKey::Dp(dp), _) => {
                self.values.insert(dp, new.clone());
            }
            (StateKey::Flag(flag), StateValue::Flag(v)) => {
                self.flags.insert(flag, *v);
            }
            (StateKey::Flag(_), _) => return None,
        }

        Some(Transition {
            key,
            changed: true,
            old,
            new,
            source,
            derived: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fan_gang() -> ReconcileEngine {
        ReconcileEngine::new(
            BTreeMap::from([
                (1, DatapointKind::Switch),
                (2, DatapointKind::Level { scale: 1000 }),
                (
                    14,
                    DatapointKind::Choice {
                        options: vec![
                            ChoiceOption::new(0, "off"),
                            ChoiceOption::new(1, "on"),
                            ChoiceOption::new(2, "memory"),
                        ],
                    },
                ),
            ]),
            vec![Cascade::LevelImpliesSwitch {
                level_dp: 2,
                switch_dp: 1,
            }],
            ReconcileConfig::default(),
        )
    }

    #[test]
    fn test_duplicate_is_idempotent() {
        let mut engine = fan_gang();
        let first = engine
            .apply(1, &DatapointValue::Bool(true), Source::Physical)
            .unwrap();
        assert_eq!(first.changes().len(), 1);
        let after_first = engine.snapshot();

        let second = engine
            .apply(1, &DatapointValue::Bool(true), Source::Physical)
            .unwrap();
        match second {
            ApplyOutcome::Applied(transitions) => {
                assert_eq!(transitions.len(), 1);
                assert!(!transitions[0].changed);
            }
            ApplyOutcome::NotOwned => panic!("dp 1 is owned"),
        }
        assert_eq!(engine.snapshot(), after_first);
    }

    #[test]
    fn test_ratio_within_epsilon_is_duplicate() {
        let mut engine = fan_gang();
        engine.apply(2, &DatapointValue::Value(500), Source::Physical).unwrap();
        engine.record_local(2, StateValue::Ratio(0.5004));
        assert_eq!(engine.ratio(2), Some(0.5));
        let outcome = engine.record_local(2, StateValue::Ratio(0.51));
        assert_eq!(outcome.changes().len(), 1);
    }

    #[test]
    fn test_speed_to_zero_cascades_switch_off() {
        let mut engine = fan_gang();
        engine.apply(2, &DatapointValue::Value(600), Source::Physical).unwrap();
        assert_eq!(engine.switch(1), Some(true));

        let outcome = engine.apply(2, &DatapointValue::Value(0), Source::Physical).unwrap();
        let changes = outcome.changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].key, StateKey::Dp(2));
        assert_eq!(changes[0].new, StateValue::Ratio(0.0));
        assert!(!changes[0].derived);
        assert_eq!(changes[1].key, StateKey::Dp(1));
        assert_eq!(changes[1].old, Some(StateValue::Switch(true)));
        assert_eq!(changes[1].new, StateValue::Switch(false));
        assert!(changes[1].derived);
    }

    #[test]
    fn test_cascade_skipped_when_switch_agrees() {
        let mut engine = fan_gang();
        engine.apply(1, &DatapointValue::Bool(true), Source::Physical).unwrap();
        let outcome = engine.apply(2, &DatapointValue::Value(300), Source::Physical).unwrap();
        assert_eq!(outcome.changes().len(), 1);
    }

    #[test]
    fn test_ownership_scoping() {
        let mut engine = ReconcileEngine::new(
            BTreeMap::from([
                (2, DatapointKind::Level { scale: 1000 }),
                (8, DatapointKind::Level { scale: 1000 }),
                (9, DatapointKind::Level { scale: 1000 }),
                (11, DatapointKind::Level { scale: 1000 }),
            ]),
            Vec::new(),
            ReconcileConfig::default(),
        );
        let before = engine.snapshot();
        let outcome = engine.apply(1, &DatapointValue::Bool(true), Source::Physical).unwrap();
        assert_eq!(outcome, ApplyOutcome::NotOwned);
        assert_eq!(engine.snapshot(), before);
        assert_eq!(engine.record_local(1, StateValue::Switch(true)), ApplyOutcome::NotOwned);
    }

    #[test]
    fn test_unknown_enum_keeps_previous_value() {
        let mut engine = fan_gang();
        engine.apply(14, &DatapointValue::Enum(2), Source::Physical).unwrap();

        let result = engine.apply(14, &DatapointValue::Enum(7), Source::Physical);
        assert_eq!(result, Err(ReconcileError::UnknownEnumValue { dp: 14, code: 7 }));
        assert_eq!(
            engine.get(14),
            Some(&StateValue::Choice {
                code: 2,
                label: "memory".into()
            })
        );
    }

    #[test]
    fn test_switch_accepts_numeric() {
        let mut engine = fan_gang();
        engine.apply(1, &DatapointValue::Value(1), Source::App).unwrap();
        assert_eq!(engine.switch(1), Some(true));
        assert_eq!(engine.last_source(), Some(Source::App));
        let err = engine.apply(1, &DatapointValue::String("on".into()), Source::App);
        assert!(matches!(err, Err(ReconcileError::UnexpectedValue { dp: 1, .. })));
    }

    #[test]
    fn test_battery_low_cascade() {
        let mut engine = ReconcileEngine::new(
            BTreeMap::from([(15, DatapointKind::Percentage)]),
            vec![Cascade::BatteryLow { battery_dp: 15 }],
            ReconcileConfig::default(),
        );
        let outcome = engine.apply(15, &DatapointValue::Value(80), Source::Physical).unwrap();
        assert_eq!(outcome.changes().len(), 2);
        assert_eq!(engine.flag(Flag::BatteryLow), Some(false));

        engine.apply(15, &DatapointValue::Value(19), Source::Physical).unwrap();
        assert_eq!(engine.flag(Flag::BatteryLow), Some(true));

        let outcome = engine.apply(15, &DatapointValue::Value(15), Source::Physical).unwrap();
        assert_eq!(outcome.changes().len(), 1);

        assert_eq!(
            engine.apply(15, &DatapointValue::Value(120), Source::Physical),
            Err(ReconcileError::OutOfRange { dp: 15, value: 120 })
        );
        assert_eq!(engine.get(15), Some(&StateValue::Number(15)));
    }

    #[test]
    fn test_restore_drops_foreign_dps() {
        let mut engine = fan_gang();
        let snapshot = GangSnapshot {
            values: BTreeMap::from([(1, StateValue::Switch(true)), (7, StateValue::Switch(true))]),
            flags: BTreeMap::new(),
            last_source: Some(Source::Physical),
        };
        engine.restore(snapshot);
        assert_eq!(engine.switch(1), Some(true));
        assert_eq!(engine.get(7), None);
    }

    #[test]
    fn test_level_clamped_and_rounded() {
        let mut engine = fan_gang();
        engine.apply(2, &DatapointValue::Value(1500), Source::Physical).unwrap();
        assert_eq!(engine.ratio(2), Some(1.0));
        assert_eq!(DatapointKind::level_raw(1000, 0.8), 800);
        assert_eq!(DatapointKind::level_raw(1000, 1.7), 1000);
    }

    #[test]
    fn test_encode_state_for_write() {
        let level = DatapointKind::Level { scale: 1000 };
        assert_eq!(
            level.encode(2, &StateValue::Ratio(0.25)),
            Ok(DatapointValue::Value(250))
        );
        let choice = DatapointKind::Choice {
            options: vec![ChoiceOption::new(0, "off")],
        };
        assert_eq!(
            choice.encode(
                14,
                &StateValue::Choice {
                    code: 4,
                    label: "bogus".into()
                }
            ),
            Err(ReconcileError::UnknownEnumValue { dp: 14, code: 4 })
        );
        assert!(matches!(
            DatapointKind::Switch.encode(1, &StateValue::Number(1)),
            Err(ReconcileError::UnexpectedValue { dp: 1, .. })
        ));
    }

    #[test]
    fn test_write_rejects_level_above_scale() {
        let level = DatapointKind::Level { scale: 1000 };
        assert_eq!(
            level.interpret_write(2, &DatapointValue::Value(1500)),
            Err(ReconcileError::OutOfRange { dp: 2, value: 1500 })
        );
        assert_eq!(
            level.interpret_write(2, &DatapointValue::Value(1000)),
            Ok(StateValue::Ratio(1.0))
        );
        assert!(matches!(
            level.interpret_write(8, &DatapointValue::String("fast".into())),
            Err(ReconcileError::UnexpectedValue { dp: 8, .. })
        ));
    }
}
