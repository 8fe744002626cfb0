//! Runtime configuration

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retry budget for one outbound write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Wait before retry `n` is `base_delay_ms * n`
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 300,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Linear backoff after a failed `attempt` (1-based)
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay() * attempt
    }
}

/// Quiet periods for coalesced level changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceTiming {
    /// Adjusting while already running
    pub steady_ms: u64,
    /// Resuming from a fully stopped state (motor settle time)
    pub cold_start_ms: u64,
    /// Pause between switching on and writing the first level
    pub startup_settle_ms: u64,
}

impl Default for DebounceTiming {
    fn default() -> Self {
        Self {
            steady_ms: 800,
            cold_start_ms: 1500,
            startup_settle_ms: 200,
        }
    }
}

impl DebounceTiming {
    #[must_use]
    pub fn delay(&self, cold_start: bool) -> Duration {
        if cold_start {
            Duration::from_millis(self.cold_start_ms)
        } else {
            Duration::from_millis(self.steady_ms)
        }
    }

    #[must_use]
    pub fn startup_settle(&self) -> Duration {
        Duration::from_millis(self.startup_settle_ms)
    }
}

/// Reconciliation constants
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Ratios closer than this are the same value
    pub ratio_epsilon: f64,
    /// Battery percentages below this raise the low-battery flag
    pub battery_low_threshold: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            ratio_epsilon: 0.001,
            battery_low_threshold: 20,
        }
    }
}

/// Top-level configuration for the device layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub retry: RetryPolicy,
    pub debounce: DebounceTiming,
    pub reconcile: ReconcileConfig,
    /// Pause between commands of a bulk write
    pub bulk_delay_ms: u64,
    /// Directory for persisted device snapshots; `None` disables persistence
    pub state_dir: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            debounce: DebounceTiming::default(),
            reconcile: ReconcileConfig::default(),
            bulk_delay_ms: 100,
            state_dir: None,
        }
    }
}

impl CoreConfig {
    #[must_use]
    pub fn bulk_delay(&self) -> Duration {
        Duration::from_millis(self.bulk_delay_ms)
    }

    /// Load from a JSON file; missing fields fall back to defaults
    #[allow(clippy::missing_errors_doc)]
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path).await?;
        let config = serde_json::from_str(&contents)?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Configuration from the environment
    ///
    /// `TUYA_CONFIG` names a JSON file to load; `DATA_DIR` overrides the
    /// state directory.
    #[allow(clippy::missing_errors_doc)]
    pub async fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("TUYA_CONFIG") {
            Ok(path) => Self::load(Path::new(&path)).await?,
            Err(_) => Self::default(),
        };

        if let Ok(data_dir) = std::env::var("DATA_DIR") {
            config.state_dir = Some(PathBuf::from(data_dir));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay(), Duration::from_millis(300));
        assert_eq!(config.debounce.delay(true), Duration::from_millis(1500));
        assert_eq!(config.debounce.delay(false), Duration::from_millis(800));
        assert!((config.reconcile.ratio_epsilon - 0.001).abs() < f64::EPSILON);
        assert_eq!(config.reconcile.battery_low_threshold, 20);
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 300,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(300));
        assert_eq!(policy.delay_after(2), Duration::from_millis(600));
        assert_eq!(policy.delay_after(3), Duration::from_millis(900));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: CoreConfig =
            serde_json::from_str(r#"{"retry": {"max_attempts": 5}, "bulk_delay_ms": 50}"#).unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 300);
        assert_eq!(config.bulk_delay_ms, 50);
        assert_eq!(config.debounce, DebounceTiming::default());
    }
}
