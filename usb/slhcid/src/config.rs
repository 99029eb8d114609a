//! Scheduler configuration, loaded from TOML.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sl811::bustime;

/// How hardware events reach the controller.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptMethod {
    /// The platform calls `on_hardware_event` from its interrupt handler.
    Irq,
    /// A reactor thread polls the chip.
    Polling,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub reserved_bustime: u32,
    pub extra_end_bustime: u32,
    pub max_retries: u8,
    pub overtime_is_error: bool,
    pub try_low_speed_via_hub: bool,
    /// In 2 mA units.
    pub max_current: u8,
    pub reset_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub interrupt_method: InterruptMethod,
    pub warning_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reserved_bustime: 5000,
            extra_end_bustime: 0,
            max_retries: 3,
            overtime_is_error: false,
            try_low_speed_via_hub: false,
            max_current: 50,
            reset_delay_ms: 50,
            poll_interval_ms: 1,
            interrupt_method: InterruptMethod::Irq,
            warning_interval_secs: 60,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse scheduler config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid scheduler config: {0}")]
    Invalid(&'static str),
}

impl SchedulerConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = toml::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reserved_bustime > bustime::FRAME_BUSTIME {
            return Err(ConfigError::Invalid("reserved_bustime exceeds a frame"));
        }
        if self.max_current > 250 {
            return Err(ConfigError::Invalid("max_current exceeds 500 mA"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be non-zero"));
        }
        Ok(())
    }

    /// Bus time kept free at the end of every frame.
    pub fn end_bustime(&self) -> u32 {
        bustime::end_of_frame_reserve() + self.extra_end_bustime
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn warning_interval(&self) -> Duration {
        Duration::from_secs(self.warning_interval_secs)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shipped_file_matches_defaults() {
        let config = SchedulerConfig::from_toml_bytes(include_bytes!("../slhcid.toml")).unwrap();
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn missing_keys_fall_back() {
        let config = SchedulerConfig::from_toml(
            "overtime_is_error = true\ninterrupt_method = \"polling\"\n",
        )
        .unwrap();
        assert!(config.overtime_is_error);
        assert_eq!(config.interrupt_method, InterruptMethod::Polling);
        assert_eq!(config.reserved_bustime, 5000);
        assert_eq!(config.end_bustime(), 128);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            SchedulerConfig::from_toml("reserved_bustime = 20000"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SchedulerConfig::from_toml("max_retries = \"three\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            SchedulerConfig::from_toml("no_such_key = 1"),
            Err(ConfigError::Parse(_))
        ));
    }
}
