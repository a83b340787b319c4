//! Runner configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runner configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Presentation-time step between generated frames (µs).
    /// Override: `RIVULET_PTS_STEP_US`
    pub pts_step_us: u64,

    /// Cadence of the source filter (ms). The source runs in SERVER role
    /// and emits one frame per tick.
    /// Override: `RIVULET_FRAME_TIME_MS`
    pub frame_time_ms: u64,

    /// Payload bytes per generated frame.
    pub payload_len: usize,

    /// Slots per connection queue.
    pub queue_slots: usize,

    /// Number of sink filters sharing the pipeline output (1 = plain tail,
    /// more exercises reader sharing).
    pub sinks: usize,

    /// Seconds between state reports in the log (0 disables them).
    pub report_interval_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            pts_step_us: 20_000,
            frame_time_ms: 20,
            payload_len: 1024,
            queue_slots: 64,
            sinks: 1,
            report_interval_secs: 10,
        }
    }
}

impl RunnerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("RIVULET_PTS_STEP_US") {
            if let Ok(step) = val.parse() {
                self.pts_step_us = step;
            }
        }

        if let Ok(val) = std::env::var("RIVULET_FRAME_TIME_MS") {
            if let Ok(ms) = val.parse() {
                self.frame_time_ms = ms;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.pts_step_us == 0 {
            anyhow::bail!("pts_step_us must be >= 1");
        }
        if self.queue_slots == 0 {
            anyhow::bail!("queue_slots must be >= 1");
        }
        if self.sinks == 0 {
            anyhow::bail!("sinks must be >= 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RunnerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn yaml_overrides_defaults() {
        let config: RunnerConfig =
            serde_yaml::from_str("pts_step_us: 5000\nsinks: 2\n").unwrap();
        assert_eq!(config.pts_step_us, 5000);
        assert_eq!(config.sinks, 2);
        assert_eq!(config.queue_slots, RunnerConfig::default().queue_slots);
    }
}
