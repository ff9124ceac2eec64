//! Replay configuration
//!
//! Clock, scheduler and bus knobs, loaded from TOML.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Replay run configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Jump the virtual clock while every unit is idle instead of waiting
    #[serde(default = "default_jump_enabled")]
    pub jump_enabled: bool,

    /// Upper bound on one blocking slice of a clock wait (ms)
    #[serde(default = "default_wait_slice_ms")]
    pub wait_slice_ms: u64,

    /// Prefix for bus delivery thread names
    #[serde(default = "default_worker_name_prefix")]
    pub worker_name_prefix: String,

    /// Poll interval used while waiting for the bus to go idle (ms)
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

fn default_jump_enabled() -> bool {
    true
}
fn default_wait_slice_ms() -> u64 {
    50
}
fn default_worker_name_prefix() -> String {
    "bus".to_string()
}
fn default_idle_poll_ms() -> u64 {
    10
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            jump_enabled: default_jump_enabled(),
            wait_slice_ms: default_wait_slice_ms(),
            worker_name_prefix: default_worker_name_prefix(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

impl ReplayConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from environment or default path
    pub fn from_env() -> Self {
        let path = std::env::var("REPLAY_CONFIG_PATH")
            .unwrap_or_else(|_| "replay_config.toml".to_string());

        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default replay config ({}): {}", path, e);
            Self::default()
        })
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms.max(1))
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }
}
