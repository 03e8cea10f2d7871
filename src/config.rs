//! Engine configuration
//!
//! Every section has tuned defaults, so an empty JSON object is a valid
//! config file.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::execution::ExecutionConfig;
use crate::trading_core::breakout::BreakoutConfig;
use crate::trading_core::position::RiskConfig;

/// Snapshot persistence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Directory holding the session snapshot (default: "state")
    pub dir: PathBuf,
    /// Seconds between snapshots (default: 15)
    pub interval_secs: u64,
    /// Per-attempt write timeout (default: 5000ms)
    pub write_timeout_ms: u64,
    /// Retries after a failed or timed-out write (default: 2)
    pub max_retries: u32,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("state"),
            interval_secs: 15,
            write_timeout_ms: 5_000,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bar width in seconds (default: 5)
    pub bar_seconds: u32,
    /// Bars per instrument window, forming bar included (default: 720)
    pub window_capacity: usize,
    /// Seconds between maintenance passes: idle bar closes and position sync (default: 1)
    pub maintenance_secs: u64,
    pub breakout: BreakoutConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub snapshot: SnapshotConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bar_seconds: 5,
            window_capacity: 720,
            maintenance_secs: 1,
            breakout: BreakoutConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&raw).with_context(|| format!("Failed to parse config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// The window must hold a full candle plus its volume baseline
    pub fn validate(&self) -> Result<()> {
        if self.bar_seconds == 0 {
            bail!("bar_seconds must be at least 1");
        }
        let closed_bars = self.window_capacity.saturating_sub(1) as u64;
        let needed = self.breakout.bars_per_candle.max(1) + self.breakout.volume_lookback_bars as u64;
        if closed_bars < needed {
            bail!(
                "window_capacity {} keeps {} closed bars, breakout needs {} (bars_per_candle {} + volume_lookback_bars {})",
                self.window_capacity,
                closed_bars,
                needed,
                self.breakout.bars_per_candle,
                self.breakout.volume_lookback_bars
            );
        }
        Ok(())
    }
}
