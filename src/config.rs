//! Server configuration.
//!
//! Capacities here size the fixed shared region at startup; nothing grows
//! afterwards, so a bad value fails validation instead of surfacing later as
//! an allocation.

use crate::dsp::window::WindowKind;
use crate::wf::shmem::StorageMode;
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Receiver channel capacity (`MAX_RX_CHANS`).
    pub rx_channels: usize,
    /// Transform context capacity (`MAX_WF_CHANS`), at most `rx_channels`.
    pub wf_channels: usize,
    pub storage: StorageMode,
    pub window: WindowKind,
    /// Default compression setting for newly activated channels.
    pub compression: bool,
    pub sample_rate_hz: f32,
    /// Fractional spacing undershoot tolerated before overlapped sampling
    /// latches.
    pub overlap_tolerance: f32,
    pub mindb: i32,
    pub maxdb: i32,
    /// Bounded egress queue depth per server.
    pub egress_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rx_channels: 8,
            wf_channels: 4,
            storage: StorageMode::InProcess,
            window: WindowKind::Hann,
            compression: true,
            sample_rate_hz: 12_000.0,
            overlap_tolerance: 0.25,
            mindb: -160,
            maxdb: -20,
            egress_capacity: 64,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.rx_channels > 0, "rx_channels must be positive");
        ensure!(
            (1..=self.rx_channels).contains(&self.wf_channels),
            "wf_channels must be in 1..={}",
            self.rx_channels
        );
        ensure!(self.sample_rate_hz > 0.0, "sample_rate_hz must be positive");
        ensure!(
            (0.0..1.0).contains(&self.overlap_tolerance),
            "overlap_tolerance must be in [0, 1)"
        );
        ensure!(self.maxdb > self.mindb, "maxdb must exceed mindb");
        ensure!(self.egress_capacity > 0, "egress_capacity must be positive");
        Ok(())
    }

    /// Load from a JSON file, falling back to defaults when the file is
    /// absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_fills_from_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{ "wf_channels": 2, "storage": "shared_segment" }"#).unwrap();
        assert_eq!(config.wf_channels, 2);
        assert_eq!(config.storage, StorageMode::SharedSegment);
        assert_eq!(config.rx_channels, ServerConfig::default().rx_channels);
        config.validate().unwrap();
    }

    #[test]
    fn more_transforms_than_channels_is_rejected() {
        let config = ServerConfig {
            rx_channels: 2,
            wf_channels: 4,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_db_range_is_rejected() {
        let config = ServerConfig {
            mindb: -20,
            maxdb: -160,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
