//! Runtime configuration (spec §6.4 contract; loading/parsing is ambient
//! stack, not core). Mirrors the teacher's `SystemConfig`/sub-config
//! shape: one struct per subsystem, all `Default`, all overridable by a
//! JSON file and a handful of CLI flags.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub rtp: RtpConfig,
    pub disk_writer: DiskWriterConfig,
    pub calibrator: CalibratorConfig,
    pub monitor: MonitorConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            rtp: RtpConfig::default(),
            disk_writer: DiskWriterConfig::default(),
            calibrator: CalibratorConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpConfig {
    /// Resequence buffer depth in packets.
    pub resequence_depth: usize,
    pub sample_rate_hz: u32,
}

impl Default for RtpConfig {
    fn default() -> Self {
        Self {
            resequence_depth: 64,
            sample_rate_hz: crate::types::SAMPLE_RATE_HZ,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskWriterConfig {
    pub queue_depth: usize,
    pub num_workers: usize,
}

impl Default for DiskWriterConfig {
    fn default() -> Self {
        Self {
            queue_depth: 100,
            num_workers: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibratorConfig {
    pub bootstrap_min_detections: u32,
    pub bootstrap_min_stations: u32,
    /// Left configurable per the design notes' open question: a
    /// lab-tuned default that real deployments may need to raise.
    pub bootstrap_snr_threshold_db: f64,
    pub bootstrap_confidence_threshold: f64,
    pub narrow_window_floor_ms: f64,
    pub narrow_window_ceiling_ms: f64,
    pub intra_station_threshold_ms: f64,
}

impl Default for CalibratorConfig {
    fn default() -> Self {
        Self {
            bootstrap_min_detections: 5,
            bootstrap_min_stations: 2,
            bootstrap_snr_threshold_db: -100.0,
            bootstrap_confidence_threshold: 0.01,
            narrow_window_floor_ms: 3.0,
            narrow_window_ceiling_ms: 50.0,
            intra_station_threshold_ms: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub jitter_threshold_ms: f64,
    pub physics_threshold_ms: f64,
    pub reanchor_threshold_ms: f64,
    pub drift_alarm_ppm: f64,
    pub min_verifications_for_steady: u32,
    pub max_holdover_minutes: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            jitter_threshold_ms: 1.0,
            physics_threshold_ms: 5.0,
            reanchor_threshold_ms: 50.0,
            drift_alarm_ppm: 0.1,
            min_verifications_for_steady: 3,
            max_holdover_minutes: 10.0,
        }
    }
}

pub fn load_config(path: &Path) -> Result<SystemConfig, ConfigError> {
    if !path.exists() {
        return Ok(SystemConfig::default());
    }
    let text = std::fs::read_to_string(path)?;
    let config: SystemConfig = serde_json::from_str(&text)?;
    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<(), ConfigError> {
    let config = SystemConfig::default();
    let text = serde_json::to_string_pretty(&config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_json() {
        let config = SystemConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        let parsed: SystemConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.calibrator.bootstrap_min_detections, 5);
        assert_eq!(parsed.monitor.reanchor_threshold_ms, 50.0);
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/path/config.json")).unwrap();
        assert_eq!(config.rtp.resequence_depth, 64);
    }
}
