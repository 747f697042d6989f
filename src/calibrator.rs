//! Timing Calibrator (C9, spec §4.9): the three-phase
//! BOOTSTRAP/CALIBRATED/VERIFIED state machine that turns a handful of
//! tone detections into a narrow, per-station search window, and shares
//! its persisted state across channel processes via an advisory-locked
//! JSON file (reload-then-merge-then-write). Grounded on
//! `original_source/src/grape_recorder/grape/timing_calibrator.py`.

use crate::config::CalibratorConfig;
use crate::error::CalibratorError;
use crate::types::{CalibrationPhase, Confidence, Station};
use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationCalibration {
    pub propagation_delay_ms: f64,
    pub propagation_delay_std_ms: f64,
    pub n_samples: u32,
    pub last_updated: f64,
    pub frequencies_contributing: Vec<u64>,
}

impl StationCalibration {
    /// `max(3, min(50, 3*std + 2))` ms, per spec §4.9's CALIBRATED
    /// search-window formula.
    pub fn search_window_ms(&self, config: &CalibratorConfig) -> f64 {
        (3.0 * self.propagation_delay_std_ms + 2.0).clamp(config.narrow_window_floor_ms, config.narrow_window_ceiling_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpCalibration {
    pub frequency_hz: u64,
    pub sample_rate: u32,
    pub reference_minute_utc: i64,
    pub reference_rtp_timestamp: u64,
    pub rtp_offset_samples: u64,
    pub calibration_snr_db: f64,
    pub calibration_confidence: f64,
    pub n_confirmations: u32,
    pub last_confirmed: f64,
    pub detected_station: Station,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CalibratorStats {
    pub bootstrap_detections: u32,
    pub verifications: u32,
    pub test_signal_verifications: u32,
    pub discrimination_corrections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibratorState {
    pub phase: CalibrationPhase,
    pub station_calibration: HashMap<Station, StationCalibration>,
    pub rtp_calibration: HashMap<String, RtpCalibration>,
    pub stats: CalibratorStats,
    pub saved_at: f64,
}

impl Default for CalibratorState {
    fn default() -> Self {
        Self {
            phase: CalibrationPhase::Bootstrap,
            station_calibration: HashMap::new(),
            rtp_calibration: HashMap::new(),
            stats: CalibratorStats::default(),
            saved_at: 0.0,
        }
    }
}

/// One accepted tone detection feeding `update_from_detection`.
pub struct Detection {
    pub channel_key: String,
    pub station: Station,
    pub frequency_hz: u64,
    pub sample_rate: u32,
    pub snr_db: f64,
    pub confidence: f64,
    pub minute_utc: i64,
    pub rtp_timestamp: u64,
    pub propagation_delay_ms: f64,
    pub is_ground_truth_minute: bool,
    pub is_test_signal: bool,
}

/// Stations whose minute numbers carry independent ground-truth
/// verification signals (BCD/FSK boundaries, station-ID), per spec
/// §4.9's VERIFIED transition.
const GROUND_TRUTH_MINUTES: [u32; 15] = [1, 2, 8, 16, 17, 19, 43, 44, 45, 46, 47, 48, 49, 50, 51];

pub struct TimingCalibrator {
    path: PathBuf,
    config: CalibratorConfig,
    state: CalibratorState,
}

impl TimingCalibrator {
    pub fn new(path: PathBuf, config: CalibratorConfig) -> Result<Self, CalibratorError> {
        let state = Self::read_locked(&path)?.unwrap_or_default();
        Ok(Self { path, config, state })
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.state.phase
    }

    pub fn state(&self) -> &CalibratorState {
        &self.state
    }

    /// `get_search_window_ms` (spec §4.9): BOOTSTRAP always searches
    /// wide; CALIBRATED/VERIFIED narrow around the station's learned
    /// propagation delay.
    pub fn get_search_window_ms(&self, station: Station) -> (f64, f64) {
        match self.state.phase {
            CalibrationPhase::Bootstrap => (500.0, 0.0),
            _ => match self.state.station_calibration.get(&station) {
                Some(cal) => (cal.search_window_ms(&self.config), cal.propagation_delay_ms),
                None => (500.0, 0.0),
            },
        }
    }

    /// `predict_station` (spec §4.9): if the channel's learned RTP
    /// offset matches the current RTP position to within the
    /// intra-station threshold, trust it unless a high-confidence
    /// disagreeing detection arrives.
    pub fn predict_station(
        &mut self,
        channel_key: &str,
        rtp_timestamp: u64,
        samples_per_minute: u64,
        detected: Option<Station>,
        detection_confidence: Confidence,
    ) -> (Station, f64) {
        let Some(cal) = self.state.rtp_calibration.get(channel_key).cloned() else {
            return (detected.unwrap_or(Station::Unknown), 0.0);
        };
        let rtp_offset_now = rtp_timestamp % samples_per_minute;
        let offset_diff_samples = rtp_offset_now.abs_diff(cal.rtp_offset_samples);
        let offset_diff_ms = offset_diff_samples as f64 / cal.sample_rate as f64 * 1000.0;

        if offset_diff_ms > self.config.intra_station_threshold_ms {
            return (detected.unwrap_or(Station::Unknown), 0.0);
        }

        let predicted_confidence = (0.5 + 0.05 * cal.n_confirmations as f64).min(0.95);
        if let Some(station) = detected {
            if station != cal.detected_station && !matches!(detection_confidence, Confidence::High) {
                self.state.stats.discrimination_corrections += 1;
                return (station, detection_confidence_to_f64(detection_confidence));
            }
        }
        (cal.detected_station, predicted_confidence)
    }

    /// `update_from_detection` (spec §4.9's "update protocol").
    pub fn update_from_detection(&mut self, detection: &Detection) -> Result<(), CalibratorError> {
        // Step 1: reload-then-merge so concurrent writers never lose
        // each other's accumulated counts (spec P6).
        if let Some(latest) = Self::read_locked(&self.path)? {
            self.merge_from(latest);
        }

        if matches!(self.state.phase, CalibrationPhase::Bootstrap) {
            self.state.stats.bootstrap_detections += 1;
        }

        self.update_station_model(detection);
        self.update_rtp_model(detection);

        if detection.is_test_signal {
            self.state.stats.test_signal_verifications += 1;
        } else if detection.is_ground_truth_minute {
            self.state.stats.verifications += 1;
        }

        self.check_bootstrap_complete();
        self.check_verified_transition();

        let persist_now = matches!(self.state.phase, CalibrationPhase::Bootstrap) || self.state.stats.bootstrap_detections % 5 == 0;
        if persist_now {
            self.state.saved_at = detection.minute_utc as f64;
            Self::write_locked(&self.path, &self.state)?;
        }
        Ok(())
    }

    fn update_station_model(&mut self, detection: &Detection) {
        let weight = (detection.snr_db / 30.0).clamp(0.0, 1.0) * detection.confidence;
        let entry = self.state.station_calibration.entry(detection.station).or_insert(StationCalibration {
            propagation_delay_ms: detection.propagation_delay_ms,
            propagation_delay_std_ms: 20.0,
            n_samples: 0,
            last_updated: detection.minute_utc as f64,
            frequencies_contributing: Vec::new(),
        });

        // EWMA with SNR/confidence-weighted learning rate; a fresh
        // station starts at the first observed delay.
        if entry.n_samples == 0 {
            entry.propagation_delay_ms = detection.propagation_delay_ms;
        } else {
            let alpha = weight.max(0.01);
            let delta = detection.propagation_delay_ms - entry.propagation_delay_ms;
            entry.propagation_delay_ms += alpha * delta;
            entry.propagation_delay_std_ms = ((1.0 - alpha) * entry.propagation_delay_std_ms.powi(2) + alpha * delta.powi(2)).sqrt();
        }
        entry.n_samples += 1;
        entry.last_updated = detection.minute_utc as f64;
        if !entry.frequencies_contributing.contains(&detection.frequency_hz) {
            entry.frequencies_contributing.push(detection.frequency_hz);
        }
    }

    fn update_rtp_model(&mut self, detection: &Detection) {
        let samples_per_minute = detection.sample_rate as u64 * 60;
        let rtp_offset_samples = detection.rtp_timestamp % samples_per_minute;

        match self.state.rtp_calibration.get_mut(&detection.channel_key) {
            Some(existing) => {
                let drift = rtp_offset_samples.abs_diff(existing.rtp_offset_samples);
                if drift > 10 {
                    log::warn!(
                        "rtp offset drift of {drift} samples on {} at locked GPSDO; calibrator does not reanchor",
                        detection.channel_key
                    );
                }
                existing.n_confirmations += 1;
                existing.last_confirmed = detection.minute_utc as f64;
                existing.detected_station = detection.station;
            }
            None => {
                self.state.rtp_calibration.insert(
                    detection.channel_key.clone(),
                    RtpCalibration {
                        frequency_hz: detection.frequency_hz,
                        sample_rate: detection.sample_rate,
                        reference_minute_utc: detection.minute_utc,
                        reference_rtp_timestamp: detection.rtp_timestamp,
                        rtp_offset_samples,
                        calibration_snr_db: detection.snr_db,
                        calibration_confidence: detection.confidence,
                        n_confirmations: 1,
                        last_confirmed: detection.minute_utc as f64,
                        detected_station: detection.station,
                    },
                );
            }
        }
    }

    fn check_bootstrap_complete(&mut self) {
        if !matches!(self.state.phase, CalibrationPhase::Bootstrap) {
            return;
        }
        let stations_with_good_std: Vec<&Station> = self
            .state
            .station_calibration
            .iter()
            .filter(|(_, c)| c.propagation_delay_std_ms <= 20.0)
            .map(|(s, _)| s)
            .collect();
        if self.state.stats.bootstrap_detections >= self.config.bootstrap_min_detections
            && stations_with_good_std.len() as u32 >= self.config.bootstrap_min_stations
        {
            self.state.phase = CalibrationPhase::Calibrated;
        }
    }

    fn check_verified_transition(&mut self) {
        if !matches!(self.state.phase, CalibrationPhase::Calibrated) {
            return;
        }
        if self.state.stats.verifications >= 5 || self.state.stats.test_signal_verifications >= 2 {
            self.state.phase = CalibrationPhase::Verified;
        }
    }

    fn merge_from(&mut self, other: CalibratorState) {
        for (station, other_cal) in other.station_calibration {
            match self.state.station_calibration.get(&station) {
                Some(mine) if mine.n_samples >= other_cal.n_samples => {}
                _ => {
                    self.state.station_calibration.insert(station, other_cal);
                }
            }
        }
        for (key, other_rtp) in other.rtp_calibration {
            match self.state.rtp_calibration.get(&key) {
                Some(mine) if mine.n_confirmations >= other_rtp.n_confirmations => {}
                _ => {
                    self.state.rtp_calibration.insert(key, other_rtp);
                }
            }
        }
        self.state.stats.bootstrap_detections = self.state.stats.bootstrap_detections.max(other.stats.bootstrap_detections);
        self.state.stats.verifications = self.state.stats.verifications.max(other.stats.verifications);
        self.state.stats.test_signal_verifications = self.state.stats.test_signal_verifications.max(other.stats.test_signal_verifications);
        if matches!(other.phase, CalibrationPhase::Verified)
            || (matches!(other.phase, CalibrationPhase::Calibrated) && matches!(self.state.phase, CalibrationPhase::Bootstrap))
        {
            self.state.phase = other.phase;
        }
    }

    fn read_locked(path: &std::path::Path) -> Result<Option<CalibratorState>, CalibratorError> {
        if !path.exists() {
            return Ok(None);
        }
        let mut file = OpenOptions::new().read(true).open(path)?;
        flock(file.as_raw_fd(), FlockArg::LockShared).map_err(|_| CalibratorError::LockFailed)?;
        let mut text = String::new();
        let result = file.read_to_string(&mut text);
        let _ = flock(file.as_raw_fd(), FlockArg::Unlock);
        result?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn write_locked(path: &std::path::Path, state: &CalibratorState) -> Result<(), CalibratorError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(|_| CalibratorError::LockFailed)?;
        let text = serde_json::to_string_pretty(state)?;
        let result = (|| -> std::io::Result<()> {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(text.as_bytes())
        })();
        let _ = flock(file.as_raw_fd(), FlockArg::Unlock);
        result?;
        Ok(())
    }
}

fn detection_confidence_to_f64(c: Confidence) -> f64 {
    match c {
        Confidence::High => 0.9,
        Confidence::Medium => 0.6,
        Confidence::Low => 0.3,
    }
}

pub fn is_ground_truth_minute(minute_of_hour: u32) -> bool {
    GROUND_TRUTH_MINUTES.contains(&minute_of_hour)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(snr_db: f64, delay_ms: f64, minute_utc: i64) -> Detection {
        Detection {
            channel_key: "WWV_10.0_MHz".into(),
            station: Station::Wwv,
            frequency_hz: 10_000_000,
            sample_rate: 20_000,
            snr_db,
            confidence: 0.9,
            minute_utc,
            rtp_timestamp: (minute_utc as u64) * 20_000,
            propagation_delay_ms: delay_ms,
            is_ground_truth_minute: false,
            is_test_signal: false,
        }
    }

    #[test]
    fn bootstraps_then_calibrates_after_enough_detections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("timing_calibration.json");
        let mut calibrator = TimingCalibrator::new(path, CalibratorConfig::default()).unwrap();
        assert_eq!(calibrator.phase(), CalibrationPhase::Bootstrap);
        for i in 0..5 {
            calibrator.update_from_detection(&detection(25.0, 10.0, 60 * (i + 1))).unwrap();
        }
        // Only one station contributed; needs bootstrap_min_stations=2.
        assert_eq!(calibrator.phase(), CalibrationPhase::Bootstrap);
    }

    #[test]
    fn persisted_state_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("timing_calibration.json");
        let mut calibrator = TimingCalibrator::new(path.clone(), CalibratorConfig::default()).unwrap();
        calibrator.update_from_detection(&detection(25.0, 10.0, 60)).unwrap();
        let reloaded = TimingCalibrator::new(path, CalibratorConfig::default()).unwrap();
        assert_eq!(reloaded.state().stats.bootstrap_detections, 1);
    }

    #[test]
    fn search_window_narrows_with_low_std() {
        let mut cal = StationCalibration {
            propagation_delay_ms: 10.0,
            propagation_delay_std_ms: 1.0,
            n_samples: 10,
            last_updated: 0.0,
            frequencies_contributing: vec![10_000_000],
        };
        let config = CalibratorConfig::default();
        assert_eq!(cal.search_window_ms(&config), 5.0);
        cal.propagation_delay_std_ms = 0.0;
        assert_eq!(cal.search_window_ms(&config), config.narrow_window_floor_ms);
    }

    #[test]
    fn ground_truth_minutes_cover_spec_list() {
        assert!(is_ground_truth_minute(1));
        assert!(is_ground_truth_minute(44));
        assert!(!is_ground_truth_minute(20));
    }

    #[test]
    fn ground_truth_minutes_cover_the_full_43_to_51_range() {
        for minute in 43..=51 {
            assert!(is_ground_truth_minute(minute), "minute {minute} should be ground-truth");
        }
    }
}
