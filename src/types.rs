//! Core data model shared across the pipeline (spec §3).

use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SAMPLE_RATE_HZ: u32 = 20_000;
pub const SAMPLES_PER_MINUTE: usize = 1_200_000;
pub const BYTES_PER_SAMPLE: usize = 8;
pub const ARCHIVE_FILE_BYTES: usize = SAMPLES_PER_MINUTE * BYTES_PER_SAMPLE;

/// Time-signal station identity. `Unknown` covers not-yet-discriminated
/// or ambiguous minutes; it is never written as a confirmed detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Station {
    Wwv,
    Wwvh,
    Chu,
    Unknown,
}

impl Station {
    pub fn as_str(&self) -> &'static str {
        match self {
            Station::Wwv => "WWV",
            Station::Wwvh => "WWVH",
            Station::Chu => "CHU",
            Station::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Station {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a single receive channel: a station/frequency pair tuned on
/// the upstream SDR daemon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    pub station_hint: Station,
    pub frequency_hz: u64,
}

impl Channel {
    pub fn new(station_hint: Station, frequency_hz: u64) -> Self {
        Self {
            station_hint,
            frequency_hz,
        }
    }

    /// Channel directory name: spaces replaced with underscores, per
    /// the on-disk layout contract.
    pub fn dir_name(&self) -> String {
        format!("{}_{:.1}_MHz", self.station_hint, self.frequency_hz as f64 / 1e6)
            .replace(' ', "_")
    }
}

/// Metadata describing an upstream channel as discovered via whatever
/// adapter implements `ChannelDiscovery`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub ssrc: u32,
    pub multicast: std::net::Ipv4Addr,
    pub port: u16,
    pub frequency_hz: u64,
    pub sample_rate: u32,
}

/// Immutable batch of samples delivered by the RTP receiver.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    pub rtp_timestamp: u32,
    pub rtp_sequence: u16,
    pub samples: Vec<Complex32>,
    pub gap_samples_before: u32,
    pub arrival_wall_time: f64,
}

/// The RTP-to-UTC anchor. Any sample's UTC time is
/// `utc_timestamp + (rtp - rtp_timestamp) / sample_rate / clock_ratio`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSnapReference {
    pub rtp_timestamp: u64,
    pub utc_timestamp: f64,
    pub sample_rate: u32,
    pub source: TimeSnapSource,
    pub confidence: f64,
    pub established_at: f64,
    /// Measured sample-clock ratio (1.0 = nominal); applied as a divisor.
    pub clock_ratio: f64,
}

impl TimeSnapReference {
    pub fn t_utc(&self, rtp: u64) -> f64 {
        let delta = rtp as i64 - self.rtp_timestamp as i64;
        self.utc_timestamp + (delta as f64 / self.sample_rate as f64) / self.clock_ratio
    }

    pub fn expected_sample(&self, target_minute_unix: i64) -> i64 {
        self.rtp_timestamp as i64
            + ((target_minute_unix as f64 - self.utc_timestamp) * self.sample_rate as f64
                / self.clock_ratio) as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeSnapSource {
    WwvVerified,
    WwvhVerified,
    ChuVerified,
    Ntp,
    WallClock,
    Archive,
}

/// One sealed-or-in-progress minute of archived IQ data, owned
/// exclusively by one channel's orchestrator.
pub struct MinuteBuffer {
    pub minute_boundary_unix: i64,
    pub samples: Vec<Complex32>,
    pub write_pos: usize,
    pub start_rtp: u64,
    pub gap_count: u32,
    pub gap_samples: u32,
}

impl MinuteBuffer {
    pub fn new(minute_boundary_unix: i64, start_rtp: u64, initial_write_pos: usize) -> Self {
        debug_assert_eq!(minute_boundary_unix % 60, 0);
        Self {
            minute_boundary_unix,
            samples: vec![Complex32::new(0.0, 0.0); SAMPLES_PER_MINUTE],
            write_pos: initial_write_pos,
            start_rtp,
            gap_count: 0,
            gap_samples: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.write_pos >= SAMPLES_PER_MINUTE
    }

    pub fn samples_remaining(&self) -> usize {
        SAMPLES_PER_MINUTE.saturating_sub(self.write_pos)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationPhase {
    Bootstrap,
    Calibrated,
    Verified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnchorState {
    Startup,
    SteadyState,
    Holdover,
    ReanchorRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityGrade {
    A,
    B,
    C,
    D,
    X,
}

impl QualityGrade {
    pub fn from_uncertainty_ms(uncertainty_ms: Option<f64>) -> Self {
        match uncertainty_ms {
            None => QualityGrade::X,
            Some(u) if u < 1.0 => QualityGrade::A,
            Some(u) if u < 3.0 => QualityGrade::B,
            Some(u) if u < 10.0 => QualityGrade::C,
            Some(_) => QualityGrade::D,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityGrade::A => "A",
            QualityGrade::B => "B",
            QualityGrade::C => "C",
            QualityGrade::D => "D",
            QualityGrade::X => "X",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityFlag {
    Locked,
    Holdover,
    Unanchored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Per-minute combined station discrimination decision (spec §3, §4.5).
#[derive(Debug, Clone)]
pub struct DiscriminationResult {
    pub minute_boundary_unix: i64,
    pub dominant_station: Station,
    pub confidence: Confidence,
    pub wwv_power_db: Option<f64>,
    pub wwvh_power_db: Option<f64>,
    pub power_ratio_db: Option<f64>,
    pub differential_delay_ms: Option<f64>,
    pub test_signal_override: bool,
}

/// Result of the propagation-mode solver (C6).
#[derive(Debug, Clone)]
pub struct PropagationSolution {
    pub mode: String,
    pub n_hops: u32,
    pub predicted_delay_ms: f64,
    pub uncertainty_ms: f64,
    pub confidence: f64,
    pub delay_spread_ms: f64,
    pub doppler_std_hz: f64,
}

/// Result of the transmission-time solver (C7).
#[derive(Debug, Clone)]
pub struct TransmissionTimeSolution {
    pub emission_time_utc: f64,
    pub second_aligned: bool,
    pub utc_verified: bool,
    pub multi_station_verified: bool,
}

/// Full Phase-2 per-minute result (C8).
#[derive(Debug, Clone)]
pub struct Phase2Result {
    pub system_time: f64,
    pub utc_time: f64,
    pub minute_boundary_utc: i64,
    pub channel: Channel,
    pub discrimination: DiscriminationResult,
    pub propagation: Option<PropagationSolution>,
    pub transmission: Option<TransmissionTimeSolution>,
    pub uncertainty_ms: Option<f64>,
    pub processed_at: f64,
    pub processing_version: String,
}

/// One row of the clock-offset series (spec §3, §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockOffsetMeasurement {
    pub system_time: f64,
    pub utc_time: f64,
    pub minute_boundary_utc: i64,
    pub clock_offset_ms: f64,
    pub station: String,
    pub frequency_mhz: f64,
    pub propagation_delay_ms: Option<f64>,
    pub propagation_mode: Option<String>,
    pub n_hops: Option<u32>,
    pub confidence: f64,
    pub uncertainty_ms: Option<f64>,
    pub quality_grade: String,
    pub snr_db: Option<f64>,
    pub delay_spread_ms: Option<f64>,
    pub doppler_std_hz: Option<f64>,
    pub fss_db: Option<f64>,
    pub wwv_power_db: Option<f64>,
    pub wwvh_power_db: Option<f64>,
    pub discrimination_confidence: String,
    pub utc_verified: bool,
    pub multi_station_verified: bool,
    pub archive_file: Option<String>,
    pub rtp_timestamp: Option<u64>,
    pub processing_version: String,
    pub processed_at: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscontinuityType {
    RecorderOffline,
    RtpGap,
    Reanchor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discontinuity {
    pub kind: DiscontinuityType,
    pub started_at_unix: f64,
    pub ended_at_unix: f64,
    pub gap_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecimatedMinute {
    pub minute_index: u16,
    pub utc_timestamp: f64,
    pub d_clock_ms: f64,
    pub uncertainty_ms: f64,
    pub quality_grade: QualityGrade,
    pub gap_samples: u32,
    pub valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecimatedDayMetadata {
    pub channel: String,
    pub date: String,
    pub sample_rate: u32,
    pub samples_per_minute: u32,
    pub start_utc: f64,
    pub minutes: BTreeMap<u16, DecimatedMinute>,
    pub valid_minutes: u32,
    pub total_gap_samples: u64,
    pub completeness_pct: f64,
}

impl DecimatedDayMetadata {
    pub fn update_summary(&mut self) {
        self.valid_minutes = self.minutes.values().filter(|m| m.valid).count() as u32;
        self.total_gap_samples = self.minutes.values().map(|m| m.gap_samples as u64).sum();
        let total_minutes = 1440u32;
        self.completeness_pct = 100.0 * self.valid_minutes as f64 / total_minutes as f64;
    }
}
