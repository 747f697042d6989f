//! Clock-offset measurement output (C11): builds one `ClockOffsetMeasurement`
//! per Phase-2 result, grades it, and persists the series as an
//! append-only CSV plus periodic JSON snapshots. Also exposes a linear
//! interpolation query API over the in-memory series.

use crate::types::{Channel, ClockOffsetMeasurement, Confidence, DiscriminationResult, PropagationSolution, QualityGrade, Station, TransmissionTimeSolution};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

const CSV_HEADER: &str = "system_time,utc_time,minute_boundary_utc,clock_offset_ms,\
station,frequency_mhz,propagation_delay_ms,propagation_mode,\
n_hops,confidence,uncertainty_ms,quality_grade,\
snr_db,delay_spread_ms,doppler_std_hz,fss_db,\
wwv_power_db,wwvh_power_db,discrimination_confidence,\
utc_verified,multi_station_verified,rtp_timestamp,processed_at";

/// Builds a `ClockOffsetMeasurement` from one minute's discrimination,
/// propagation, and transmission-time results.
pub fn build_measurement(
    channel: &Channel,
    discrimination: &DiscriminationResult,
    propagation: Option<&PropagationSolution>,
    transmission: Option<&TransmissionTimeSolution>,
    minute_boundary_utc: i64,
    system_time: f64,
    snr_db: Option<f64>,
    rtp_timestamp: Option<u64>,
    processing_version: &str,
) -> ClockOffsetMeasurement {
    let clock_offset_ms = match transmission {
        Some(t) => (system_time - t.emission_time_utc) * 1000.0,
        None => 0.0,
    };
    let uncertainty_ms = propagation.map(|p| p.uncertainty_ms);
    let quality_grade = if transmission.is_none() || propagation.is_none() {
        QualityGrade::X
    } else {
        QualityGrade::from_uncertainty_ms(uncertainty_ms)
    };

    ClockOffsetMeasurement {
        system_time,
        utc_time: minute_boundary_utc as f64,
        minute_boundary_utc,
        clock_offset_ms,
        station: discrimination.dominant_station.as_str().to_string(),
        frequency_mhz: channel.frequency_hz as f64 / 1e6,
        propagation_delay_ms: propagation.map(|p| p.predicted_delay_ms),
        propagation_mode: propagation.map(|p| p.mode.clone()),
        n_hops: propagation.map(|p| p.n_hops),
        confidence: confidence_to_f64(discrimination.confidence),
        uncertainty_ms,
        quality_grade: quality_grade.as_str().to_string(),
        snr_db,
        delay_spread_ms: propagation.map(|p| p.delay_spread_ms),
        doppler_std_hz: propagation.map(|p| p.doppler_std_hz),
        fss_db: None,
        wwv_power_db: discrimination.wwv_power_db,
        wwvh_power_db: discrimination.wwvh_power_db,
        discrimination_confidence: confidence_label(discrimination.confidence).to_string(),
        utc_verified: transmission.map(|t| t.utc_verified).unwrap_or(false),
        multi_station_verified: transmission.map(|t| t.multi_station_verified).unwrap_or(false),
        archive_file: None,
        rtp_timestamp,
        processing_version: processing_version.to_string(),
        processed_at: Some(system_time),
    }
}

fn confidence_to_f64(c: Confidence) -> f64 {
    match c {
        Confidence::High => 0.9,
        Confidence::Medium => 0.6,
        Confidence::Low => 0.3,
    }
}

fn confidence_label(c: Confidence) -> &'static str {
    match c {
        Confidence::High => "high",
        Confidence::Medium => "medium",
        Confidence::Low => "low",
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn opt_num<T: std::fmt::Display>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

fn row_to_csv(m: &ClockOffsetMeasurement) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
        m.system_time,
        m.utc_time,
        m.minute_boundary_utc,
        m.clock_offset_ms,
        csv_escape(&m.station),
        m.frequency_mhz,
        opt_num(m.propagation_delay_ms),
        m.propagation_mode.as_deref().map(csv_escape).unwrap_or_default(),
        opt_num(m.n_hops),
        m.confidence,
        opt_num(m.uncertainty_ms),
        csv_escape(&m.quality_grade),
        opt_num(m.snr_db),
        opt_num(m.delay_spread_ms),
        opt_num(m.doppler_std_hz),
        opt_num(m.fss_db),
        opt_num(m.wwv_power_db),
        opt_num(m.wwvh_power_db),
        csv_escape(&m.discrimination_confidence),
        m.utc_verified,
        m.multi_station_verified,
        opt_num(m.rtp_timestamp),
        opt_num(m.processed_at),
    )
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
pub struct QualitySummary {
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub d: u32,
    pub x: u32,
}

impl QualitySummary {
    fn record(&mut self, grade: &str) {
        match grade {
            "A" => self.a += 1,
            "B" => self.b += 1,
            "C" => self.c += 1,
            "D" => self.d += 1,
            _ => self.x += 1,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct SeriesSnapshot<'a> {
    measurements: &'a [ClockOffsetMeasurement],
    quality_summary: QualitySummary,
}

/// Owns the append-only CSV and the in-memory series used for the
/// interpolation query API and periodic JSON snapshots.
pub struct ClockOffsetSeries {
    csv_path: PathBuf,
    measurements: Vec<ClockOffsetMeasurement>,
    quality_summary: QualitySummary,
    header_written: bool,
}

impl ClockOffsetSeries {
    pub fn new(csv_path: PathBuf) -> Self {
        let header_written = csv_path.exists();
        Self {
            csv_path,
            measurements: Vec::new(),
            quality_summary: QualitySummary::default(),
            header_written,
        }
    }

    pub fn append(&mut self, measurement: ClockOffsetMeasurement) -> std::io::Result<()> {
        if let Some(parent) = self.csv_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.csv_path)?;
        if !self.header_written {
            writeln!(file, "{CSV_HEADER}")?;
            self.header_written = true;
        }
        writeln!(file, "{}", row_to_csv(&measurement))?;
        self.quality_summary.record(&measurement.quality_grade);
        self.measurements.push(measurement);
        Ok(())
    }

    pub fn write_snapshot(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let snapshot = SeriesSnapshot {
            measurements: &self.measurements,
            quality_summary: self.quality_summary.clone(),
        };
        let text = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, text)
    }

    /// `get_offset_at_time(target_t, interpolate=true)`: linear
    /// interpolation between the two bracketing measurements.
    pub fn get_offset_at_time(&self, target_t: f64) -> Option<(f64, f64)> {
        let mut before: Option<&ClockOffsetMeasurement> = None;
        let mut after: Option<&ClockOffsetMeasurement> = None;
        for m in &self.measurements {
            if m.utc_time <= target_t && before.map(|b| m.utc_time > b.utc_time).unwrap_or(true) {
                before = Some(m);
            }
            if m.utc_time >= target_t && after.map(|a| m.utc_time < a.utc_time).unwrap_or(true) {
                after = Some(m);
            }
        }
        match (before, after) {
            (Some(b), Some(a)) if (a.utc_time - b.utc_time).abs() < 1e-9 => Some((b.clock_offset_ms, b.uncertainty_ms.unwrap_or(0.0))),
            (Some(b), Some(a)) => {
                let alpha = (target_t - b.utc_time) / (a.utc_time - b.utc_time);
                let offset = b.clock_offset_ms + alpha * (a.clock_offset_ms - b.clock_offset_ms);
                let before_u = b.uncertainty_ms.unwrap_or(0.0);
                let after_u = a.uncertainty_ms.unwrap_or(0.0);
                let uncertainty = before_u.max(after_u) * (1.0 + alpha * (1.0 - alpha));
                Some((offset, uncertainty))
            }
            (Some(b), None) => Some((b.clock_offset_ms, b.uncertainty_ms.unwrap_or(0.0))),
            (None, Some(a)) => Some((a.clock_offset_ms, a.uncertainty_ms.unwrap_or(0.0))),
            (None, None) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }
}
