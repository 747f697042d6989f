//! Tone detector (C4): phase-invariant quadrature matched filtering on
//! the AM envelope for WWV/WWVH/CHU fundamental tones (spec §4.4).

use crate::dsp::{am_envelope, noise_floor, quadrature_correlate, tukey_window};
use crate::types::Station;
use std::collections::VecDeque;

/// `(station, freq_hz, duration_ms)` templates, spec §4.4.
#[derive(Debug, Clone, Copy)]
pub struct ToneTemplate {
    pub station: Station,
    pub freq_hz: f64,
    pub duration_ms: f64,
}

pub const TEMPLATES: [ToneTemplate; 3] = [
    ToneTemplate { station: Station::Wwv, freq_hz: 1000.0, duration_ms: 800.0 },
    ToneTemplate { station: Station::Wwvh, freq_hz: 1200.0, duration_ms: 800.0 },
    ToneTemplate { station: Station::Chu, freq_hz: 1000.0, duration_ms: 500.0 },
];

const SEARCH_WINDOW_S: f64 = 0.5;
const GUARD_SAMPLES: usize = 100;
const TUKEY_ALPHA: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct Detection {
    pub station: Station,
    pub peak_time_offset_s: f64,
    pub timing_error_ms: f64,
    pub snr_db: f64,
    pub confidence: f64,
    pub use_for_time_snap: bool,
}

/// Resamples `raw_rate_hz`-sampled AM envelope to `target_rate_hz` by
/// simple linear interpolation — cheap and adequate for correlation at
/// the default 3 kHz internal rate (spec §4.4 intro).
fn resample(envelope: &[f64], raw_rate_hz: f64, target_rate_hz: f64) -> Vec<f64> {
    if (raw_rate_hz - target_rate_hz).abs() < 1e-6 {
        return envelope.to_vec();
    }
    let ratio = raw_rate_hz / target_rate_hz;
    let out_len = (envelope.len() as f64 / ratio).floor() as usize;
    (0..out_len)
        .map(|i| {
            let src = i as f64 * ratio;
            let idx = src.floor() as usize;
            let frac = src - idx as f64;
            let a = envelope.get(idx).copied().unwrap_or(0.0);
            let b = envelope.get(idx + 1).copied().unwrap_or(a);
            a + (b - a) * frac
        })
        .collect()
}

pub struct ToneDetector {
    sample_rate_hz: u32,
    internal_rate_hz: f64,
    /// Deduplication cache: minute boundary -> already processed.
    seen_minutes: VecDeque<i64>,
    pub detection_count: std::collections::HashMap<Station, u64>,
    pub timing_error_history: VecDeque<f64>,
    pub differential_delay_history: VecDeque<f64>,
}

impl ToneDetector {
    pub fn new(sample_rate_hz: u32) -> Self {
        Self {
            sample_rate_hz,
            internal_rate_hz: 3000.0,
            seen_minutes: VecDeque::new(),
            detection_count: std::collections::HashMap::new(),
            timing_error_history: VecDeque::new(),
            differential_delay_history: VecDeque::new(),
        }
    }

    /// Runs all templates against the given minute's IQ buffer and
    /// returns one `Detection` per template that clears its noise
    /// floor. Per-minute deduplication: a repeated call for a minute
    /// already processed returns empty (spec §4.4).
    pub fn process(
        &mut self,
        minute_boundary_unix: i64,
        samples: &[num_complex::Complex32],
        _rtp_timestamp_at_start: u64,
    ) -> Vec<Detection> {
        if self.seen_minutes.contains(&minute_boundary_unix) {
            return Vec::new();
        }
        self.seen_minutes.push_back(minute_boundary_unix);
        while self.seen_minutes.len() > 10 {
            self.seen_minutes.pop_front();
        }

        let envelope = am_envelope(samples);
        let resampled = resample(&envelope, self.sample_rate_hz as f64, self.internal_rate_hz);

        let mut out = Vec::new();
        for template in TEMPLATES.iter() {
            if let Some(d) = self.detect_one(&resampled, minute_boundary_unix, template) {
                *self.detection_count.entry(template.station).or_insert(0) += 1;
                self.timing_error_history.push_back(d.timing_error_ms);
                while self.timing_error_history.len() > 1000 {
                    self.timing_error_history.pop_front();
                }
                out.push(d);
            }
        }

        if let (Some(wwv), Some(wwvh)) = (
            out.iter().find(|d| d.station == Station::Wwv),
            out.iter().find(|d| d.station == Station::Wwvh),
        ) {
            let diff = wwv.timing_error_ms - wwvh.timing_error_ms;
            self.differential_delay_history.push_back(diff);
            while self.differential_delay_history.len() > 1000 {
                self.differential_delay_history.pop_front();
            }
        }
        out
    }

    fn detect_one(&self, resampled: &[f64], minute_boundary_unix: i64, template: &ToneTemplate) -> Option<Detection> {
        let fs = self.internal_rate_hz;
        let template_len = (template.duration_ms / 1000.0 * fs).round() as usize;
        if template_len == 0 || resampled.len() < template_len {
            return None;
        }
        let window = tukey_window(template_len, TUKEY_ALPHA);
        let corr = quadrature_correlate(resampled, fs, template.freq_hz, template_len, &window);
        if corr.is_empty() {
            return None;
        }

        // Search window of +/- 500ms around the expected second boundary
        // (minute boundary, i.e. sample 0).
        let half_window = (SEARCH_WINDOW_S * fs).round() as usize;
        let center = 0usize;
        let lo = center.saturating_sub(half_window);
        let hi = (center + half_window).min(corr.len());
        if lo >= hi {
            return None;
        }

        let (peak_idx, &peak_val) = corr[lo..hi]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, v)| (lo + i, v))?;

        let floor = noise_floor(&corr, lo..hi, GUARD_SAMPLES, 2.0);
        if peak_val <= floor {
            return None;
        }

        let peak_time_offset_s = peak_idx as f64 / fs;
        let mut timing_error_ms = peak_time_offset_s * 1000.0;
        // Wrap to +/-30s, per spec §4.4 step 7.
        while timing_error_ms > 30_000.0 {
            timing_error_ms -= 60_000.0;
        }
        while timing_error_ms < -30_000.0 {
            timing_error_ms += 60_000.0;
        }

        let snr_db = 20.0 * (peak_val / floor.max(1e-12)).log10();
        let confidence = (snr_db / 40.0).clamp(0.0, 1.0);

        Some(Detection {
            station: template.station,
            peak_time_offset_s,
            timing_error_ms,
            snr_db,
            confidence,
            use_for_time_snap: matches!(template.station, Station::Wwv | Station::Chu),
        })
    }

    pub fn timing_error_rms_ms(&self) -> f64 {
        if self.timing_error_history.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = self.timing_error_history.iter().map(|v| v * v).sum();
        (sum_sq / self.timing_error_history.len() as f64).sqrt()
    }

    pub fn minute_boundary_unix_for(&self, idx: i64) -> i64 {
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex32;

    fn synth_minute(sample_rate: u32, tone_freq: f64, tone_duration_ms: f64, snr_db: f64) -> Vec<Complex32> {
        let n = sample_rate as usize * 60;
        let mut out = vec![Complex32::new(0.0, 0.0); n];
        let tone_samples = (tone_duration_ms / 1000.0 * sample_rate as f64).round() as usize;
        let amp = 10f32.powf(snr_db as f32 / 20.0);
        for i in 0..tone_samples.min(n) {
            let phase = 2.0 * std::f32::consts::PI * tone_freq as f32 * i as f32 / sample_rate as f32;
            out[i] = Complex32::new(amp * phase.cos(), amp * phase.sin());
        }
        // add small noise floor so SNR math stays finite
        for (i, s) in out.iter_mut().enumerate() {
            let n = ((i * 2654435761) % 1000) as f32 / 1000.0 - 0.5;
            *s += Complex32::new(n * 0.01, 0.0);
        }
        out
    }

    #[test]
    fn detects_wwv_tone_at_minute_boundary() {
        let mut detector = ToneDetector::new(20_000);
        let samples = synth_minute(20_000, 1000.0, 800.0, 20.0);
        let detections = detector.process(0, &samples, 0);
        assert!(detections.iter().any(|d| d.station == Station::Wwv));
        let wwv = detections.iter().find(|d| d.station == Station::Wwv).unwrap();
        assert!(wwv.use_for_time_snap);
        assert!(wwv.timing_error_ms.abs() < 500.0);
    }

    #[test]
    fn wwvh_is_not_eligible_for_time_snap() {
        let mut detector = ToneDetector::new(20_000);
        let samples = synth_minute(20_000, 1200.0, 800.0, 20.0);
        let detections = detector.process(0, &samples, 0);
        if let Some(d) = detections.iter().find(|d| d.station == Station::Wwvh) {
            assert!(!d.use_for_time_snap);
        }
    }

    #[test]
    fn dedups_repeated_minute() {
        let mut detector = ToneDetector::new(20_000);
        let samples = synth_minute(20_000, 1000.0, 800.0, 20.0);
        let first = detector.process(60, &samples, 0);
        let second = detector.process(60, &samples, 0);
        assert!(!first.is_empty());
        assert!(second.is_empty());
    }
}
