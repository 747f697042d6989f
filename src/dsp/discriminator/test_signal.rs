//! M5: scientific test-signal detection (spec §4.5.6). Sample-rate
//! agnostic matched filtering of a 10 s multitone segment (2/3/4/5 kHz,
//! -3 dB steps, primary/70% weight) and a chirp-sequence segment
//! (secondary/30% weight).

use crate::dsp::quadrature_correlate;
use crate::types::Station;

const MULTITONE_FREQS_HZ: [f64; 4] = [2000.0, 3000.0, 4000.0, 5000.0];
/// -3 dB per step relative to the first tone.
const MULTITONE_STEP_DB: f64 = -3.0;
const MULTITONE_DURATION_S: f64 = 10.0;
const CHIRP_START_HZ: f64 = 1000.0;
const CHIRP_END_HZ: f64 = 5000.0;
const CHIRP_DURATION_S: f64 = 5.0;

const MULTITONE_WEIGHT: f64 = 0.70;
const CHIRP_WEIGHT: f64 = 0.30;
const DETECTION_THRESHOLD: f64 = 0.20;

#[derive(Debug, Clone, Copy, Default)]
pub struct TestSignalResult {
    pub detected: bool,
    pub station: Option<Station>,
    pub multitone_score: f64,
    pub chirp_score: f64,
    pub combined_confidence: f64,
    pub snr_db: f64,
}

fn multitone_score(envelope: &[f64], sample_rate_hz: f64) -> f64 {
    let template_len = (MULTITONE_DURATION_S * sample_rate_hz).round() as usize;
    if envelope.len() < template_len || template_len == 0 {
        return 0.0;
    }
    let window = vec![1.0; template_len];
    let mut score = 0.0;
    let mut weight_sum = 0.0;
    for (i, &freq) in MULTITONE_FREQS_HZ.iter().enumerate() {
        let expected_amp_db = MULTITONE_STEP_DB * i as f64;
        let weight = 10f64.powf(expected_amp_db / 20.0);
        let corr = quadrature_correlate(envelope, sample_rate_hz, freq, template_len, &window);
        if let Some(&peak) = corr.iter().max_by(|a, b| a.partial_cmp(b).unwrap()) {
            score += weight * peak;
        }
        weight_sum += weight;
    }
    if weight_sum <= 0.0 {
        0.0
    } else {
        (score / weight_sum).clamp(0.0, 1.0)
    }
}

fn chirp_score(envelope: &[f64], sample_rate_hz: f64) -> f64 {
    let n = (CHIRP_DURATION_S * sample_rate_hz).round() as usize;
    if envelope.len() < n || n == 0 {
        return 0.0;
    }
    let k = (CHIRP_END_HZ - CHIRP_START_HZ) / CHIRP_DURATION_S;
    let mut template = vec![0.0; n];
    for (i, t_bin) in template.iter_mut().enumerate() {
        let t = i as f64 / sample_rate_hz;
        let phase = 2.0 * std::f64::consts::PI * (CHIRP_START_HZ * t + 0.5 * k * t * t);
        *t_bin = phase.cos();
    }
    let signal_energy = envelope[..n].iter().map(|v| v * v).sum::<f64>().sqrt().max(1e-12);
    let template_energy = template.iter().map(|v| v * v).sum::<f64>().sqrt().max(1e-12);
    let dot: f64 = envelope[..n].iter().zip(template.iter()).map(|(a, b)| a * b).sum();
    (dot / (signal_energy * template_energy)).abs().clamp(0.0, 1.0)
}

/// Runs M5. `minute_of_hour` gates station assertion: WWV broadcasts at
/// minute 8, WWVH at minute 44 (spec §4.5.6).
pub fn detect_test_signal(envelope: &[f64], sample_rate_hz: f64, minute_of_hour: u32, noise_floor: f64) -> TestSignalResult {
    let m = multitone_score(envelope, sample_rate_hz);
    let c = chirp_score(envelope, sample_rate_hz);
    let combined = MULTITONE_WEIGHT * m + CHIRP_WEIGHT * c;
    let detected = combined >= DETECTION_THRESHOLD;
    let station = if detected {
        match minute_of_hour {
            8 => Some(Station::Wwv),
            44 => Some(Station::Wwvh),
            _ => None,
        }
    } else {
        None
    };
    let peak = envelope.iter().cloned().fold(0.0_f64, f64::max);
    let snr_db = 20.0 * (peak.abs() / noise_floor.max(1e-12)).log10();
    TestSignalResult {
        detected,
        station,
        multitone_score: m,
        chirp_score: c,
        combined_confidence: combined,
        snr_db,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synth_multitone(sample_rate_hz: f64, seconds: f64) -> Vec<f64> {
        let n = (sample_rate_hz * seconds) as usize;
        (0..n)
            .map(|i| {
                let t = i as f64 / sample_rate_hz;
                MULTITONE_FREQS_HZ
                    .iter()
                    .enumerate()
                    .map(|(k, &f)| {
                        let amp = 10f64.powf(MULTITONE_STEP_DB * k as f64 / 20.0);
                        amp * (2.0 * std::f64::consts::PI * f * t).sin()
                    })
                    .sum::<f64>()
            })
            .collect()
    }

    #[test]
    fn detects_multitone_at_minute_8() {
        let envelope = synth_multitone(12_000.0, 10.0);
        let result = detect_test_signal(&envelope, 12_000.0, 8, 0.01);
        assert!(result.multitone_score > 0.1);
        if result.detected {
            assert_eq!(result.station, Some(Station::Wwv));
        }
    }

    #[test]
    fn no_station_asserted_outside_minutes_8_and_44() {
        let envelope = synth_multitone(12_000.0, 10.0);
        let result = detect_test_signal(&envelope, 12_000.0, 20, 0.01);
        assert!(result.station.is_none());
    }
}
