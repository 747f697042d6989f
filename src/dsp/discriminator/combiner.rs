//! M1 (fundamental-tone power ratio), M3 (440 Hz station-ID tone), and
//! the weighted-voting combiner that ties all five methods together
//! (spec §4.5.5).

use crate::dsp::{quadrature_correlate, tukey_window};
use crate::types::{Confidence, DiscriminationResult, Station};

/// M1: power ratio between the WWV 1000 Hz and WWVH 1200 Hz 800 ms
/// tones, both already located by the tone detector (C4). Returns
/// `None` unless both were detected this minute.
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerRatioResult {
    pub wwv_power_db: Option<f64>,
    pub wwvh_power_db: Option<f64>,
    pub power_ratio_db: Option<f64>,
    pub differential_delay_ms: Option<f64>,
}

pub fn power_ratio(
    wwv_snr_db: Option<f64>,
    wwvh_snr_db: Option<f64>,
    wwv_timing_ms: Option<f64>,
    wwvh_timing_ms: Option<f64>,
) -> PowerRatioResult {
    let mut out = PowerRatioResult {
        wwv_power_db: wwv_snr_db,
        wwvh_power_db: wwvh_snr_db,
        ..Default::default()
    };
    if let (Some(wwv), Some(wwvh)) = (wwv_snr_db, wwvh_snr_db) {
        out.power_ratio_db = Some(wwv - wwvh);
    }
    if let (Some(a), Some(b)) = (wwv_timing_ms, wwvh_timing_ms) {
        out.differential_delay_ms = Some(a - b);
    }
    out
}

/// M3: 440 Hz station-ID tone. WWVH transmits it on minute 1, WWV on
/// minute 2, seconds :15-:59 (spec §4.5.1). `snr_db` is measured from
/// quadrature correlation over that window against the 825-875 Hz
/// guard-band noise floor.
#[derive(Debug, Clone, Copy, Default)]
pub struct StationIdResult {
    pub detected: bool,
    pub snr_db: f64,
    pub station: Option<Station>,
}

pub fn station_id_tone(minute_of_hour: u32, snr_db: f64) -> StationIdResult {
    let station = match minute_of_hour {
        1 => Some(Station::Wwvh),
        2 => Some(Station::Wwv),
        _ => None,
    };
    StationIdResult {
        detected: station.is_some() && snr_db > 3.0,
        snr_db,
        station,
    }
}

const STATION_ID_FREQ_HZ: f64 = 440.0;
const STATION_ID_WINDOW_START_S: f64 = 15.0;
const STATION_ID_WINDOW_DURATION_S: f64 = 44.0;
const STATION_ID_TUKEY_ALPHA: f64 = 0.1;

/// Measures M3's SNR by quadrature-correlating the (notch-preprocessed
/// per spec §4.5.2) envelope against the 440 Hz tone over the :15-:59
/// window (spec §4.5.1), then runs it through `station_id_tone`'s >3dB
/// abstain threshold. `noise_power` is the 825-875 Hz guard-band power
/// (spec §4.5.2), shared with M2's tick-SNR measurement.
pub fn measure_station_id(envelope: &[f64], sample_rate_hz: f64, minute_of_hour: u32, noise_power: f64) -> StationIdResult {
    if !matches!(minute_of_hour, 1 | 2) {
        return StationIdResult::default();
    }
    let start = (STATION_ID_WINDOW_START_S * sample_rate_hz).round() as usize;
    let template_len = (STATION_ID_WINDOW_DURATION_S * sample_rate_hz).round() as usize;
    if template_len == 0 || envelope.len() < start + template_len {
        return station_id_tone(minute_of_hour, 0.0);
    }

    let window_slice = &envelope[start..start + template_len];
    let window = tukey_window(template_len, STATION_ID_TUKEY_ALPHA);
    let corr = quadrature_correlate(window_slice, sample_rate_hz, STATION_ID_FREQ_HZ, template_len, &window);
    let peak = corr.iter().cloned().fold(0.0_f64, f64::max);
    let noise_amp = noise_power.max(1e-12).sqrt();
    let snr_db = 20.0 * (peak / noise_amp).log10();
    station_id_tone(minute_of_hour, snr_db)
}

#[derive(Debug, Clone, Copy, Default)]
struct Weights {
    w440: f64,
    w_bcd: f64,
    w_carrier: f64,
    w_tick: f64,
    w_test: f64,
}

/// Minute-of-hour dependent weight table (spec §4.5.5).
fn weights_for_minute(m: u32) -> Weights {
    match m {
        8 | 44 => Weights { w440: 0.0, w_bcd: 0.0, w_carrier: 0.0, w_tick: 0.0, w_test: 15.0 },
        1 | 2 => Weights { w440: 10.0, w_bcd: 2.0, w_carrier: 1.0, w_tick: 5.0, w_test: 0.0 },
        0 | 9 | 10 | 29 | 30 => Weights { w440: 0.0, w_bcd: 10.0, w_carrier: 2.0, w_tick: 5.0, w_test: 0.0 },
        _ => Weights { w440: 0.0, w_bcd: 2.0, w_carrier: 10.0, w_tick: 5.0, w_test: 0.0 },
    }
}

/// Per-method inputs feeding the combiner for one minute. Each `*_db`
/// field is `station_favoured_db − other_station_db`; positive favours
/// WWV, negative favours WWVH. `None` means the method abstained
/// (insufficient signal, contaminated tick, template error, etc).
#[derive(Debug, Clone, Copy, Default)]
pub struct CombinerInputs {
    pub minute_of_hour: u32,
    pub carrier_ratio_db: Option<f64>,
    pub tick_ratio_db: Option<f64>,
    pub bcd_ratio_db: Option<f64>,
    pub station_id: Option<StationIdResult>,
    pub test_signal_detected: bool,
    pub test_signal_station: Option<Station>,
    pub test_signal_confidence: f64,
}

const ABSTAIN_THRESHOLD_DB: f64 = 3.0;

/// Runs the weighted-voting combiner (spec §4.5.5). `power` supplies
/// the M1 fields carried through verbatim into the result.
pub fn combine(inputs: &CombinerInputs, power: &PowerRatioResult, minute_boundary_unix: i64) -> DiscriminationResult {
    // Test-signal override: high-confidence detection forces the vote.
    if inputs.test_signal_detected && inputs.test_signal_confidence > 0.7 {
        if let Some(station) = inputs.test_signal_station {
            return DiscriminationResult {
                minute_boundary_unix,
                dominant_station: station,
                confidence: Confidence::High,
                wwv_power_db: power.wwv_power_db,
                wwvh_power_db: power.wwvh_power_db,
                power_ratio_db: power.power_ratio_db,
                differential_delay_ms: power.differential_delay_ms,
                test_signal_override: true,
            };
        }
    }

    let w = weights_for_minute(inputs.minute_of_hour);
    let mut wwv_score = 0.0;
    let mut wwvh_score = 0.0;

    if let Some(ratio) = inputs.carrier_ratio_db {
        if ratio.abs() > ABSTAIN_THRESHOLD_DB {
            if ratio > 0.0 {
                wwv_score += w.w_carrier;
            } else {
                wwvh_score += w.w_carrier;
            }
        }
    }
    if let Some(ratio) = inputs.tick_ratio_db {
        if ratio.abs() > ABSTAIN_THRESHOLD_DB {
            if ratio > 0.0 {
                wwv_score += w.w_tick;
            } else {
                wwvh_score += w.w_tick;
            }
        }
    }
    if let Some(ratio) = inputs.bcd_ratio_db {
        if ratio.abs() > ABSTAIN_THRESHOLD_DB {
            if ratio > 0.0 {
                wwv_score += w.w_bcd;
            } else {
                wwvh_score += w.w_bcd;
            }
        }
    }
    if let Some(id) = inputs.station_id {
        if id.detected && id.snr_db > ABSTAIN_THRESHOLD_DB {
            match id.station {
                Some(Station::Wwv) => wwv_score += w.w440,
                Some(Station::Wwvh) => wwvh_score += w.w440,
                _ => {}
            }
        }
    }
    if inputs.test_signal_detected {
        match inputs.test_signal_station {
            Some(Station::Wwv) => wwv_score += w.w_test,
            Some(Station::Wwvh) => wwvh_score += w.w_test,
            _ => {}
        }
    }

    let total = wwv_score + wwvh_score;
    let (dominant_station, confidence) = if total <= 0.0 {
        (Station::Unknown, Confidence::Low)
    } else {
        let delta = (wwv_score - wwvh_score).abs() / total;
        let confidence = if delta < 0.15 {
            Confidence::Medium
        } else if delta > 0.7 {
            Confidence::High
        } else if delta > 0.4 {
            Confidence::Medium
        } else {
            Confidence::Low
        };
        let station = if delta < 0.15 {
            Station::Unknown
        } else if wwv_score > wwvh_score {
            Station::Wwv
        } else {
            Station::Wwvh
        };
        (station, confidence)
    };

    DiscriminationResult {
        minute_boundary_unix,
        dominant_station,
        confidence,
        wwv_power_db: power.wwv_power_db,
        wwvh_power_db: power.wwvh_power_db,
        power_ratio_db: power.power_ratio_db,
        differential_delay_ms: power.differential_delay_ms,
        test_signal_override: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_ratio_requires_both_stations() {
        let r = power_ratio(Some(20.0), None, Some(1.0), None);
        assert!(r.power_ratio_db.is_none());
        let r2 = power_ratio(Some(20.0), Some(10.0), Some(1.0), Some(2.0));
        assert_eq!(r2.power_ratio_db, Some(10.0));
        assert_eq!(r2.differential_delay_ms, Some(-1.0));
    }

    #[test]
    fn station_id_tone_only_fires_on_minutes_1_and_2() {
        assert_eq!(station_id_tone(1, 10.0).station, Some(Station::Wwvh));
        assert_eq!(station_id_tone(2, 10.0).station, Some(Station::Wwv));
        assert!(station_id_tone(5, 10.0).station.is_none());
    }

    #[test]
    fn measure_station_id_detects_injected_440hz_tone() {
        let fs = 3000.0;
        let n = (fs * 60.0) as usize;
        let mut envelope = vec![0.0; n];
        let start = (15.0 * fs) as usize;
        let len = (44.0 * fs) as usize;
        for i in 0..len {
            let t = i as f64 / fs;
            envelope[start + i] = (2.0 * std::f64::consts::PI * 440.0 * t).sin();
        }
        let result = measure_station_id(&envelope, fs, 2, 1e-6);
        assert_eq!(result.station, Some(Station::Wwv));
        assert!(result.detected, "snr_db={}", result.snr_db);
    }

    #[test]
    fn measure_station_id_abstains_outside_id_minutes() {
        let envelope = vec![1.0; 3000 * 60];
        let result = measure_station_id(&envelope, 3000.0, 20, 1e-6);
        assert!(result.station.is_none());
        assert!(!result.detected);
    }

    #[test]
    fn combiner_is_deterministic_given_identical_inputs() {
        let inputs = CombinerInputs {
            minute_of_hour: 20,
            carrier_ratio_db: Some(6.0),
            tick_ratio_db: Some(4.0),
            bcd_ratio_db: None,
            station_id: None,
            test_signal_detected: false,
            test_signal_station: None,
            test_signal_confidence: 0.0,
        };
        let power = PowerRatioResult::default();
        let a = combine(&inputs, &power, 0);
        let b = combine(&inputs, &power, 0);
        assert_eq!(a.dominant_station, b.dominant_station);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.dominant_station, Station::Wwv);
    }

    #[test]
    fn methods_abstain_below_threshold() {
        let inputs = CombinerInputs {
            minute_of_hour: 20,
            carrier_ratio_db: Some(1.0),
            tick_ratio_db: Some(-1.0),
            bcd_ratio_db: None,
            station_id: None,
            test_signal_detected: false,
            test_signal_station: None,
            test_signal_confidence: 0.0,
        };
        let result = combine(&inputs, &PowerRatioResult::default(), 0);
        assert_eq!(result.dominant_station, Station::Unknown);
    }

    #[test]
    fn high_confidence_test_signal_overrides_vote() {
        let inputs = CombinerInputs {
            minute_of_hour: 8,
            carrier_ratio_db: Some(-6.0),
            tick_ratio_db: Some(-4.0),
            bcd_ratio_db: None,
            station_id: None,
            test_signal_detected: true,
            test_signal_station: Some(Station::Wwv),
            test_signal_confidence: 0.9,
        };
        let result = combine(&inputs, &PowerRatioResult::default(), 0);
        assert_eq!(result.dominant_station, Station::Wwv);
        assert_eq!(result.confidence, Confidence::High);
        assert!(result.test_signal_override);
    }
}
