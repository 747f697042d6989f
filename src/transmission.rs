//! Transmission-time solver (C7, spec §4.7): back-calculates the
//! station's emission time from measured arrival time and propagation
//! delay, and verifies it against second-alignment and multi-channel
//! consensus.

const SECOND_ALIGNMENT_TOLERANCE_S: f64 = 0.002;
const MODE_CONFIDENCE_VERIFIED_THRESHOLD: f64 = 0.7;
const DUAL_STATION_CONSENSUS_TOLERANCE_MS: f64 = 2.0;

#[derive(Debug, Clone, Copy)]
pub struct EmissionTimeSolution {
    pub emission_time_utc: f64,
    pub second_aligned: bool,
    pub utc_verified: bool,
}

/// `emission = arrival - delay/1000` (spec §4.7).
pub fn back_calculate_emission_time(arrival_time_utc: f64, propagation_delay_ms: f64, mode_confidence: f64) -> EmissionTimeSolution {
    let emission_time_utc = arrival_time_utc - propagation_delay_ms / 1000.0;
    let frac = emission_time_utc.fract().abs();
    let dist_to_integer = frac.min(1.0 - frac);
    let second_aligned = dist_to_integer <= SECOND_ALIGNMENT_TOLERANCE_S;
    let utc_verified = second_aligned && mode_confidence > MODE_CONFIDENCE_VERIFIED_THRESHOLD;
    EmissionTimeSolution {
        emission_time_utc,
        second_aligned,
        utc_verified,
    }
}

pub struct StationObservation {
    pub emission_time_utc: f64,
    pub snr_db: f64,
    pub mode_confidence: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ConsensusResult {
    pub weighted_mean_emission_time_utc: f64,
    pub accuracy_ms: f64,
}

/// Weighted mean/std across a station's multi-channel observations
/// (spec §4.7's consensus weighting, `weight = snr_db * mode_confidence`).
pub fn consensus(observations: &[StationObservation]) -> Option<ConsensusResult> {
    if observations.is_empty() {
        return None;
    }
    let weights: Vec<f64> = observations.iter().map(|o| (o.snr_db.max(0.0)) * o.mode_confidence).collect();
    let weight_sum: f64 = weights.iter().sum();
    if weight_sum <= 0.0 {
        return None;
    }
    let mean = observations
        .iter()
        .zip(weights.iter())
        .map(|(o, w)| o.emission_time_utc * w)
        .sum::<f64>()
        / weight_sum;
    let variance = observations
        .iter()
        .zip(weights.iter())
        .map(|(o, w)| w * (o.emission_time_utc - mean).powi(2))
        .sum::<f64>()
        / weight_sum;
    Some(ConsensusResult {
        weighted_mean_emission_time_utc: mean,
        accuracy_ms: variance.sqrt() * 1000.0,
    })
}

/// `dual_station_verified` iff both stations' consensus emission times
/// agree within `DUAL_STATION_CONSENSUS_TOLERANCE_MS` (spec §4.7).
pub fn dual_station_verified(wwv: Option<&ConsensusResult>, wwvh: Option<&ConsensusResult>) -> bool {
    match (wwv, wwvh) {
        (Some(a), Some(b)) => {
            let diff_ms = (a.weighted_mean_emission_time_utc - b.weighted_mean_emission_time_utc).abs() * 1000.0;
            diff_ms <= DUAL_STATION_CONSENSUS_TOLERANCE_MS
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emission_time_is_arrival_minus_delay() {
        let solution = back_calculate_emission_time(1000.500, 500.0, 0.9);
        assert!((solution.emission_time_utc - 1000.0).abs() < 1e-9);
        assert!(solution.second_aligned);
        assert!(solution.utc_verified);
    }

    #[test]
    fn low_mode_confidence_prevents_verification() {
        let solution = back_calculate_emission_time(1000.500, 500.0, 0.3);
        assert!(solution.second_aligned);
        assert!(!solution.utc_verified);
    }

    #[test]
    fn off_second_alignment_fails() {
        let solution = back_calculate_emission_time(1000.500, 450.0, 0.9);
        assert!(!solution.second_aligned);
    }

    #[test]
    fn consensus_weighted_mean_matches_single_observation() {
        let obs = vec![StationObservation { emission_time_utc: 10.0, snr_db: 20.0, mode_confidence: 0.9 }];
        let result = consensus(&obs).unwrap();
        assert!((result.weighted_mean_emission_time_utc - 10.0).abs() < 1e-9);
    }

    #[test]
    fn dual_station_verified_within_tolerance() {
        let wwv = ConsensusResult { weighted_mean_emission_time_utc: 10.0000, accuracy_ms: 0.1 };
        let wwvh = ConsensusResult { weighted_mean_emission_time_utc: 10.0015, accuracy_ms: 0.1 };
        assert!(dual_station_verified(Some(&wwv), Some(&wwvh)));
    }
}
