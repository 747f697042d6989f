//! Propagation-mode solver (C6, spec §4.6): given a measured delay,
//! enumerate ground-wave / ionospheric-hop modes and score each against
//! its theoretical delay for the path geometry.

use crate::types::PropagationSolution;

const SPEED_OF_LIGHT_KM_S: f64 = 299_792.458;
/// Nominal F-layer virtual height used for single/multi-hop geometry.
const F_LAYER_HEIGHT_KM: f64 = 300.0;
const EARTH_RADIUS_KM: f64 = 6371.0;
/// Extra delay contributed by each ionospheric reflection (scatter loss,
/// layer group retardation), a few tens of microseconds per hop.
const PER_HOP_F_LAYER_DELAY_MS: f64 = 0.05;
const GROUND_WAVE_LIMIT_KM: f64 = 500.0;
const MAX_HOPS: u32 = 4;

#[derive(Debug, Clone, Copy)]
pub struct GridSquare {
    pub lat_deg: f64,
    pub lon_deg: f64,
}

/// Great-circle distance between two points (spec §4.6 step 1).
pub fn great_circle_distance_km(a: GridSquare, b: GridSquare) -> f64 {
    let lat1 = a.lat_deg.to_radians();
    let lat2 = b.lat_deg.to_radians();
    let dlat = (b.lat_deg - a.lat_deg).to_radians();
    let dlon = (b.lon_deg - a.lon_deg).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

#[derive(Debug, Clone, Copy)]
struct Mode {
    name: &'static str,
    n_hops: u32,
}

fn hop_slant_range_km(ground_km: f64, n_hops: u32) -> f64 {
    let leg_ground_km = ground_km / n_hops as f64;
    let leg_slant_km = ((leg_ground_km / 2.0).powi(2) + F_LAYER_HEIGHT_KM.powi(2)).sqrt() * 2.0;
    leg_slant_km * n_hops as f64
}

fn theoretical_delay_ms(ground_km: f64, mode: &Mode) -> f64 {
    if mode.n_hops == 0 {
        return ground_km / SPEED_OF_LIGHT_KM_S * 1000.0;
    }
    let slant_km = hop_slant_range_km(ground_km, mode.n_hops);
    slant_km / SPEED_OF_LIGHT_KM_S * 1000.0 + mode.n_hops as f64 * PER_HOP_F_LAYER_DELAY_MS
}

fn enumerate_modes(ground_km: f64) -> Vec<Mode> {
    let mut modes = Vec::new();
    if ground_km < GROUND_WAVE_LIMIT_KM {
        modes.push(Mode { name: "GW", n_hops: 0 });
    }
    for hops in 1..=MAX_HOPS {
        // Each hop covers at most ~4000 km ground distance at F-layer
        // height before the elevation angle goes below the horizon.
        if ground_km <= hops as f64 * 4000.0 {
            modes.push(Mode {
                name: match hops {
                    1 => "1F",
                    2 => "2F",
                    3 => "3F",
                    _ => "nF",
                },
                n_hops: hops,
            });
        }
    }
    modes
}

/// Scores each candidate mode against `measured_delay_ms` and returns
/// the winner (spec §4.6 steps 2-5).
pub fn solve_propagation_mode(
    ground_km: f64,
    measured_delay_ms: f64,
    delay_spread_ms: f64,
    doppler_std_hz: f64,
) -> PropagationSolution {
    const W1: f64 = 1.0;
    const W2: f64 = 0.3;
    const W3: f64 = 0.2;
    const SIGMA_MS: f64 = 1.0;

    let modes = enumerate_modes(ground_km);
    let mut best: Option<(f64, f64, &Mode)> = None;

    for mode in &modes {
        let predicted = theoretical_delay_ms(ground_km, mode);
        let delay_term = (-((predicted - measured_delay_ms).abs()) / SIGMA_MS).exp();
        // Lower spread/Doppler favour higher-order modes less; both
        // priors are modelled as decaying with mode order.
        let spread_prior = (-delay_spread_ms / (5.0 * (mode.n_hops.max(1) as f64))).exp();
        let doppler_prior = (-doppler_std_hz / (2.0 * (mode.n_hops.max(1) as f64))).exp();
        let score = W1 * delay_term + W2 * spread_prior + W3 * doppler_prior;
        if best.map(|(s, ..)| score > s).unwrap_or(true) {
            best = Some((score, predicted, mode));
        }
    }

    match best {
        Some((score, predicted, mode)) => {
            let max_score = W1 + W2 + W3;
            PropagationSolution {
                mode: mode.name.to_string(),
                n_hops: mode.n_hops,
                predicted_delay_ms: predicted,
                uncertainty_ms: (predicted - measured_delay_ms).abs().max(0.1),
                confidence: (score / max_score).clamp(0.0, 1.0),
                delay_spread_ms,
                doppler_std_hz,
            }
        }
        None => PropagationSolution {
            mode: "unknown".to_string(),
            n_hops: 0,
            predicted_delay_ms: measured_delay_ms,
            uncertainty_ms: f64::INFINITY,
            confidence: 0.0,
            delay_spread_ms,
            doppler_std_hz,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ground_wave_wins_for_short_path_and_short_delay() {
        let d_km = 100.0;
        let measured = d_km / SPEED_OF_LIGHT_KM_S * 1000.0;
        let solution = solve_propagation_mode(d_km, measured, 0.1, 0.1);
        assert_eq!(solution.mode, "GW");
        assert_eq!(solution.n_hops, 0);
    }

    #[test]
    fn one_hop_f_layer_wins_for_matching_delay() {
        let d_km = 2000.0;
        let mode = Mode { name: "1F", n_hops: 1 };
        let measured = theoretical_delay_ms(d_km, &mode);
        let solution = solve_propagation_mode(d_km, measured, 0.5, 0.5);
        assert_eq!(solution.n_hops, 1);
        assert!(solution.confidence > 0.5);
    }

    #[test]
    fn great_circle_distance_zero_for_identical_points() {
        let p = GridSquare { lat_deg: 40.0, lon_deg: -105.0 };
        assert!(great_circle_distance_km(p, p) < 1e-6);
    }
}
