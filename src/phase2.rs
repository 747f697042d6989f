//! Phase-2 Temporal Engine (C8, spec §4.8): orchestrates, per minute,
//! the time-snap anchor decision, channel characterisation, and the
//! propagation/transmission solve into one `Phase2Result`.

use crate::propagation::{great_circle_distance_km, solve_propagation_mode, GridSquare};
use crate::transmission::back_calculate_emission_time;
use crate::types::{Channel, DiscriminationResult, Phase2Result, Station};

pub const PROCESSING_VERSION: &str = "1.0.0";

/// Known transmitter coordinates, used when a method needs to compare
/// measured delay against a geographic predictor (spec §4.5.4 step 6,
/// §4.6 step 1).
pub fn station_coordinates(station: Station) -> Option<GridSquare> {
    match station {
        Station::Wwv => Some(GridSquare { lat_deg: 40.6776, lon_deg: -105.0461 }),
        Station::Wwvh => Some(GridSquare { lat_deg: 21.9876, lon_deg: -159.6650 }),
        Station::Chu => Some(GridSquare { lat_deg: 45.2962, lon_deg: -75.7530 }),
        Station::Unknown => None,
    }
}

/// Parses a 4 or 6-character Maidenhead grid locator into latitude and
/// longitude of the grid square's centre.
pub fn maidenhead_to_latlon(grid: &str) -> Option<GridSquare> {
    let upper: Vec<char> = grid.to_ascii_uppercase().chars().collect();
    if upper.len() < 4 {
        return None;
    }
    let field_lon = (upper[0] as u8).checked_sub(b'A')? as f64;
    let field_lat = (upper[1] as u8).checked_sub(b'A')? as f64;
    let square_lon = upper[2].to_digit(10)? as f64;
    let square_lat = upper[3].to_digit(10)? as f64;

    let mut lon = field_lon * 20.0 + square_lon * 2.0 - 180.0;
    let mut lat = field_lat * 10.0 + square_lat * 1.0 - 90.0;

    if upper.len() >= 6 {
        let subsquare_lon = (upper[4] as u8).checked_sub(b'A')? as f64;
        let subsquare_lat = (upper[5] as u8).checked_sub(b'A')? as f64;
        lon += subsquare_lon * (2.0 / 24.0) + 1.0 / 24.0;
        lat += subsquare_lat * (1.0 / 24.0) + 0.5 / 24.0;
    } else {
        lon += 1.0;
        lat += 0.5;
    }
    Some(GridSquare { lat_deg: lat, lon_deg: lon })
}

/// Per-minute channel characterisation fed into the propagation solver
/// (spec §4.8 step 2), produced upstream by the discriminator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelCharacterisation {
    pub delay_spread_ms: f64,
    pub doppler_std_hz: f64,
    pub measured_delay_ms: f64,
    pub snr_db: f64,
}

/// Runs C6 (propagation) then C7 (transmission) and assembles the
/// minute's `Phase2Result` (spec §4.8 steps 3-4).
#[allow(clippy::too_many_arguments)]
pub fn process_minute(
    channel: &Channel,
    discrimination: DiscriminationResult,
    characterisation: ChannelCharacterisation,
    receiver_grid: &str,
    arrival_time_utc: f64,
    system_time: f64,
    minute_boundary_utc: i64,
) -> Phase2Result {
    let receiver = maidenhead_to_latlon(receiver_grid);
    let transmitter = station_coordinates(discrimination.dominant_station);

    let (propagation, transmission) = match (receiver, transmitter) {
        (Some(rx), Some(tx)) => {
            let d_km = great_circle_distance_km(rx, tx);
            let solution = solve_propagation_mode(
                d_km,
                characterisation.measured_delay_ms,
                characterisation.delay_spread_ms,
                characterisation.doppler_std_hz,
            );
            let transmission = back_calculate_emission_time(arrival_time_utc, solution.predicted_delay_ms, solution.confidence);
            (
                Some(solution),
                Some(crate::types::TransmissionTimeSolution {
                    emission_time_utc: transmission.emission_time_utc,
                    second_aligned: transmission.second_aligned,
                    utc_verified: transmission.utc_verified,
                    multi_station_verified: false,
                }),
            )
        }
        _ => (None, None),
    };

    let uncertainty_ms = propagation.as_ref().map(|p| p.uncertainty_ms);

    Phase2Result {
        system_time,
        utc_time: arrival_time_utc,
        minute_boundary_utc,
        channel: channel.clone(),
        discrimination,
        propagation,
        transmission,
        uncertainty_ms,
        processed_at: system_time,
        processing_version: PROCESSING_VERSION.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Confidence;

    #[test]
    fn maidenhead_round_trip_is_sane_for_wwv_grid() {
        let grid = maidenhead_to_latlon("DM79").unwrap();
        assert!((35.0..45.0).contains(&grid.lat_deg));
        assert!((-110.0..-100.0).contains(&grid.lon_deg));
    }

    #[test]
    fn unknown_station_skips_propagation_solve() {
        let channel = Channel::new(Station::Wwv, 10_000_000);
        let discrimination = DiscriminationResult {
            minute_boundary_unix: 0,
            dominant_station: Station::Unknown,
            confidence: Confidence::Low,
            wwv_power_db: None,
            wwvh_power_db: None,
            power_ratio_db: None,
            differential_delay_ms: None,
            test_signal_override: false,
        };
        let result = process_minute(
            &channel,
            discrimination,
            ChannelCharacterisation::default(),
            "DM79",
            60.0,
            60.0,
            60,
        );
        assert!(result.propagation.is_none());
        assert!(result.transmission.is_none());
    }

    #[test]
    fn known_station_and_grid_produces_a_solution() {
        let channel = Channel::new(Station::Wwv, 10_000_000);
        let discrimination = DiscriminationResult {
            minute_boundary_unix: 0,
            dominant_station: Station::Wwv,
            confidence: Confidence::High,
            wwv_power_db: Some(20.0),
            wwvh_power_db: None,
            power_ratio_db: None,
            differential_delay_ms: None,
            test_signal_override: false,
        };
        let characterisation = ChannelCharacterisation {
            delay_spread_ms: 0.3,
            doppler_std_hz: 0.2,
            measured_delay_ms: 3.0,
            snr_db: 20.0,
        };
        let result = process_minute(&channel, discrimination, characterisation, "DM79", 60.003, 60.0, 60);
        assert!(result.propagation.is_some());
        assert!(result.transmission.is_some());
    }
}
