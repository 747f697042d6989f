//! Station discriminator (C5): five independent methods plus the
//! weighted-voting combiner that decides, per minute, whether WWV or
//! WWVH dominates a channel (spec §4.5).

pub mod bcd;
pub mod combiner;
pub mod test_signal;
pub mod tick_stack;

pub use bcd::{cross_correlate_bcd, generate_bcd_template, BcdResult};
pub use combiner::{combine, measure_station_id, power_ratio, station_id_tone, CombinerInputs, PowerRatioResult, StationIdResult};
pub use test_signal::{detect_test_signal, TestSignalResult};
pub use tick_stack::{estimate_doppler_hz, stack_ticks, TickStackResult};

use crate::types::DiscriminationResult;

/// Assembles per-method outputs already computed by the caller (phase2
/// orchestration owns the raw-sample access each method needs) into the
/// weighted-vote decision for one minute.
pub fn discriminate(inputs: &CombinerInputs, power: &PowerRatioResult, minute_boundary_unix: i64) -> DiscriminationResult {
    combine(inputs, power, minute_boundary_unix)
}
