//! GPSDO Monitor (C10, spec §4.10): "set, monitor, intervene" — trust
//! the GPSDO's sample counter as a steel ruler, and only re-anchor when
//! sample integrity is lost or a projection disagrees with it beyond
//! physical possibility.

use crate::config::MonitorConfig;
use crate::types::{AnchorState, TimeSnapReference};

#[derive(Debug, Clone, Copy)]
pub struct VerificationResult {
    pub expected_sample: i64,
    pub actual_sample: i64,
    pub error_ms: f64,
    pub within_jitter_threshold: bool,
    pub within_physics_threshold: bool,
    pub requires_reanchor: bool,
}

#[derive(Debug, Clone)]
pub struct MonitorState {
    pub anchor_state: AnchorState,
    pub consecutive_verifications: u32,
    pub last_verification_time: Option<f64>,
    pub last_verification_error_ms: f64,
    pub holdover_since: Option<f64>,
    pub total_reanchors: u32,
    pub verification_history: Vec<f64>,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self {
            anchor_state: AnchorState::Startup,
            consecutive_verifications: 0,
            last_verification_time: None,
            last_verification_error_ms: 0.0,
            holdover_since: None,
            total_reanchors: 0,
            verification_history: Vec::new(),
        }
    }
}

pub struct GpsdoMonitor {
    config: MonitorConfig,
    sample_rate_hz: u32,
    pub state: MonitorState,
}

impl GpsdoMonitor {
    pub fn new(sample_rate_hz: u32, config: MonitorConfig) -> Self {
        Self {
            config,
            sample_rate_hz,
            state: MonitorState::default(),
        }
    }

    pub fn needs_anchor(&self) -> bool {
        matches!(self.state.anchor_state, AnchorState::Startup | AnchorState::ReanchorRequired)
    }

    pub fn is_steady_state(&self) -> bool {
        matches!(self.state.anchor_state, AnchorState::SteadyState)
    }

    /// Monitor A — sample-integrity watchdog (spec §4.10). Any gap,
    /// packet loss, or nonzero gap duration invalidates the anchor
    /// immediately.
    pub fn check_sample_integrity(&mut self, gap_count: u32, packet_loss_pct: f64, gap_duration_ms: f64, now: f64) -> bool {
        if gap_count > 0 || packet_loss_pct > 0.0 || gap_duration_ms > 0.0 {
            self.invalidate_anchor(now);
            return false;
        }
        true
    }

    /// Monitor B — drift watchdog (spec §4.10). Returns the updated
    /// anchor state after applying the rule.
    pub fn check_drift_health(&mut self, drift_ppm: f64, confidence: f64, now: f64) -> bool {
        if confidence < 0.5 {
            return true;
        }
        if drift_ppm.abs() > self.config.drift_alarm_ppm {
            if matches!(self.state.anchor_state, AnchorState::SteadyState) {
                self.state.anchor_state = AnchorState::Holdover;
                self.state.holdover_since = Some(now);
            } else if let (AnchorState::Holdover, Some(since)) = (self.state.anchor_state, self.state.holdover_since) {
                if (now - since) / 60.0 > self.config.max_holdover_minutes {
                    self.invalidate_anchor(now);
                }
            }
            return false;
        }
        if matches!(self.state.anchor_state, AnchorState::Holdover) {
            self.state.anchor_state = AnchorState::SteadyState;
            self.state.holdover_since = None;
        }
        true
    }

    pub fn establish_anchor(&mut self, now: f64) {
        self.state.anchor_state = AnchorState::SteadyState;
        self.state.consecutive_verifications = 1;
        self.state.last_verification_time = Some(now);
        self.state.last_verification_error_ms = 0.0;
        self.state.holdover_since = None;
        self.state.total_reanchors += 1;
    }

    pub fn invalidate_anchor(&mut self, _now: f64) {
        self.state.anchor_state = AnchorState::ReanchorRequired;
        self.state.consecutive_verifications = 0;
        self.state.last_verification_time = None;
        self.state.holdover_since = None;
    }

    /// "Steel ruler" projection (spec §4.10): the expected sample
    /// position for `target_minute_unix` assuming the sample clock runs
    /// exactly at `sample_rate_hz / anchor.clock_ratio`.
    pub fn calculate_expected_sample(&self, anchor: &TimeSnapReference, target_minute_unix: i64) -> i64 {
        anchor.expected_sample(target_minute_unix)
    }

    /// Verifies a detection's actual sample position against the
    /// projection and updates state per spec §4.10's threshold ladder.
    pub fn verify_projection(&mut self, anchor: &TimeSnapReference, target_minute_unix: i64, actual_sample: i64, now: f64) -> VerificationResult {
        let expected_sample = self.calculate_expected_sample(anchor, target_minute_unix);
        let error_ms = (actual_sample - expected_sample) as f64 / self.sample_rate_hz as f64 * 1000.0;
        let abs_error = error_ms.abs();

        let result = VerificationResult {
            expected_sample,
            actual_sample,
            error_ms,
            within_jitter_threshold: abs_error <= self.config.jitter_threshold_ms,
            within_physics_threshold: abs_error <= self.config.physics_threshold_ms,
            requires_reanchor: abs_error > self.config.reanchor_threshold_ms,
        };

        if result.requires_reanchor {
            self.invalidate_anchor(now);
            return result;
        }

        self.state.verification_history.push(error_ms);
        if self.state.verification_history.len() > 10 {
            self.state.verification_history.remove(0);
        }
        self.state.last_verification_time = Some(now);
        self.state.last_verification_error_ms = error_ms;

        if result.within_jitter_threshold {
            self.state.consecutive_verifications += 1;
        } else if result.within_physics_threshold {
            if self.state.consecutive_verifications > 0 {
                self.state.consecutive_verifications -= 1;
            }
        } else {
            // PHYSICS_THRESHOLD_MS < |error| <= REANCHOR_THRESHOLD_MS
            self.state.consecutive_verifications = 0;
        }

        if matches!(self.state.anchor_state, AnchorState::Startup | AnchorState::ReanchorRequired)
            && self.state.consecutive_verifications >= self.config.min_verifications_for_steady
        {
            self.state.anchor_state = AnchorState::SteadyState;
        }

        result
    }
}
