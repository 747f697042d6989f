//! Pipeline Orchestrator (C12, spec §4.12): per channel, wires the raw
//! archive writer (C3), tone detector + discriminator (C4/C5),
//! propagation/transmission solve (C6-C8), the shared calibrator (C9)
//! and monitor (C10), and the clock-offset writer (C11) together.

use crate::archive::{BinaryArchiveWriter, SessionBoundaryTracker};
use crate::calibrator::{self, TimingCalibrator};
use crate::clock_offset::{build_measurement, ClockOffsetSeries};
use crate::dsp::discriminator::{
    bcd, combine, detect_test_signal, estimate_doppler_hz, measure_station_id, power_ratio, stack_ticks, CombinerInputs,
};
use crate::dsp::{am_envelope, guard_band_noise_power, NotchBank};
use crate::dsp::tone_detector::ToneDetector;
use crate::monitor::GpsdoMonitor;
use crate::paths::DataRoot;
use crate::phase2::{self, ChannelCharacterisation};
use crate::types::{Channel, MinuteBuffer, Phase2Result, Station, TimeSnapReference, TimeSnapSource};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OrchestratorState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

struct AnalysisJob {
    buffer: MinuteBuffer,
}

/// Shared, process-wide collaborators passed to every channel's
/// orchestrator: the calibrator and monitor are process-wide singletons
/// per spec §5, never owned per channel.
pub struct SharedState {
    pub calibrator: Arc<Mutex<TimingCalibrator>>,
    pub monitor: Arc<Mutex<GpsdoMonitor>>,
}

pub struct ChannelOrchestrator {
    channel: Channel,
    archive_writer: BinaryArchiveWriter,
    buffer: Option<MinuteBuffer>,
    state: Arc<AtomicU8>,
    analysis_tx: crossbeam_channel::Sender<Option<AnalysisJob>>,
    worker: Option<std::thread::JoinHandle<()>>,
    pub results: crossbeam_channel::Receiver<Phase2Result>,
}

impl ChannelOrchestrator {
    pub fn new(
        data_root: Arc<DataRoot>,
        archive_writer: BinaryArchiveWriter,
        channel: Channel,
        sample_rate_hz: u32,
        receiver_grid: String,
        shared: Arc<SharedState>,
    ) -> Self {
        let csv_path = data_root.clock_offset_csv_path(&channel);
        let snapshot_path = data_root.clock_offset_snapshot_path(
            &channel,
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64,
        );
        let (analysis_tx, analysis_rx) = crossbeam_channel::unbounded::<Option<AnalysisJob>>();
        let (results_tx, results_rx) = crossbeam_channel::unbounded::<Phase2Result>();

        let worker = {
            let channel = channel.clone();
            let channel_key = channel.dir_name();
            std::thread::spawn(move || {
                let mut tone_detector = ToneDetector::new(sample_rate_hz);
                let mut clock_offset_series = ClockOffsetSeries::new(csv_path);
                let mut anchor: Option<TimeSnapReference> = None;
                let mut processed_since_snapshot = 0u32;

                while let Ok(Some(job)) = analysis_rx.recv() {
                    let result = run_analysis(
                        &channel,
                        &channel_key,
                        sample_rate_hz,
                        &receiver_grid,
                        &shared,
                        &mut tone_detector,
                        &mut anchor,
                        job.buffer,
                    );
                    let Some(result) = result else { continue };

                    let snr_db = result.discrimination.wwv_power_db.or(result.discrimination.wwvh_power_db);
                    let measurement = build_measurement(
                        &channel,
                        &result.discrimination,
                        result.propagation.as_ref(),
                        result.transmission.as_ref(),
                        result.minute_boundary_utc,
                        result.system_time,
                        snr_db,
                        None,
                        &result.processing_version,
                    );
                    if let Err(e) = clock_offset_series.append(measurement) {
                        log::warn!("failed to append clock-offset row for {channel_key}: {e}");
                    }
                    processed_since_snapshot += 1;
                    if processed_since_snapshot >= 60 {
                        processed_since_snapshot = 0;
                        if let Err(e) = clock_offset_series.write_snapshot(&snapshot_path) {
                            log::warn!("failed to write clock-offset snapshot for {channel_key}: {e}");
                        }
                    }
                    let _ = results_tx.send(result);
                }
                let _ = clock_offset_series.write_snapshot(&snapshot_path);
            })
        };

        Self {
            channel,
            archive_writer,
            buffer: None,
            state: Arc::new(AtomicU8::new(OrchestratorState::Idle as u8)),
            analysis_tx,
            worker: Some(worker),
            results: results_rx,
        }
    }

    pub fn start(&mut self) {
        self.state.store(OrchestratorState::Running as u8, Ordering::SeqCst);
    }

    pub fn state(&self) -> OrchestratorState {
        match self.state.load(Ordering::SeqCst) {
            1 => OrchestratorState::Starting,
            2 => OrchestratorState::Running,
            3 => OrchestratorState::Stopping,
            _ => OrchestratorState::Idle,
        }
    }

    /// `process_samples` (spec §4.12): writes to C3 first — never
    /// blocking on analysis — then accumulates an independent in-process
    /// minute buffer for the analysis worker.
    pub fn process_samples(&mut self, samples: &[num_complex::Complex32], rtp_timestamp: u64, wall_time_hint: f64, gap_samples_hint: u32) {
        self.archive_writer.write_samples(samples, rtp_timestamp, wall_time_hint, gap_samples_hint);
        self.accumulate(samples, rtp_timestamp, gap_samples_hint);
    }

    fn accumulate(&mut self, samples: &[num_complex::Complex32], rtp_timestamp: u64, gap_samples_hint: u32) {
        let unix_time = self.archive_writer.rtp_to_unix_time(rtp_timestamp);
        let minute_boundary = (unix_time / 60.0).floor() as i64 * 60;

        if self.buffer.as_ref().map(|b| b.minute_boundary_unix) != Some(minute_boundary) {
            if let Some(prev) = self.buffer.take() {
                self.enqueue(prev);
            }
            self.buffer = Some(MinuteBuffer::new(minute_boundary, rtp_timestamp, 0));
        }

        let buffer = self.buffer.as_mut().unwrap();
        if gap_samples_hint > 0 {
            buffer.gap_count += 1;
            buffer.gap_samples += gap_samples_hint;
        }
        let space = buffer.samples_remaining();
        let take = space.min(samples.len());
        if take > 0 {
            buffer.samples[buffer.write_pos..buffer.write_pos + take].copy_from_slice(&samples[..take]);
            buffer.write_pos += take;
        }
        if buffer.is_complete() {
            let done = self.buffer.take().unwrap();
            self.enqueue(done);
        }
    }

    fn enqueue(&self, buffer: MinuteBuffer) {
        let _ = self.analysis_tx.send(Some(AnalysisJob { buffer }));
    }

    /// Graceful shutdown (spec §4.12): flush C3, stop the analysis
    /// worker with a bounded wait, and drop the channel.
    pub fn stop(&mut self) {
        self.state.store(OrchestratorState::Stopping as u8, Ordering::SeqCst);
        self.archive_writer.flush();
        let _ = self.analysis_tx.send(None);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.state.store(OrchestratorState::Idle as u8, Ordering::SeqCst);
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

#[allow(clippy::too_many_arguments)]
fn run_analysis(
    channel: &Channel,
    channel_key: &str,
    sample_rate_hz: u32,
    receiver_grid: &str,
    shared: &SharedState,
    tone_detector: &mut ToneDetector,
    anchor: &mut Option<TimeSnapReference>,
    buffer: MinuteBuffer,
) -> Option<Phase2Result> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64();

    {
        let mut monitor = shared.monitor.lock();
        monitor.check_sample_integrity(buffer.gap_count, 0.0, buffer.gap_samples as f64 / sample_rate_hz as f64 * 1000.0, now);
    }

    let detections = tone_detector.process(buffer.minute_boundary_unix, &buffer.samples, buffer.start_rtp);
    let wwv = detections.iter().find(|d| d.station == Station::Wwv);
    let wwvh = detections.iter().find(|d| d.station == Station::Wwvh);

    let power = power_ratio(
        wwv.map(|d| d.snr_db),
        wwvh.map(|d| d.snr_db),
        wwv.map(|d| d.timing_error_ms),
        wwvh.map(|d| d.timing_error_ms),
    );

    let minute_of_hour = ((buffer.minute_boundary_unix / 60) % 60) as u32;
    let envelope = am_envelope(&buffer.samples);
    let signal_noise_floor = {
        let mean = envelope.iter().map(|v| v.abs()).sum::<f64>() / envelope.len().max(1) as f64;
        mean.max(1e-6)
    };
    let test_signal = detect_test_signal(&envelope, sample_rate_hz as f64, minute_of_hour, signal_noise_floor);

    // Spec §4.5.2: before M2 tick analysis and M3 440 Hz analysis, notch
    // out 440/500/600 Hz (Q=20) to suppress harmonic contamination
    // (500*2=1000, 600*2=1200, 440*3=1320) that would otherwise bias the
    // tick-SNR measurement. Noise floor for both methods comes from the
    // 825-875 Hz guard band, not a time-domain exclusion window.
    let fs = sample_rate_hz as f64;
    let mut notch = NotchBank::new(fs, &[440.0, 500.0, 600.0], 20.0);
    let notched_envelope = notch.apply(&envelope);
    let tick_noise_power = guard_band_noise_power(&notched_envelope, fs);

    let station_id = Some(measure_station_id(&notched_envelope, fs, minute_of_hour, tick_noise_power));

    // M2 (spec §4.5.3): stack ticks at seconds 1..59 for both stations'
    // fundamental tones over the notch-preprocessed envelope.
    let tick_offsets: Vec<usize> = (1..59).map(|s| s * sample_rate_hz as usize).collect();
    let wwv_ticks = stack_ticks(&notched_envelope, fs, 1000.0, &tick_offsets, tick_noise_power);
    let wwvh_ticks = stack_ticks(&notched_envelope, fs, 1200.0, &tick_offsets, tick_noise_power);
    let tick_ratio_db = if wwv_ticks.n_ticks > 0 && wwvh_ticks.n_ticks > 0 {
        Some(wwv_ticks.coherent_snr_db - wwvh_ticks.coherent_snr_db)
    } else {
        None
    };
    let doppler_hz = (wwv_ticks.phases_unwrapped.len() >= 2)
        .then(|| estimate_doppler_hz(&wwv_ticks.phases_unwrapped, 1.0).abs());

    // M4 (spec §4.5.4): Doppler-adaptive window, cross-correlated
    // against the BCD template for this minute-of-hour.
    let bcd_window_s = bcd::adaptive_window_seconds(doppler_hz);
    let bcd_result = bcd::cross_correlate_bcd(&envelope, fs, minute_of_hour, bcd_window_s).ok();
    let bcd_ratio_db = bcd_result.as_ref().and_then(|r| match (r.amplitude_wwv, r.amplitude_wwvh) {
        (Some(a), Some(b)) if a > 0.0 && b > 0.0 => Some(20.0 * (a.log10() - b.log10())),
        _ => None,
    });

    let combiner_inputs = CombinerInputs {
        minute_of_hour,
        carrier_ratio_db: power.power_ratio_db,
        tick_ratio_db,
        bcd_ratio_db,
        station_id,
        test_signal_detected: test_signal.detected,
        test_signal_station: test_signal.station,
        test_signal_confidence: test_signal.combined_confidence,
    };
    let discrimination = combine(&combiner_inputs, &power, buffer.minute_boundary_unix);

    // Anchor bookkeeping for the monitor's "steel ruler" projection
    // (spec §4.10): a verified WWV tick establishes or confirms it.
    if let Some(wwv_detection) = wwv.filter(|d| d.use_for_time_snap && d.confidence > 0.7) {
        let mut monitor = shared.monitor.lock();
        match anchor.as_ref() {
            None => {
                *anchor = Some(TimeSnapReference {
                    rtp_timestamp: buffer.start_rtp,
                    utc_timestamp: buffer.minute_boundary_unix as f64 + wwv_detection.peak_time_offset_s,
                    sample_rate: sample_rate_hz,
                    source: TimeSnapSource::WwvVerified,
                    confidence: wwv_detection.confidence,
                    established_at: now,
                    clock_ratio: 1.0,
                });
                monitor.establish_anchor(now);
            }
            Some(a) => {
                let actual_sample = a.rtp_timestamp as i64 + (buffer.start_rtp as i64 - a.rtp_timestamp as i64);
                let verification = monitor.verify_projection(a, buffer.minute_boundary_unix, actual_sample, now);
                if verification.requires_reanchor {
                    *anchor = None;
                }
            }
        }
    }

    if let Some(detection) = wwv.or(wwvh) {
        let mut calibrator = shared.calibrator.lock();
        let record = calibrator::Detection {
            channel_key: channel_key.to_string(),
            station: detection.station,
            frequency_hz: channel.frequency_hz,
            sample_rate: sample_rate_hz,
            snr_db: detection.snr_db,
            confidence: detection.confidence,
            minute_utc: buffer.minute_boundary_unix,
            rtp_timestamp: buffer.start_rtp,
            propagation_delay_ms: detection.timing_error_ms.abs(),
            is_ground_truth_minute: calibrator::is_ground_truth_minute(minute_of_hour),
            is_test_signal: test_signal.detected,
        };
        if let Err(e) = calibrator.update_from_detection(&record) {
            log::warn!("calibrator update failed for {channel_key}: {e}");
        }
    }

    let delay_spread_ms = bcd_result
        .as_ref()
        .and_then(|r| r.delay_spread_wwv_ms.or(r.delay_spread_wwvh_ms))
        .unwrap_or(0.5);
    let characterisation = ChannelCharacterisation {
        delay_spread_ms,
        doppler_std_hz: doppler_hz.unwrap_or(0.1),
        measured_delay_ms: wwv.or(wwvh).map(|d| d.timing_error_ms.abs()).unwrap_or(0.0),
        snr_db: wwv.or(wwvh).map(|d| d.snr_db).unwrap_or(0.0),
    };

    let arrival_time_utc = buffer.minute_boundary_unix as f64;
    let result = phase2::process_minute(
        channel,
        discrimination,
        characterisation,
        receiver_grid,
        arrival_time_utc,
        now,
        buffer.minute_boundary_unix,
    );
    Some(result)
}

/// Appends a recorder-offline gap to the session tracker before the
/// first write of a (re)started orchestrator, per spec §4.3's
/// provenance tracking.
pub fn record_startup_gap(data_root: &DataRoot, channel: &Channel, now_unix: i64) {
    let tracker = SessionBoundaryTracker::new(data_root, channel.clone());
    if let Some(gap) = tracker.check_for_offline_gap(now_unix as f64) {
        log::info!("recorded offline gap of {:.1}s for {}", gap.gap_seconds, channel.dir_name());
    }
}
