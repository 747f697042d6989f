//! Recorder (C13): discovers channels via a `ChannelDiscovery` adapter,
//! spawns one blocking RTP-receive thread per channel that owns and
//! drives that channel's `ChannelOrchestrator`, and aggregates status
//! for the process's health surface.

use crate::archive::{AsyncDiskWriter, BinaryArchiveWriter};
use crate::calibrator::TimingCalibrator;
use crate::config::SystemConfig;
use crate::monitor::GpsdoMonitor;
use crate::orchestrator::{record_startup_gap, ChannelOrchestrator, SharedState};
use crate::paths::DataRoot;
use crate::rtp::{ChannelDiscovery, RtpNetwork, RtpReceiver, RtpSocketImpl};
use crate::types::{Channel, ChannelInfo, Station};
use parking_lot::Mutex as PLMutex;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Maps a channel's frequency to a station hint purely for directory
/// naming; the discriminator (C5) is the actual source of truth for
/// which station a channel is carrying minute to minute.
fn station_hint_for_frequency(frequency_hz: u64) -> Station {
    const WWV_FREQS_HZ: [u64; 5] = [2_500_000, 5_000_000, 10_000_000, 15_000_000, 20_000_000];
    const WWVH_FREQS_HZ: [u64; 4] = [2_500_000, 5_000_000, 10_000_000, 15_000_000];
    const CHU_FREQS_HZ: [u64; 3] = [3_330_000, 7_850_000, 14_670_000];
    if CHU_FREQS_HZ.contains(&frequency_hz) {
        Station::Chu
    } else if WWV_FREQS_HZ.contains(&frequency_hz) || WWVH_FREQS_HZ.contains(&frequency_hz) {
        Station::Wwv
    } else {
        Station::Unknown
    }
}

/// Per-channel status surfaced to the diagnostic CLI (spec §6.4).
#[derive(Debug, Clone, Default)]
pub struct ChannelStatus {
    pub channel_key: String,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub late_dropped: u64,
    pub last_rtp_timestamp_ext: u64,
}

#[derive(Default)]
struct ReceiveStats {
    packets_received: AtomicU64,
    packets_lost: AtomicU64,
    late_dropped: AtomicU64,
    last_rtp_timestamp_ext: AtomicU64,
}

struct ChannelRuntime {
    channel_key: String,
    stats: Arc<ReceiveStats>,
    stop_flag: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<ChannelOrchestrator>>,
}

/// Extends a wrapping `u32` RTP timestamp into a monotonically
/// increasing `u64`, the same "extend-then-compare" trick `RtpReceiver`
/// applies to sequence numbers (spec §4.1, §4.3).
struct TimestampExtender {
    last_raw: Option<u32>,
    high: u64,
}

impl TimestampExtender {
    fn new() -> Self {
        Self { last_raw: None, high: 0 }
    }

    fn extend(&mut self, raw: u32) -> u64 {
        match self.last_raw {
            None => {
                self.last_raw = Some(raw);
                raw as u64
            }
            Some(last) => {
                if raw < last && (last - raw) > (u32::MAX / 2) {
                    self.high += 1u64 << 32;
                }
                self.last_raw = Some(raw);
                self.high + raw as u64
            }
        }
    }
}

pub struct Recorder {
    data_root: Arc<DataRoot>,
    disk_writer: Arc<AsyncDiskWriter>,
    shared: Arc<SharedState>,
    channels: Vec<ChannelRuntime>,
}

impl Recorder {
    pub fn new(data_root: DataRoot, config: &SystemConfig) -> anyhow::Result<Self> {
        let data_root = Arc::new(data_root);
        let disk_writer = Arc::new(AsyncDiskWriter::start(config.disk_writer.queue_depth, config.disk_writer.num_workers));
        let calibrator = TimingCalibrator::new(data_root.calibration_state_path(), config.calibrator.clone())?;
        let monitor = GpsdoMonitor::new(config.rtp.sample_rate_hz, config.monitor.clone());
        let shared = Arc::new(SharedState {
            calibrator: Arc::new(PLMutex::new(calibrator)),
            monitor: Arc::new(PLMutex::new(monitor)),
        });
        Ok(Self {
            data_root,
            disk_writer,
            shared,
            channels: Vec::new(),
        })
    }

    /// Discovers channels, then for each one: records a startup-gap
    /// marker, builds the archive writer and orchestrator, and spawns
    /// its blocking receive thread (spec §5's "T₁ per channel").
    pub fn start(&mut self, discovery: &mut dyn ChannelDiscovery, receiver_grid: String, resequence_depth: usize) -> anyhow::Result<()> {
        let channel_infos = discovery.discover()?;
        let now_unix = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;

        for info in channel_infos {
            self.start_channel(info, receiver_grid.clone(), resequence_depth, now_unix)?;
        }
        Ok(())
    }

    fn start_channel(&mut self, info: ChannelInfo, receiver_grid: String, resequence_depth: usize, now_unix: i64) -> anyhow::Result<()> {
        let station_hint = station_hint_for_frequency(info.frequency_hz);
        let channel = Channel::new(station_hint, info.frequency_hz);
        let channel_key = channel.dir_name();

        record_startup_gap(&self.data_root, &channel, now_unix);

        let archive_writer = BinaryArchiveWriter::new(Arc::clone(&self.data_root), Arc::clone(&self.disk_writer), channel.clone(), info.sample_rate);
        let mut orchestrator = ChannelOrchestrator::new(
            Arc::clone(&self.data_root),
            archive_writer,
            channel.clone(),
            info.sample_rate,
            receiver_grid,
            Arc::clone(&self.shared),
        );
        orchestrator.start();

        let socket = RtpSocketImpl::bind(info.multicast, info.port, Ipv4Addr::UNSPECIFIED)?;
        let network_receiver = RtpReceiver::new(socket, resequence_depth);

        let stats = Arc::new(ReceiveStats::default());
        let stop_flag = Arc::new(AtomicBool::new(false));
        let handle = spawn_receive_loop(network_receiver, orchestrator, channel_key.clone(), Arc::clone(&stats), Arc::clone(&stop_flag));

        self.channels.push(ChannelRuntime {
            channel_key,
            stats,
            stop_flag,
            handle: Some(handle),
        });
        Ok(())
    }

    pub fn status(&self) -> Vec<ChannelStatus> {
        self.channels
            .iter()
            .map(|c| ChannelStatus {
                channel_key: c.channel_key.clone(),
                packets_received: c.stats.packets_received.load(Ordering::Relaxed),
                packets_lost: c.stats.packets_lost.load(Ordering::Relaxed),
                late_dropped: c.stats.late_dropped.load(Ordering::Relaxed),
                last_rtp_timestamp_ext: c.stats.last_rtp_timestamp_ext.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Graceful shutdown (spec §4.12, §5): signal every receive thread
    /// to stop, join them to reclaim each orchestrator, flush/stop each
    /// one, then stop the shared disk writer once every channel has
    /// released its `Arc`.
    pub fn stop(self, per_channel_timeout: Duration) {
        for channel in &self.channels {
            channel.stop_flag.store(true, Ordering::SeqCst);
        }
        let _ = per_channel_timeout;
        for mut channel in self.channels {
            if let Some(handle) = channel.handle.take() {
                match handle.join() {
                    Ok(mut orchestrator) => orchestrator.stop(),
                    Err(_) => log::error!("receive thread for {} panicked", channel.channel_key),
                }
            }
        }
        match Arc::try_unwrap(self.disk_writer) {
            Ok(writer) => writer.stop(Duration::from_secs(5)),
            Err(_) => log::warn!("disk writer still referenced at shutdown; skipping graceful drain"),
        }
    }
}

fn spawn_receive_loop<N: RtpNetwork + Send + 'static>(
    mut receiver: RtpReceiver<N>,
    mut orchestrator: ChannelOrchestrator,
    channel_key: String,
    stats: Arc<ReceiveStats>,
    stop_flag: Arc<AtomicBool>,
) -> std::thread::JoinHandle<ChannelOrchestrator> {
    std::thread::spawn(move || {
        let mut extender = TimestampExtender::new();
        while !stop_flag.load(Ordering::Relaxed) {
            match receiver.recv_batch() {
                Ok(Some(batch)) => {
                    stats.packets_received.store(receiver.stats.packets_received, Ordering::Relaxed);
                    stats.packets_lost.store(receiver.stats.packets_lost, Ordering::Relaxed);
                    stats.late_dropped.store(receiver.stats.late_dropped, Ordering::Relaxed);
                    let ext_rtp = extender.extend(batch.rtp_timestamp);
                    stats.last_rtp_timestamp_ext.store(ext_rtp, Ordering::Relaxed);
                    orchestrator.process_samples(&batch.samples, ext_rtp, batch.arrival_wall_time, batch.gap_samples_before);
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("rtp receive error on {channel_key}: {e}");
                    break;
                }
            }
        }
        orchestrator
    })
}
