//! Binary archive writer/reader (C3): minute-aligned raw IQ storage.
//! Write-once — Phase 1 files are never mutated after a minute seals,
//! per the crate's non-goal on reprocessing raw archive data.

use crate::archive::disk_writer::{AsyncDiskWriter, Priority, WriteRequest};
use crate::error::ArchiveError;
use crate::paths::DataRoot;
use crate::types::{Channel, MinuteBuffer, SAMPLES_PER_MINUTE};
use byteorder::{ByteOrder, LittleEndian};
use chrono::Utc;
use memmap2::Mmap;
use num_complex::Complex32;
use serde_json::json;
use std::fs::File;
use std::sync::Arc;

/// Writes minute-aligned IQ to disk via the shared `AsyncDiskWriter`
/// (C2). Establishes the RTP-to-Unix anchor exactly once per writer
/// lifetime, per spec §4.3.
pub struct BinaryArchiveWriter {
    data_root: Arc<DataRoot>,
    disk_writer: Arc<AsyncDiskWriter>,
    channel: Channel,
    sample_rate: u32,
    rtp_to_unix_offset: Option<f64>,
    current: Option<MinuteBuffer>,
    pub write_errors: u64,
}

impl BinaryArchiveWriter {
    pub fn new(data_root: Arc<DataRoot>, disk_writer: Arc<AsyncDiskWriter>, channel: Channel, sample_rate: u32) -> Self {
        Self {
            data_root,
            disk_writer,
            channel,
            sample_rate,
            rtp_to_unix_offset: None,
            current: None,
            write_errors: 0,
        }
    }

    /// Converts an extended (wrap-tracked) RTP timestamp to Unix time
    /// using the anchor established on the first call. Idempotent for a
    /// fixed anchor (P4).
    pub fn rtp_to_unix_time(&self, rtp_timestamp: u64) -> f64 {
        let offset = self.rtp_to_unix_offset.unwrap_or(0.0);
        rtp_timestamp as f64 / self.sample_rate as f64 + offset
    }

    /// Writes `samples` starting at `rtp_timestamp`, returning the
    /// number of samples actually written (spec §4.3 contract).
    pub fn write_samples(
        &mut self,
        samples: &[Complex32],
        rtp_timestamp: u64,
        wall_time_hint: f64,
        gap_samples_hint: u32,
    ) -> usize {
        if self.rtp_to_unix_offset.is_none() {
            self.rtp_to_unix_offset = Some(wall_time_hint - rtp_timestamp as f64 / self.sample_rate as f64);
        }

        let mut written = 0usize;
        let mut rtp_cursor = rtp_timestamp;
        let mut remaining = samples;

        if gap_samples_hint > 0 {
            if let Some(buf) = self.current.as_mut() {
                buf.gap_count += 1;
                buf.gap_samples += gap_samples_hint;
            }
        }

        while !remaining.is_empty() {
            let sample_unix_time = self.rtp_to_unix_time(rtp_cursor);
            let sample_minute = (sample_unix_time / 60.0).floor() as i64 * 60;

            if self.current.is_none() {
                let offset_in_minute =
                    ((sample_unix_time - sample_minute as f64) * self.sample_rate as f64).round() as usize;
                self.current = Some(MinuteBuffer::new(
                    sample_minute,
                    rtp_cursor.saturating_sub(offset_in_minute as u64),
                    offset_in_minute.min(SAMPLES_PER_MINUTE),
                ));
            } else if sample_minute > self.current.as_ref().unwrap().minute_boundary_unix {
                self.seal_and_enqueue();
                self.current = Some(MinuteBuffer::new(sample_minute, rtp_cursor, 0));
            }

            let buf = self.current.as_mut().unwrap();
            let space = buf.samples_remaining();
            let take = space.min(remaining.len());
            let start = buf.write_pos;
            buf.samples[start..start + take].copy_from_slice(&remaining[..take]);
            buf.write_pos += take;
            written += take;
            rtp_cursor += take as u64;
            remaining = &remaining[take..];

            if buf.is_complete() {
                self.seal_and_enqueue();
            }
        }
        written
    }

    fn seal_and_enqueue(&mut self) {
        let Some(buf) = self.current.take() else {
            return;
        };
        let bin_path = self.data_root.minute_bin_path(&self.channel, buf.minute_boundary_unix);
        let json_path = self.data_root.minute_json_path(&self.channel, buf.minute_boundary_unix);

        let mut bytes = Vec::with_capacity(buf.samples.len() * 8);
        for s in &buf.samples {
            let mut tmp = [0u8; 8];
            LittleEndian::write_f32(&mut tmp[0..4], s.re);
            LittleEndian::write_f32(&mut tmp[4..8], s.im);
            bytes.extend_from_slice(&tmp);
        }

        let samples_written = buf.write_pos.min(SAMPLES_PER_MINUTE) as u32;
        let completeness_pct =
            100.0 * (SAMPLES_PER_MINUTE as f64 - buf.gap_samples as f64) / SAMPLES_PER_MINUTE as f64;

        let metadata = json!({
            "minute_boundary": buf.minute_boundary_unix,
            "channel_name": self.channel.dir_name(),
            "frequency_hz": self.channel.frequency_hz,
            "sample_rate": self.sample_rate,
            "samples_written": samples_written,
            "samples_expected": SAMPLES_PER_MINUTE as u32,
            "completeness_pct": completeness_pct,
            "gap_count": buf.gap_count,
            "gap_samples": buf.gap_samples,
            "start_rtp_timestamp": buf.start_rtp,
            "dtype": "complex64",
            "byte_order": "little",
            "written_at": Utc::now().to_rfc3339(),
            "station": { "hint": self.channel.station_hint.as_str() },
        });

        let ok = self.disk_writer.queue_write(WriteRequest {
            priority: Priority(0),
            blob_path: bin_path,
            metadata_path: json_path,
            bytes,
            metadata,
        });
        if !ok {
            self.write_errors += 1;
            log::warn!(
                "archive write dropped for minute {} of {}: disk queue full",
                buf.minute_boundary_unix,
                self.channel.dir_name()
            );
        }
    }

    /// Seals whatever minute is in progress without waiting for it to
    /// fill, used on shutdown.
    pub fn flush(&mut self) {
        self.seal_and_enqueue();
    }
}

/// Reads sealed minute files by memory map. Fixed record size makes the
/// mapping exact (P2).
pub struct BinaryArchiveReader;

impl BinaryArchiveReader {
    /// Returns a copy of the samples in `path`, or `ArchiveError` if the
    /// file is missing/truncated beyond what a zero-padded minute allows.
    pub fn read_minute(path: &std::path::Path) -> Result<Vec<Complex32>, ArchiveError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let n = mmap.len() / 8;
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let off = i * 8;
            let re = LittleEndian::read_f32(&mmap[off..off + 4]);
            let im = LittleEndian::read_f32(&mmap[off + 4..off + 8]);
            out.push(Complex32::new(re, im));
        }
        Ok(out)
    }

    /// Latest complete minute boundary, preferring `now - 60s` if that
    /// minute's file exists, else falling back to a directory scan.
    pub fn latest_complete_minute(data_root: &DataRoot, channel: &Channel, now_unix: i64) -> Option<i64> {
        let candidate = (now_unix / 60 - 1) * 60;
        if data_root.minute_bin_path(channel, candidate).exists() {
            return Some(candidate);
        }
        let dir = data_root.raw_buffer_channel_dir(channel);
        let mut best: Option<i64> = None;
        for day in std::fs::read_dir(&dir).ok()?.flatten() {
            if !day.path().is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(day.path()).ok()?.flatten() {
                if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                    if entry.path().extension().and_then(|e| e.to_str()) == Some("bin") {
                        if let Ok(ts) = stem.parse::<i64>() {
                            best = Some(best.map_or(ts, |b| b.max(ts)));
                        }
                    }
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Station;
    use std::time::Duration;

    fn make_writer(root: &std::path::Path) -> BinaryArchiveWriter {
        let data_root = Arc::new(DataRoot::new(root));
        let disk_writer = Arc::new(AsyncDiskWriter::start(16, 1));
        let channel = Channel::new(Station::Wwv, 10_000_000);
        BinaryArchiveWriter::new(data_root, disk_writer, channel, 20_000)
    }

    #[test]
    fn anchor_established_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = make_writer(dir.path());
        writer.write_samples(&[Complex32::new(0.0, 0.0); 10], 0, 1_700_000_000.0, 0);
        let anchor = writer.rtp_to_unix_offset.unwrap();
        writer.write_samples(&[Complex32::new(0.0, 0.0); 10], 10, 999_999_999.0, 0);
        assert_eq!(writer.rtp_to_unix_offset.unwrap(), anchor);
    }

    #[test]
    fn seals_minute_at_exact_sample_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = make_writer(dir.path());
        let samples = vec![Complex32::new(1.0, -1.0); SAMPLES_PER_MINUTE];
        writer.write_samples(&samples, 0, 0.0, 0);
        assert!(writer.current.is_none());
    }

    #[test]
    fn overflow_spills_into_next_minute() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = make_writer(dir.path());
        let samples = vec![Complex32::new(1.0, -1.0); SAMPLES_PER_MINUTE + 1000];
        writer.write_samples(&samples, 0, 0.0, 0);
        let buf = writer.current.as_ref().unwrap();
        assert_eq!(buf.minute_boundary_unix, 60);
        assert_eq!(buf.write_pos, 1000);
    }

    #[test]
    fn round_trips_written_samples() {
        let dir = tempfile::tempdir().unwrap();
        let data_root = DataRoot::new(dir.path());
        let disk_writer = Arc::new(AsyncDiskWriter::start(16, 1));
        let channel = Channel::new(Station::Wwv, 10_000_000);
        let mut writer = BinaryArchiveWriter::new(Arc::new(DataRoot::new(dir.path())), Arc::clone(&disk_writer), channel.clone(), 20_000);
        let samples: Vec<Complex32> = (0..SAMPLES_PER_MINUTE).map(|i| Complex32::new(i as f32, -(i as f32))).collect();
        writer.write_samples(&samples, 0, 0.0, 0);
        drop(writer);
        Arc::try_unwrap(disk_writer).ok().unwrap().stop(Duration::from_secs(5));
        let path = data_root.minute_bin_path(&channel, 0);
        let read_back = BinaryArchiveReader::read_minute(&path).unwrap();
        assert_eq!(read_back, samples);
    }
}
