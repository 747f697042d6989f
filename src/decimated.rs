//! Decimated product buffer (C14, `SPEC_FULL.md` §2 addendum). Grounded
//! 1:1 on `original_source/src/hf_timestd/core/decimated_buffer.py`:
//! a per-day, per-channel flat binary file of 10 Hz IQ with a JSON
//! sidecar of per-minute `(d_clock_ms, uncertainty_ms, quality_grade,
//! gap_samples)`. C14 only stores whatever decimated vector the caller
//! hands it — it does not compute the decimation itself.

use crate::error::ArchiveError;
use crate::paths::DataRoot;
use crate::types::{Channel, DecimatedDayMetadata, DecimatedMinute, QualityGrade};
use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use nix::fcntl::{flock, FlockArg};
use num_complex::Complex32;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;

pub const SAMPLE_RATE_HZ: u32 = 10;
pub const SAMPLES_PER_MINUTE: usize = 600;
pub const SAMPLES_PER_DAY: usize = SAMPLES_PER_MINUTE * 1440;
const BYTES_PER_SAMPLE: usize = 8;

pub struct DecimatedBuffer<'a> {
    data_root: &'a DataRoot,
    channel: Channel,
}

impl<'a> DecimatedBuffer<'a> {
    pub fn new(data_root: &'a DataRoot, channel: Channel) -> Self {
        Self { data_root, channel }
    }

    /// Writes one minute of 10 Hz IQ, with an exclusive advisory lock
    /// held around the seek+write+unlock, per spec §5's shared-resource
    /// policy for Phase-3 day files.
    pub fn write_minute(
        &self,
        minute_utc: f64,
        decimated_iq: &[Complex32],
        d_clock_ms: f64,
        uncertainty_ms: f64,
        quality_grade: QualityGrade,
        gap_samples: u32,
    ) -> Result<(), ArchiveError> {
        let dt = DateTime::<Utc>::from_timestamp(minute_utc as i64, 0)
            .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap());
        let date = dt.date_naive();
        let minute_index = (dt.hour() * 60 + dt.minute()) as u16;

        let mut samples = decimated_iq.to_vec();
        samples.resize(SAMPLES_PER_MINUTE, Complex32::new(0.0, 0.0));

        let bin_path = self.data_root.decimated_day_bin_path(&self.channel, date);
        if let Some(parent) = bin_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !bin_path.exists() {
            Self::create_day_file(&bin_path)?;
        }

        let byte_offset = minute_index as u64 * SAMPLES_PER_MINUTE as u64 * BYTES_PER_SAMPLE as u64;
        let mut file = OpenOptions::new().read(true).write(true).open(&bin_path)?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(|e| {
            ArchiveError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })?;
        let result = (|| -> std::io::Result<()> {
            file.seek(SeekFrom::Start(byte_offset))?;
            let mut bytes = vec![0u8; SAMPLES_PER_MINUTE * BYTES_PER_SAMPLE];
            for (i, s) in samples.iter().enumerate() {
                let off = i * BYTES_PER_SAMPLE;
                LittleEndian::write_f32(&mut bytes[off..off + 4], s.re);
                LittleEndian::write_f32(&mut bytes[off + 4..off + 8], s.im);
            }
            file.write_all(&bytes)
        })();
        let _ = flock(file.as_raw_fd(), FlockArg::Unlock);
        result?;

        let mut metadata = self.load_metadata(&date)?;
        metadata.minutes.insert(
            minute_index,
            DecimatedMinute {
                minute_index,
                utc_timestamp: minute_utc,
                d_clock_ms,
                uncertainty_ms,
                quality_grade,
                gap_samples,
                valid: true,
            },
        );
        metadata.update_summary();
        self.save_metadata(&date, &metadata)?;
        Ok(())
    }

    pub fn read_minute(&self, minute_utc: f64) -> Result<Option<(Vec<Complex32>, DecimatedMinute)>, ArchiveError> {
        let dt = DateTime::<Utc>::from_timestamp(minute_utc as i64, 0)
            .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap());
        let date = dt.date_naive();
        let minute_index = (dt.hour() * 60 + dt.minute()) as u16;
        let bin_path = self.data_root.decimated_day_bin_path(&self.channel, date);
        if !bin_path.exists() {
            return Ok(None);
        }
        let byte_offset = minute_index as u64 * SAMPLES_PER_MINUTE as u64 * BYTES_PER_SAMPLE as u64;
        let mut file = OpenOptions::new().read(true).open(&bin_path)?;
        file.seek(SeekFrom::Start(byte_offset))?;
        let mut bytes = vec![0u8; SAMPLES_PER_MINUTE * BYTES_PER_SAMPLE];
        file.read_exact(&mut bytes)?;
        let mut samples = Vec::with_capacity(SAMPLES_PER_MINUTE);
        for i in 0..SAMPLES_PER_MINUTE {
            let off = i * BYTES_PER_SAMPLE;
            samples.push(Complex32::new(
                LittleEndian::read_f32(&bytes[off..off + 4]),
                LittleEndian::read_f32(&bytes[off + 4..off + 8]),
            ));
        }
        let metadata = self.load_metadata(&date)?;
        let Some(minute_meta) = metadata.minutes.get(&minute_index).cloned() else {
            return Ok(Some((samples, DecimatedMinute {
                minute_index,
                utc_timestamp: minute_utc,
                d_clock_ms: 0.0,
                uncertainty_ms: 999.0,
                quality_grade: QualityGrade::X,
                gap_samples: 0,
                valid: false,
            })));
        };
        Ok(Some((samples, minute_meta)))
    }

    fn create_day_file(bin_path: &std::path::Path) -> std::io::Result<()> {
        let zeros = vec![0u8; SAMPLES_PER_DAY * BYTES_PER_SAMPLE];
        std::fs::write(bin_path, zeros)?;
        log::info!("created decimated day file: {bin_path:?}");
        Ok(())
    }

    fn metadata_path(&self, date: &NaiveDate) -> std::path::PathBuf {
        self.data_root.decimated_day_meta_path(&self.channel, *date)
    }

    fn load_metadata(&self, date: &NaiveDate) -> Result<DecimatedDayMetadata, ArchiveError> {
        let path = self.metadata_path(date);
        if let Ok(text) = std::fs::read_to_string(&path) {
            if let Ok(meta) = serde_json::from_str(&text) {
                return Ok(meta);
            }
        }
        let start_utc = date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);
        Ok(DecimatedDayMetadata {
            channel: self.channel.dir_name(),
            date: date.format("%Y-%m-%d").to_string(),
            sample_rate: SAMPLE_RATE_HZ,
            samples_per_minute: SAMPLES_PER_MINUTE as u32,
            start_utc: start_utc as f64,
            minutes: Default::default(),
            valid_minutes: 0,
            total_gap_samples: 0,
            completeness_pct: 0.0,
        })
    }

    fn save_metadata(&self, date: &NaiveDate, metadata: &DecimatedDayMetadata) -> Result<(), ArchiveError> {
        let path = self.metadata_path(date);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(metadata)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Station;

    #[test]
    fn write_then_read_minute_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let data_root = DataRoot::new(dir.path());
        let channel = Channel::new(Station::Wwv, 10_000_000);
        let buffer = DecimatedBuffer::new(&data_root, channel);
        let samples: Vec<Complex32> = (0..SAMPLES_PER_MINUTE)
            .map(|i| Complex32::new(i as f32, -(i as f32)))
            .collect();
        buffer
            .write_minute(60.0, &samples, 1.5, 0.8, QualityGrade::A, 0)
            .unwrap();
        let (read_back, meta) = buffer.read_minute(60.0).unwrap().unwrap();
        assert_eq!(read_back, samples);
        assert!(meta.valid);
        assert_eq!(meta.minute_index, 1);
        assert_eq!(meta.quality_grade, QualityGrade::A);
    }

    #[test]
    fn short_vector_is_zero_padded() {
        let dir = tempfile::tempdir().unwrap();
        let data_root = DataRoot::new(dir.path());
        let channel = Channel::new(Station::Wwv, 10_000_000);
        let buffer = DecimatedBuffer::new(&data_root, channel);
        let samples = vec![Complex32::new(1.0, 1.0); 10];
        buffer
            .write_minute(0.0, &samples, 0.0, 0.0, QualityGrade::X, 0)
            .unwrap();
        let (read_back, _) = buffer.read_minute(0.0).unwrap().unwrap();
        assert_eq!(read_back.len(), SAMPLES_PER_MINUTE);
        assert_eq!(read_back[10], Complex32::new(0.0, 0.0));
    }

    #[test]
    fn missing_minute_returns_invalid_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let data_root = DataRoot::new(dir.path());
        let channel = Channel::new(Station::Wwv, 10_000_000);
        let buffer = DecimatedBuffer::new(&data_root, channel);
        assert!(buffer.read_minute(120.0).unwrap().is_none());
    }
}
