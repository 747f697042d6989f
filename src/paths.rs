//! On-disk layout helpers (spec §6.3).

use crate::types::Channel;
use chrono::{NaiveDate, TimeZone, Utc};
use std::path::PathBuf;

pub struct DataRoot {
    root: PathBuf,
}

impl DataRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn raw_buffer_channel_dir(&self, channel: &Channel) -> PathBuf {
        self.root.join("raw_buffer").join(channel.dir_name())
    }

    pub fn raw_buffer_day_dir(&self, channel: &Channel, minute_boundary_unix: i64) -> PathBuf {
        let date = day_string(minute_boundary_unix);
        self.raw_buffer_channel_dir(channel).join(date)
    }

    pub fn minute_bin_path(&self, channel: &Channel, minute_boundary_unix: i64) -> PathBuf {
        self.raw_buffer_day_dir(channel, minute_boundary_unix)
            .join(format!("{minute_boundary_unix}.bin"))
    }

    pub fn minute_json_path(&self, channel: &Channel, minute_boundary_unix: i64) -> PathBuf {
        self.raw_buffer_day_dir(channel, minute_boundary_unix)
            .join(format!("{minute_boundary_unix}.json"))
    }

    pub fn session_boundaries_path(&self, channel: &Channel) -> PathBuf {
        self.raw_buffer_channel_dir(channel)
            .join("session_boundaries.jsonl")
    }

    pub fn phase2_channel_dir(&self, channel: &Channel) -> PathBuf {
        self.root
            .join("phase2")
            .join(channel.dir_name())
            .join("clock_offset")
    }

    pub fn clock_offset_csv_path(&self, channel: &Channel) -> PathBuf {
        self.phase2_channel_dir(channel)
            .join("clock_offset_series.csv")
    }

    pub fn clock_offset_snapshot_path(&self, channel: &Channel, started_at_unix: i64) -> PathBuf {
        let stamp = Utc
            .timestamp_opt(started_at_unix, 0)
            .single()
            .expect("valid timestamp")
            .format("%Y%m%d_%H%M%S");
        self.phase2_channel_dir(channel)
            .join(format!("clock_offset_{stamp}.json"))
    }

    pub fn calibration_state_path(&self) -> PathBuf {
        self.root.join("state").join("timing_calibration.json")
    }

    pub fn decimated_day_dir(&self, channel: &Channel) -> PathBuf {
        self.root.join("decimated").join(channel.dir_name())
    }

    pub fn decimated_day_bin_path(&self, channel: &Channel, date: NaiveDate) -> PathBuf {
        self.decimated_day_dir(channel)
            .join(format!("{}.bin", date.format("%Y%m%d")))
    }

    pub fn decimated_day_meta_path(&self, channel: &Channel, date: NaiveDate) -> PathBuf {
        self.decimated_day_dir(channel)
            .join(format!("{}.json", date.format("%Y%m%d")))
    }
}

fn day_string(minute_boundary_unix: i64) -> String {
    Utc.timestamp_opt(minute_boundary_unix, 0)
        .single()
        .expect("valid timestamp")
        .format("%Y%m%d")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Station;

    #[test]
    fn channel_dir_replaces_spaces() {
        let ch = Channel::new(Station::Wwv, 10_000_000);
        assert_eq!(ch.dir_name(), "WWV_10.0_MHz");
    }

    #[test]
    fn minute_bin_path_is_day_scoped() {
        let root = DataRoot::new("/data");
        let ch = Channel::new(Station::Wwv, 10_000_000);
        let p = root.minute_bin_path(&ch, 60);
        assert!(p.to_string_lossy().contains("19700101"));
        assert!(p.to_string_lossy().ends_with("60.bin"));
    }
}
