//! Session boundary tracking (spec `SPEC_FULL.md` §2 addendum), grounded
//! on `original_source/src/hf_timestd/session_tracker.py`. Provenance
//! bookkeeping only: it appends to a JSONL sidecar and never touches
//! Phase 1 `.bin`/`.json` files.

use crate::paths::DataRoot;
use crate::types::{Channel, Discontinuity, DiscontinuityType};
use serde_json::json;
use std::io::Write;

/// Gaps shorter than this are ordinary restarts, not outages worth
/// recording.
const MIN_OFFLINE_GAP_SECONDS: f64 = 120.0;

pub struct SessionBoundaryTracker<'a> {
    data_root: &'a DataRoot,
    channel: Channel,
}

impl<'a> SessionBoundaryTracker<'a> {
    pub fn new(data_root: &'a DataRoot, channel: Channel) -> Self {
        Self { data_root, channel }
    }

    /// Looks for the last Phase 1 minute metadata file written for this
    /// channel and, if the gap to `current_start_unix` exceeds
    /// [`MIN_OFFLINE_GAP_SECONDS`], appends a `RecorderOffline`
    /// discontinuity record and returns it.
    pub fn check_for_offline_gap(&self, current_start_unix: f64) -> Option<Discontinuity> {
        let last_end = self.last_session_end_time()?;
        let gap = current_start_unix - last_end;
        if gap < MIN_OFFLINE_GAP_SECONDS {
            return None;
        }
        log::warn!(
            "recorder offline gap detected for {}: {:.2}h since last session",
            self.channel.dir_name(),
            gap / 3600.0
        );
        let discontinuity = Discontinuity {
            kind: DiscontinuityType::RecorderOffline,
            started_at_unix: last_end,
            ended_at_unix: current_start_unix,
            gap_seconds: gap,
        };
        self.append_record(&discontinuity);
        Some(discontinuity)
    }

    fn last_session_end_time(&self) -> Option<f64> {
        let channel_dir = self.data_root.raw_buffer_channel_dir(&self.channel);
        let mut latest: Option<(i64, std::path::PathBuf)> = None;
        for day in std::fs::read_dir(&channel_dir).ok()?.flatten() {
            if !day.path().is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(day.path()).ok()?.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if let Ok(ts) = stem.parse::<i64>() {
                        if latest.as_ref().map_or(true, |(best, _)| ts > *best) {
                            latest = Some((ts, path));
                        }
                    }
                }
            }
        }
        let (minute_boundary, path) = latest?;
        let text = std::fs::read_to_string(path).ok()?;
        let meta: serde_json::Value = serde_json::from_str(&text).ok()?;
        let samples_written = meta.get("samples_written")?.as_f64()?;
        let sample_rate = meta.get("sample_rate").and_then(|v| v.as_f64()).unwrap_or(20_000.0);
        Some(minute_boundary as f64 + samples_written / sample_rate)
    }

    fn append_record(&self, discontinuity: &Discontinuity) {
        let path = self.data_root.session_boundaries_path(&self.channel);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let record = json!({
            "channel": self.channel.dir_name(),
            "gap_type": "RECORDER_OFFLINE",
            "previous_session_end": discontinuity.started_at_unix,
            "current_session_start": discontinuity.ended_at_unix,
            "gap_duration_sec": discontinuity.gap_seconds,
        });
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{record}") {
                    log::error!("failed to append session boundary record: {e}");
                }
            }
            Err(e) => log::error!("failed to open session boundary log {path:?}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Station;
    use std::fs;

    fn write_minute_meta(root: &std::path::Path, channel: &Channel, minute: i64, samples_written: u32) {
        let data_root = DataRoot::new(root);
        let path = data_root.minute_json_path(channel, minute);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            serde_json::json!({"samples_written": samples_written, "sample_rate": 20_000}).to_string(),
        )
        .unwrap();
    }

    #[test]
    fn no_record_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let data_root = DataRoot::new(dir.path());
        let channel = Channel::new(Station::Wwv, 10_000_000);
        let tracker = SessionBoundaryTracker::new(&data_root, channel);
        assert!(tracker.check_for_offline_gap(1_700_000_000.0).is_none());
    }

    #[test]
    fn records_gap_exceeding_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Channel::new(Station::Wwv, 10_000_000);
        write_minute_meta(dir.path(), &channel, 0, 1_200_000);
        let data_root = DataRoot::new(dir.path());
        let tracker = SessionBoundaryTracker::new(&data_root, channel.clone());
        let result = tracker.check_for_offline_gap(10_000.0);
        assert!(result.is_some());
        assert_eq!(result.unwrap().kind, DiscontinuityType::RecorderOffline);
        assert!(data_root.session_boundaries_path(&channel).exists());
    }

    #[test]
    fn ignores_short_restart_gap() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Channel::new(Station::Wwv, 10_000_000);
        write_minute_meta(dir.path(), &channel, 0, 1_200_000);
        let data_root = DataRoot::new(dir.path());
        let tracker = SessionBoundaryTracker::new(&data_root, channel);
        assert!(tracker.check_for_offline_gap(90.0).is_none());
    }
}
