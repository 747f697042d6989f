//! Diagnostic reader for Phase 1 raw-archive minute files: prints the
//! metadata sidecar and a handful of summary stats for one minute, or
//! the latest complete minute if none is given.

use anyhow::{Context, Result};
use clap::Parser;
use hf_timestd::archive::BinaryArchiveReader;
use hf_timestd::paths::DataRoot;
use hf_timestd::types::{Channel, Station};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Parser)]
#[command(name = "archive-inspect", about = "Inspect Phase 1 raw-archive minute files")]
struct Cli {
    #[arg(long)]
    data_root: PathBuf,

    #[arg(long, value_enum)]
    station: StationArg,

    #[arg(long)]
    frequency_hz: u64,

    /// Unix minute boundary to inspect; defaults to the latest complete minute.
    #[arg(long)]
    minute: Option<i64>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum StationArg {
    Wwv,
    Wwvh,
    Chu,
}

impl From<StationArg> for Station {
    fn from(s: StationArg) -> Self {
        match s {
            StationArg::Wwv => Station::Wwv,
            StationArg::Wwvh => Station::Wwvh,
            StationArg::Chu => Station::Chu,
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let data_root = DataRoot::new(cli.data_root);
    let channel = Channel::new(cli.station.into(), cli.frequency_hz);

    let minute = match cli.minute {
        Some(m) => m,
        None => {
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
            BinaryArchiveReader::latest_complete_minute(&data_root, &channel, now)
                .context("no complete minute found for this channel")?
        }
    };

    let bin_path = data_root.minute_bin_path(&channel, minute);
    let json_path = data_root.minute_json_path(&channel, minute);

    let metadata_text = std::fs::read_to_string(&json_path).with_context(|| format!("reading {}", json_path.display()))?;
    let metadata: serde_json::Value = serde_json::from_str(&metadata_text)?;
    println!("{}", serde_json::to_string_pretty(&metadata)?);

    let samples = BinaryArchiveReader::read_minute(&bin_path).with_context(|| format!("reading {}", bin_path.display()))?;
    let peak = samples.iter().map(|s| s.norm()).fold(0.0_f32, f32::max);
    let rms = (samples.iter().map(|s| s.norm_sqr()).sum::<f32>() / samples.len().max(1) as f32).sqrt();
    println!("samples: {}", samples.len());
    println!("peak magnitude: {peak:.4}");
    println!("rms magnitude: {rms:.4}");
    Ok(())
}
