//! CLI entry point (spec §6.4): wires CLI flags to `SystemConfig`,
//! starts the recorder against a statically-configured channel list,
//! and shuts down gracefully on SIGINT/SIGTERM.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use hf_timestd::config::{self, SystemConfig};
use hf_timestd::paths::DataRoot;
use hf_timestd::recorder::Recorder;
use hf_timestd::rtp::ChannelDiscovery;
use hf_timestd::types::ChannelInfo;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// GPSDO-disciplined HF time-transfer receiver.
#[derive(Debug, Parser)]
#[command(name = "hf-timestd", version, about)]
struct Cli {
    /// Root directory for raw archive, phase2, and calibration state.
    #[arg(long, default_value = "/var/lib/hf-timestd")]
    data_root: PathBuf,

    /// Path to a JSON `SystemConfig` overriding the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maidenhead grid locator of the receive antenna, used by the
    /// propagation solver (C6) to compute great-circle distance.
    #[arg(long, default_value = "DM79")]
    receiver_grid: String,

    /// One channel to receive, repeatable: `multicast:port:freq_hz:sample_rate`.
    #[arg(long = "channel", value_name = "MCAST:PORT:FREQ_HZ:RATE")]
    channels: Vec<String>,

    /// Validate configuration and channel list, then exit without
    /// starting any receive threads.
    #[arg(long)]
    dry_run: bool,
}

/// Discovers channels from the CLI's static `--channel` flags. Real
/// discovery protocols (spec §6.2 leaves the adapter unspecified) can
/// implement the same `ChannelDiscovery` trait against a directory
/// service instead.
struct StaticChannelDiscovery {
    channels: Vec<ChannelInfo>,
}

impl ChannelDiscovery for StaticChannelDiscovery {
    fn discover(&mut self) -> Result<Vec<ChannelInfo>> {
        Ok(self.channels.clone())
    }
}

fn parse_channel_spec(spec: &str, ssrc: u32) -> Result<ChannelInfo> {
    let parts: Vec<&str> = spec.split(':').collect();
    let [mcast, port, freq, rate] = parts.as_slice() else {
        return Err(anyhow!("channel spec '{spec}' must be MCAST:PORT:FREQ_HZ:RATE"));
    };
    Ok(ChannelInfo {
        ssrc,
        multicast: mcast.parse::<Ipv4Addr>().context("parsing multicast address")?,
        port: port.parse().context("parsing port")?,
        frequency_hz: freq.parse().context("parsing frequency_hz")?,
        sample_rate: rate.parse().context("parsing sample_rate")?,
    })
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => SystemConfig::default(),
    };

    let channel_infos: Vec<ChannelInfo> = cli
        .channels
        .iter()
        .enumerate()
        .map(|(i, spec)| parse_channel_spec(spec, i as u32 + 1))
        .collect::<Result<_>>()?;

    if channel_infos.is_empty() {
        log::error!("no channels configured; pass at least one --channel MCAST:PORT:FREQ_HZ:RATE");
        return Ok(2);
    }

    if cli.dry_run {
        log::info!("dry run: {} channel(s) parsed ok, config valid", channel_infos.len());
        return Ok(0);
    }

    let data_root = DataRoot::new(cli.data_root);
    let mut recorder = Recorder::new(data_root, &config)?;
    let mut discovery = StaticChannelDiscovery { channels: channel_infos };
    recorder.start(&mut discovery, cli.receiver_grid, config.rtp.resequence_depth)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            log::info!("shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("installing signal handler")?;
    }

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(500));
    }

    log::info!("shutting down");
    recorder.stop(Duration::from_secs(5));
    Ok(0)
}

fn main() {
    env_logger::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log::error!("fatal: {e:#}");
            std::process::exit(1);
        }
    }
}
