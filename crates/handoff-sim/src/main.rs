// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! handoff-sim - drive a handoff slot from an emulated audio driver.
//!
//! Runs a driver thread issuing periodic callbacks against a consumer thread
//! and prints a JSON summary of both sides.

use anyhow::Context;
use audio_handoff::config::{load_from_path, ConfigManager};
use audio_handoff::simulate::{ConsumerBehavior, DriverReport, DriverSim, ScriptedConsumer};
use audio_handoff::{CyclePacer, HandoffConfig, HandoffSlot, IoMode, StatsSnapshot};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Capture,
    Playback,
    Duplex,
}

impl From<Mode> for IoMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Capture => IoMode::Capture,
            Mode::Playback => IoMode::Playback,
            Mode::Duplex => IoMode::Duplex,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Capture)]
    mode: Mode,

    #[arg(long, default_value_t = 1024)]
    cycles: usize,

    /// Frames per callback (defaults to the slot capacity)
    #[arg(long)]
    frames: Option<u32>,

    #[arg(long, default_value_t = 4)]
    frame_bytes: usize,

    /// Microseconds between driver callbacks
    #[arg(long, default_value_t = 500)]
    period_us: u64,

    /// Output frames the consumer reports per cycle
    #[arg(long)]
    report_frames: Option<u32>,

    /// Consumer never releases; exercises stall recovery
    #[arg(long)]
    stall: bool,

    /// Pace the consumer to the buffer period (needs sample_rate in config)
    #[arg(long)]
    paced: bool,

    /// Config file instead of the per-user config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective config to the per-user config.toml and exit
    #[arg(long)]
    save_config: bool,
}

#[derive(Debug, Serialize)]
struct Summary {
    mode: IoMode,
    config: HandoffConfig,
    driver: DriverReport,
    slot: StatsSnapshot,
    observed: usize,
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("handoff_sim=info".parse()?)
                .add_directive("audio_handoff=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_from_path(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ConfigManager::new()?.load_config()?,
    };

    if args.save_config {
        let manager = ConfigManager::new()?;
        manager.save_config(&config)?;
        info!("Saved config to {}", manager.config_path().display());
        return Ok(());
    }

    let frames = args.frames.unwrap_or(config.capacity_frames);
    let mode = IoMode::from(args.mode);
    info!(
        "Simulating {} cycles of {} {} frames (capacity {})",
        args.cycles, frames, mode, config.capacity_frames
    );

    let slot: Arc<HandoffSlot> = Arc::from(HandoffSlot::try_boxed(config.clone())?);

    let behavior = if args.stall {
        ConsumerBehavior::Never
    } else if let Some(n) = args.report_frames {
        ConsumerBehavior::Report(n)
    } else {
        ConsumerBehavior::Passthrough
    };
    let mut consumer = ScriptedConsumer::new(behavior).frame_bytes(args.frame_bytes);
    if args.paced {
        match CyclePacer::from_config(&config) {
            Some(pacer) => consumer = consumer.paced(pacer),
            None => warn!("--paced needs sample_rate in the config, running unpaced"),
        }
    }
    let consumer = consumer
        .spawn(Arc::clone(&slot))
        .context("starting consumer thread")?;

    let driver = DriverSim::new(mode, frames)
        .cycles(args.cycles)
        .frame_bytes(args.frame_bytes)
        .period(Duration::from_micros(args.period_us))
        .spawn(Arc::clone(&slot))
        .context("starting driver thread")?
        .join()
        .map_err(|_| anyhow::anyhow!("driver thread panicked"))?;

    let observed = consumer.stop().len();
    let stats = slot.stats().snapshot();
    if stats.dropped_cycles() > 0 {
        warn!("{} cycles dropped by stall recovery", stats.dropped_cycles());
    }

    let summary = Summary {
        mode,
        config,
        driver,
        slot: stats,
        observed,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
