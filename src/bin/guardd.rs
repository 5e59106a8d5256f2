//! guardd - RAIV guard daemon
//!
//! Runs one worker per configured camera, polls vehicle telemetry, and sends
//! at most one emergency stop per direction per movement segment.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use raiv_guard::{GuardConfig, GuardRuntime};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera obstruction monitor and emergency-stop dispatcher")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension). Built-in defaults if omitted.
    #[arg(long, env = "GUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = GuardConfig::load_from(args.config.as_deref())?;
    for camera in &cfg.cameras {
        log::info!(
            "{}: {} source={} {}x{}@{} facing={:?}",
            camera.id,
            camera.role,
            camera.source,
            camera.width,
            camera.height,
            camera.target_fps,
            camera.facing
        );
    }
    if args.check {
        log::info!("configuration ok");
        return Ok(());
    }

    let guard = GuardRuntime::new(cfg).start()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("guardd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping cameras...");
    for (id, stats) in guard.stop() {
        log::info!(
            "{}: {} frames, {} confirmations, {} stops",
            id,
            stats.frames,
            stats.confirmations,
            stats.stops_requested
        );
    }
    Ok(())
}
