//! vision_streamd - detection streaming daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file + `VISION_*` overrides)
//! 2. Loads the configured detector backend once
//! 3. Serves live and uploaded-file streams with per-session counts
//! 4. Cancels every session and stops on Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use vision_counter::{StreamServer, StreamerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream annotated video with person/vehicle counts")]
struct Args {
    /// JSON config file.
    #[arg(long, env = "VISION_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file.
    #[arg(long, env = "VISION_ADDR")]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = StreamerConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    log::info!(
        "detector '{}' (confidence >= {}), live device {}{}",
        config.detector.backend,
        config.detector.confidence,
        config.capture.device_prefix,
        config.server.live_device
    );

    let context = config.pipeline_context()?;
    let handle = StreamServer::new(config.server.clone(), context).spawn()?;
    log::info!("vision_streamd serving on http://{}", handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping stream server...");
    handle.stop()?;
    Ok(())
}
