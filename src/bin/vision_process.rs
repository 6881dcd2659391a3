//! vision_process - run one detection session offline
//!
//! Reads a video file or capture device, writes the annotated frames to an
//! MJPEG file, and prints the per-frame counts as JSON lines on stdout.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use vision_counter::{
    ClientDisconnected, SessionId, SessionPipeline, SessionState, StreamerConfig, VideoSource,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Annotate a video and print per-frame counts")]
struct Args {
    /// Video file to process.
    #[arg(long, conflicts_with = "device")]
    file: Option<PathBuf>,

    /// Capture device index.
    #[arg(long)]
    device: Option<u32>,

    /// Annotated output (concatenated JPEG frames).
    #[arg(long, default_value = "annotated.mjpeg")]
    output: PathBuf,

    /// JSON config file.
    #[arg(long, env = "VISION_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let source = match (args.file, args.device) {
        (Some(path), None) => VideoSource::File(path),
        (None, Some(index)) => VideoSource::Device(index),
        (None, None) => VideoSource::Device(0),
        (Some(_), Some(_)) => return Err(anyhow!("--file and --device are exclusive")),
    };

    let config = StreamerConfig::load_from(args.config.as_deref())?;
    let context = config.pipeline_context()?;
    let snapshots = context.snapshots.clone();

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_handler = cancel.clone();
    ctrlc::set_handler(move || {
        cancel_handler.store(true, Ordering::SeqCst);
    })
    .expect("error setting Ctrl-C handler");

    let id = SessionId::generate();
    let session = SessionPipeline::new(id.clone(), source, context, cancel)
        .open()
        .context("failed to open video source")?;

    let output = File::create(&args.output)
        .with_context(|| format!("failed to create {}", args.output.display()))?;
    let mut output = BufWriter::new(output);
    let stdout = std::io::stdout();
    let mut frame_index: u64 = 0;
    let mut sink = |payload: &[u8], _content_type: &str| -> Result<(), ClientDisconnected> {
        output.write_all(payload)?;
        let counts = snapshots.latest(&id);
        let line = serde_json::json!({
            "frame": frame_index,
            "personas": counts.person_count,
            "vehiculos": counts.vehicle_count,
        });
        writeln!(stdout.lock(), "{}", line)?;
        frame_index += 1;
        Ok(())
    };
    let report = session.run(&mut sink);
    output.flush()?;

    log::info!(
        "processed {} frames, wrote {} to {} ({} skipped)",
        report.frames_processed,
        report.chunks_emitted,
        args.output.display(),
        report.frames_skipped
    );
    if report.state == SessionState::Failed {
        return Err(anyhow!("session failed: {:?}", report.termination));
    }
    Ok(())
}
