use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tempfile::TempDir;

use vision_counter::detect::{BoundingBox, RawDetection, SharedDetector};
use vision_counter::{
    AggregateSnapshot, CategoryFilter, ClientDisconnected, DetectionAdapter, DetectorBackend,
    EncodeError, FrameEncoder, JpegFrameEncoder, PipelineContext, RawFrame, SessionId,
    SessionPipeline, SessionState, SnapshotRegistry, SourceManager, SourceSettings, Termination,
    VideoSource,
};

const PERSON: u32 = 0;
const BICYCLE: u32 = 1;
const CAR: u32 = 2;
const TRUCK: u32 = 7;

/// Replays detections keyed by frame sequence.
struct ScriptedBackend {
    script: HashMap<u64, Vec<RawDetection>>,
    fail_on: Option<u64>,
    /// Session whose snapshot is recorded at the start of each detect call.
    watch: Option<(Arc<SnapshotRegistry>, SessionId)>,
    observed: Arc<Mutex<Vec<AggregateSnapshot>>>,
}

impl ScriptedBackend {
    fn new(script: HashMap<u64, Vec<RawDetection>>) -> Self {
        Self {
            script,
            fail_on: None,
            watch: None,
            observed: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&self, frame: &RawFrame, _filter: &CategoryFilter) -> Result<Vec<RawDetection>> {
        if let Some((registry, id)) = &self.watch {
            self.observed.lock().unwrap().push(registry.latest(id));
        }
        if self.fail_on == Some(frame.sequence) {
            return Err(anyhow!("model crashed on frame {}", frame.sequence));
        }
        Ok(self.script.get(&frame.sequence).cloned().unwrap_or_default())
    }
}

/// Parks inside `detect` on frames `stall_width` pixels wide until released;
/// every other frame gets one person straight away.
struct StallingBackend {
    stall_width: u32,
    stalled: Arc<AtomicBool>,
    release: Arc<AtomicBool>,
}

impl DetectorBackend for StallingBackend {
    fn name(&self) -> &'static str {
        "stalling"
    }

    fn detect(&self, frame: &RawFrame, _filter: &CategoryFilter) -> Result<Vec<RawDetection>> {
        if frame.width == self.stall_width {
            self.stalled.store(true, Ordering::SeqCst);
            while !self.release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        Ok(vec![det(PERSON, 0.9)])
    }
}

/// JPEG encoder that refuses one frame.
struct FlakyEncoder {
    inner: JpegFrameEncoder,
    fail_on: u64,
}

impl FrameEncoder for FlakyEncoder {
    fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>, EncodeError> {
        if frame.sequence == self.fail_on {
            return Err(EncodeError {
                sequence: frame.sequence,
                reason: "scripted failure".to_string(),
            });
        }
        self.inner.encode(frame)
    }

    fn content_type(&self) -> &'static str {
        self.inner.content_type()
    }
}

fn det(class_id: u32, confidence: f32) -> RawDetection {
    RawDetection {
        class_id,
        confidence,
        bbox: BoundingBox::new(2.0, 2.0, 10.0, 8.0),
    }
}

fn three_frame_script() -> HashMap<u64, Vec<RawDetection>> {
    HashMap::from([
        (0, vec![det(PERSON, 0.9), det(CAR, 0.8)]),
        (1, vec![det(PERSON, 0.5), det(PERSON, 0.95), det(BICYCLE, 0.9)]),
        (2, vec![det(PERSON, 0.3), det(TRUCK, 0.1)]),
    ])
}

fn write_clip(dir: &Path, name: &str, frames: usize) -> Result<std::path::PathBuf> {
    write_sized_clip(dir, name, frames, 32, 24)
}

fn write_sized_clip(
    dir: &Path,
    name: &str,
    frames: usize,
    width: u32,
    height: u32,
) -> Result<std::path::PathBuf> {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path)?;
    for i in 0..frames {
        let shade = (i * 60) as u8;
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, 90).encode(
            &vec![shade; (width * height * 3) as usize],
            width,
            height,
            ExtendedColorType::Rgb8,
        )?;
        file.write_all(&jpeg)?;
    }
    file.flush()?;
    Ok(path)
}

fn context(backend: impl DetectorBackend + 'static, encoder: Arc<dyn FrameEncoder>) -> PipelineContext {
    let backend: SharedDetector = Arc::new(backend);
    PipelineContext {
        sources: SourceManager::new(SourceSettings {
            device_prefix: "stub://video".to_string(),
            width: 32,
            height: 24,
            target_fps: 0,
        }),
        detector: DetectionAdapter::new(backend, CategoryFilter::default()),
        encoder,
        snapshots: SnapshotRegistry::new(),
    }
}

#[test]
fn three_frame_file_publishes_each_snapshot_and_emits_each_chunk() -> Result<()> {
    let dir = TempDir::new()?;
    let clip = write_clip(dir.path(), "clip.mjpeg", 3)?;
    let ctx = context(
        ScriptedBackend::new(three_frame_script()),
        Arc::new(JpegFrameEncoder::default()),
    );
    let id = SessionId::generate();

    let session = SessionPipeline::new(
        id.clone(),
        VideoSource::File(clip),
        ctx.clone(),
        Arc::new(AtomicBool::new(false)),
    )
    .open()?;

    let mut seen = Vec::new();
    let mut chunks = Vec::new();
    let snapshots = ctx.snapshots.clone();
    let mut sink = |payload: &[u8], content_type: &str| -> Result<(), ClientDisconnected> {
        assert_eq!(content_type, "image/jpeg");
        seen.push(snapshots.latest(&id));
        chunks.push(payload.to_vec());
        Ok(())
    };
    let report = session.run(&mut sink);

    assert_eq!(report.state, SessionState::Closed);
    assert!(matches!(report.termination, Termination::EndOfStream));
    assert_eq!(report.frames_processed, 3);
    assert_eq!(report.chunks_emitted, 3);
    assert_eq!(
        seen,
        vec![
            AggregateSnapshot::new(1, 1),
            AggregateSnapshot::new(2, 0),
            AggregateSnapshot::new(0, 0),
        ]
    );
    for chunk in &chunks {
        assert_eq!(&chunk[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(chunk)?;
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }
    assert!(!ctx.snapshots.contains(&id));
    assert_eq!(ctx.snapshots.latest(&id), AggregateSnapshot::default());
    Ok(())
}

#[test]
fn encode_failure_skips_the_chunk_but_keeps_the_snapshot() -> Result<()> {
    let dir = TempDir::new()?;
    let clip = write_clip(dir.path(), "clip.mjpeg", 3)?;
    let id = SessionId::generate();
    let registry = SnapshotRegistry::new();

    let mut backend = ScriptedBackend::new(three_frame_script());
    backend.watch = Some((registry.clone(), id.clone()));
    let observed = backend.observed.clone();
    let mut ctx = context(
        backend,
        Arc::new(FlakyEncoder {
            inner: JpegFrameEncoder::default(),
            fail_on: 1,
        }),
    );
    ctx.snapshots = registry;

    let session = SessionPipeline::new(
        id.clone(),
        VideoSource::File(clip),
        ctx.clone(),
        Arc::new(AtomicBool::new(false)),
    )
    .open()?;
    let mut emitted = 0;
    let mut sink = |_: &[u8], _: &str| -> Result<(), ClientDisconnected> {
        emitted += 1;
        Ok(())
    };
    let report = session.run(&mut sink);

    assert_eq!(emitted, 2);
    assert_eq!(report.state, SessionState::Closed);
    assert_eq!(report.frames_processed, 3);
    assert_eq!(report.chunks_emitted, 2);
    assert_eq!(report.frames_skipped, 1);
    // Seen by the detector right before frame 2: frame 1 was counted even
    // though its chunk was dropped.
    let observed = observed.lock().unwrap();
    assert_eq!(observed[2], AggregateSnapshot::new(2, 0));
    Ok(())
}

#[test]
fn detector_failure_fails_the_session_and_releases_the_device() -> Result<()> {
    let mut backend = ScriptedBackend::new(HashMap::from([(0, vec![det(PERSON, 0.9)])]));
    backend.fail_on = Some(1);
    let ctx = context(backend, Arc::new(JpegFrameEncoder::default()));

    let session = SessionPipeline::new(
        SessionId::live(),
        VideoSource::Device(0),
        ctx.clone(),
        Arc::new(AtomicBool::new(false)),
    )
    .open()?;
    assert!(ctx.sources.is_device_held(0));

    let mut sink = |_: &[u8], _: &str| -> Result<(), ClientDisconnected> { Ok(()) };
    let report = session.run(&mut sink);

    assert_eq!(report.state, SessionState::Failed);
    match &report.termination {
        Termination::DetectorFailed(err) => assert!(err.to_string().contains("scripted")),
        other => panic!("unexpected termination {other:?}"),
    }
    assert_eq!(report.frames_processed, 1);
    assert_eq!(report.chunks_emitted, 1);
    assert!(!ctx.sources.is_device_held(0));
    assert!(!ctx.snapshots.contains(&SessionId::live()));
    Ok(())
}

#[test]
fn detection_at_exactly_the_threshold_is_counted() -> Result<()> {
    let backend = ScriptedBackend::new(HashMap::from([(
        0,
        vec![det(PERSON, 0.4), det(TRUCK, 0.39)],
    )]));
    let ctx = context(backend, Arc::new(JpegFrameEncoder::default()));
    let dir = TempDir::new()?;
    let clip = write_clip(dir.path(), "one.mjpg", 1)?;
    let id = SessionId::generate();

    let session = SessionPipeline::new(
        id.clone(),
        VideoSource::File(clip),
        ctx.clone(),
        Arc::new(AtomicBool::new(false)),
    )
    .open()?;
    let snapshots = ctx.snapshots.clone();
    let mut seen = Vec::new();
    let mut sink = |_: &[u8], _: &str| -> Result<(), ClientDisconnected> {
        seen.push(snapshots.latest(&id));
        Ok(())
    };
    session.run(&mut sink);
    assert_eq!(seen, vec![AggregateSnapshot::new(1, 0)]);
    Ok(())
}

#[test]
fn busy_device_fails_to_open_without_touching_the_first_session() -> Result<()> {
    let ctx = context(
        ScriptedBackend::new(HashMap::new()),
        Arc::new(JpegFrameEncoder::default()),
    );
    let first = SessionPipeline::new(
        SessionId::live(),
        VideoSource::Device(0),
        ctx.clone(),
        Arc::new(AtomicBool::new(false)),
    )
    .open()?;

    let second = SessionPipeline::new(
        SessionId::generate(),
        VideoSource::Device(0),
        ctx.clone(),
        Arc::new(AtomicBool::new(false)),
    );
    let second_id = second.session_id().clone();
    assert!(second.open().is_err());
    assert!(!ctx.snapshots.contains(&second_id));
    assert!(ctx.snapshots.contains(first.session_id()));
    assert!(ctx.sources.is_device_held(0));

    drop(first);
    assert!(!ctx.sources.is_device_held(0));
    Ok(())
}

#[test]
fn a_stalled_detection_does_not_hold_up_other_sessions() -> Result<()> {
    let stalled = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let ctx = context(
        StallingBackend {
            stall_width: 32,
            stalled: stalled.clone(),
            release: release.clone(),
        },
        Arc::new(JpegFrameEncoder::default()),
    );

    let cancel_live = Arc::new(AtomicBool::new(false));
    let live = {
        let ctx = ctx.clone();
        let cancel = cancel_live.clone();
        std::thread::spawn(move || -> Result<Termination> {
            let session =
                SessionPipeline::new(SessionId::live(), VideoSource::Device(0), ctx, cancel).open()?;
            let mut sink = |_: &[u8], _: &str| -> Result<(), ClientDisconnected> { Ok(()) };
            Ok(session.run(&mut sink).termination)
        })
    };
    let started = Instant::now();
    while !stalled.load(Ordering::SeqCst) {
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "live session never reached the detector"
        );
        std::thread::sleep(Duration::from_millis(10));
    }

    let dir = TempDir::new()?;
    let clip = write_sized_clip(dir.path(), "small.mjpeg", 3, 16, 8)?;
    let (done_tx, done_rx) = mpsc::channel();
    let file = {
        let ctx = ctx.clone();
        std::thread::spawn(move || -> Result<()> {
            let session = SessionPipeline::new(
                SessionId::generate(),
                VideoSource::File(clip),
                ctx,
                Arc::new(AtomicBool::new(false)),
            )
            .open()?;
            let mut sink = |_: &[u8], _: &str| -> Result<(), ClientDisconnected> { Ok(()) };
            let _ = done_tx.send(session.run(&mut sink));
            Ok(())
        })
    };
    let file_report = done_rx.recv_timeout(Duration::from_secs(5));

    release.store(true, Ordering::SeqCst);
    cancel_live.store(true, Ordering::SeqCst);
    let live_termination = live
        .join()
        .map_err(|_| anyhow!("live session thread panicked"))??;
    file.join()
        .map_err(|_| anyhow!("file session thread panicked"))??;

    let file_report =
        file_report.map_err(|_| anyhow!("file session waited on the stalled live detection"))?;
    assert_eq!(file_report.state, SessionState::Closed);
    assert_eq!(file_report.frames_processed, 3);
    assert_eq!(file_report.chunks_emitted, 3);
    assert!(matches!(live_termination, Termination::Cancelled));
    assert!(!ctx.sources.is_device_held(0));
    Ok(())
}
