//! Per-session frame loop.
//!
//! A session moves `Opening -> Streaming -> {Closed | Failed}`. Opening is
//! `SessionPipeline::open`, which either fails (nothing was emitted, nothing
//! is held) or hands back a `StreamingSession`. `StreamingSession::run` pulls
//! frames until a terminal state and returns a `SessionReport`. The source
//! handle is closed exactly once, on entry to the terminal state.
//!
//! One iteration: next frame -> detect -> publish snapshot -> annotate ->
//! encode -> emit. An encode failure skips the emit and the loop carries on;
//! a detector failure ends the session as `Failed`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::annotate::annotate;
use crate::detect::DetectionAdapter;
use crate::encode::FrameEncoder;
use crate::error::{ClientDisconnected, DetectError, SourceError};
use crate::ingest::{SourceHandle, SourceManager, VideoSource};
use crate::stats::{aggregate, SessionId, SnapshotPublisher, SnapshotRegistry};

/// Lifecycle states of a stream session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Streaming,
    Closed,
    Failed,
}

/// Why a session stopped streaming.
#[derive(Debug)]
pub enum Termination {
    /// Source exhausted, or a live device stopped delivering.
    EndOfStream,
    ClientDisconnected,
    /// The server is shutting down (or the caller cancelled).
    Cancelled,
    DetectorFailed(DetectError),
}

/// Where encoded frames go, one chunk per emitted frame.
pub trait ChunkSink {
    fn emit(&mut self, payload: &[u8], content_type: &str) -> Result<(), ClientDisconnected>;
}

impl<F> ChunkSink for F
where
    F: FnMut(&[u8], &str) -> Result<(), ClientDisconnected>,
{
    fn emit(&mut self, payload: &[u8], content_type: &str) -> Result<(), ClientDisconnected> {
        self(payload, content_type)
    }
}

/// Shared collaborators every session needs.
#[derive(Clone)]
pub struct PipelineContext {
    pub sources: SourceManager,
    pub detector: DetectionAdapter,
    pub encoder: Arc<dyn FrameEncoder>,
    pub snapshots: Arc<SnapshotRegistry>,
}

/// A session in `Opening`.
pub struct SessionPipeline {
    id: SessionId,
    source: VideoSource,
    context: PipelineContext,
    cancel: Arc<AtomicBool>,
}

impl SessionPipeline {
    /// `cancel` is observed at every step of the loop; setting it ends the
    /// session as `Closed`.
    pub fn new(
        id: SessionId,
        source: VideoSource,
        context: PipelineContext,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            source,
            context,
            cancel,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        SessionState::Opening
    }

    /// Acquire the source. On failure the session is `Failed` and has
    /// emitted nothing.
    pub fn open(self) -> Result<StreamingSession, SourceError> {
        let handle = match self.context.sources.open(&self.source) {
            Ok(handle) => handle,
            Err(err) => {
                log::warn!("session {}: failed to open {}: {}", self.id, self.source, err);
                return Err(err);
            }
        };
        let publisher = self.context.snapshots.open(self.id.clone());
        log::info!("session {}: streaming {}", self.id, self.source);
        Ok(StreamingSession {
            id: self.id,
            handle,
            publisher,
            context: self.context,
            cancel: self.cancel,
            counters: SessionCounters::default(),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct SessionCounters {
    frames_processed: u64,
    chunks_emitted: u64,
    frames_skipped: u64,
}

/// A session in `Streaming`. Holds the source exclusively.
pub struct StreamingSession {
    id: SessionId,
    handle: SourceHandle,
    publisher: SnapshotPublisher,
    context: PipelineContext,
    cancel: Arc<AtomicBool>,
    counters: SessionCounters,
}

/// Outcome of a finished session.
#[derive(Debug)]
pub struct SessionReport {
    pub id: SessionId,
    pub state: SessionState,
    pub termination: Termination,
    /// Frames that went through detection and aggregation.
    pub frames_processed: u64,
    /// Frames written to the sink.
    pub chunks_emitted: u64,
    /// Frames dropped because they failed to encode.
    pub frames_skipped: u64,
}

impl StreamingSession {
    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        SessionState::Streaming
    }

    /// Run the loop to a terminal state.
    pub fn run<S: ChunkSink + ?Sized>(mut self, sink: &mut S) -> SessionReport {
        let termination = self.stream(sink);
        let state = match termination {
            Termination::DetectorFailed(_) => SessionState::Failed,
            _ => SessionState::Closed,
        };
        self.handle.close();

        let report = SessionReport {
            id: self.id.clone(),
            state,
            termination,
            frames_processed: self.counters.frames_processed,
            chunks_emitted: self.counters.chunks_emitted,
            frames_skipped: self.counters.frames_skipped,
        };
        match &report.termination {
            Termination::DetectorFailed(err) => log::warn!(
                "session {}: failed after {} frames: {}",
                report.id,
                report.frames_processed,
                err
            ),
            Termination::ClientDisconnected => log::debug!(
                "session {}: client disconnected after {} chunks",
                report.id,
                report.chunks_emitted
            ),
            other => log::info!(
                "session {}: closed ({:?}) frames={} chunks={} skipped={}",
                report.id,
                other,
                report.frames_processed,
                report.chunks_emitted,
                report.frames_skipped
            ),
        }
        report
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn stream<S: ChunkSink + ?Sized>(&mut self, sink: &mut S) -> Termination {
        let filter = self.context.detector.filter().clone();
        loop {
            if self.cancelled() {
                return Termination::Cancelled;
            }

            let Some(frame) = self.handle.next_frame() else {
                return Termination::EndOfStream;
            };
            if self.cancelled() {
                return Termination::Cancelled;
            }

            let detections = match self.context.detector.detect(&frame) {
                Ok(detections) => detections,
                Err(err) => return Termination::DetectorFailed(err),
            };
            self.publisher.publish(aggregate(&detections, &filter));
            self.counters.frames_processed += 1;

            let annotated = annotate(&frame, &detections);
            drop(frame);

            let payload = match self.context.encoder.encode(&annotated) {
                Ok(payload) => payload,
                Err(err) => {
                    log::warn!("session {}: skipping frame: {}", self.id, err);
                    self.counters.frames_skipped += 1;
                    continue;
                }
            };

            if self.cancelled() {
                return Termination::Cancelled;
            }
            if sink
                .emit(&payload, self.context.encoder.content_type())
                .is_err()
            {
                return Termination::ClientDisconnected;
            }
            self.counters.chunks_emitted += 1;
        }
    }
}
