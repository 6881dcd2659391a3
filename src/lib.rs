//! Vision counter
//!
//! Streams annotated video over HTTP while counting people and vehicles.
//!
//! # Architecture
//!
//! Each stream request becomes a session that owns one video source:
//!
//! 1. **Ingest**: a live capture device (held exclusively) or an uploaded file.
//! 2. **Detect**: a pluggable backend, filtered to the person and vehicle classes.
//! 3. **Aggregate**: per-frame counts published to a per-session snapshot slot.
//! 4. **Annotate + encode**: boxes drawn on a copy of the frame, then JPEG.
//! 5. **Stream**: one `multipart/x-mixed-replace` part per frame.
//!
//! The stats endpoint reads snapshot slots only and never waits on frame work.
//!
//! # Module Structure
//!
//! - `frame`: decoded RGB frames
//! - `ingest`: source manager, device leases, file and device backends
//! - `detect`: detector backends, registry, category filtering
//! - `annotate`, `encode`: drawing and JPEG encoding
//! - `stats`: aggregation and the snapshot registry
//! - `pipeline`: the per-session loop
//! - `api`: HTTP server, multipart writer, uploads
//! - `config`: daemon configuration

pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod encode;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod stats;

pub use annotate::annotate;
pub use api::{ApiConfig, ApiHandle, StreamServer};
pub use config::StreamerConfig;
pub use detect::{BackendRegistry, Category, Detection, DetectionAdapter, DetectorBackend};
pub use encode::{FrameEncoder, JpegFrameEncoder};
pub use error::{ClientDisconnected, DetectError, EncodeError, SourceError};
pub use frame::RawFrame;
pub use ingest::{SourceHandle, SourceManager, SourceSettings, VideoSource};
pub use pipeline::{
    ChunkSink, PipelineContext, SessionPipeline, SessionReport, SessionState, StreamingSession,
    Termination,
};
pub use stats::{AggregateSnapshot, CategoryFilter, SessionId, SnapshotRegistry};
