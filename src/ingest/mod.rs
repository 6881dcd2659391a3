//! Frame sources.
//!
//! `SourceManager::open` turns a `VideoSource` into a `SourceHandle` that
//! yields frames lazily, in order, until the source ends. Backends:
//! - Concatenated-JPEG files (`.mjpeg`/`.mjpg`), always available
//! - Other video files (feature: ingest-file-ffmpeg)
//! - V4L2 capture devices (feature: ingest-v4l2)
//! - Synthetic devices under a `stub://` device prefix (testing, demos)
//!
//! Live devices are exclusive: a second open of a held device fails instead
//! of queueing or sharing. File sources are never exclusive; each handle has
//! its own read cursor.

#[cfg(feature = "ingest-file-ffmpeg")]
mod file_ffmpeg;
mod mjpeg;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
mod synthetic;
#[cfg(feature = "ingest-v4l2")]
mod v4l2;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;

use crate::error::SourceError;
use crate::frame::RawFrame;

pub use mjpeg::{find_jpeg_bounds, MJPEG_EXTENSIONS};

/// Device prefix that selects synthetic devices.
pub const STUB_PREFIX: &str = "stub://";

/// Where frames come from. Fixed for the lifetime of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VideoSource {
    /// Live capture device by index.
    Device(u32),
    /// On-disk video file.
    File(PathBuf),
}

impl fmt::Display for VideoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoSource::Device(index) => write!(f, "device {}", index),
            VideoSource::File(path) => write!(f, "file {}", path.display()),
        }
    }
}

/// Capture settings shared by every source the manager opens.
#[derive(Clone, Debug)]
pub struct SourceSettings {
    /// Prefix a device index is appended to, e.g. `/dev/video` or `stub://video`.
    pub device_prefix: String,
    /// Preferred capture width for devices.
    pub width: u32,
    /// Preferred capture height for devices.
    pub height: u32,
    /// Target device frame rate. 0 leaves synthetic devices unpaced.
    pub target_fps: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            device_prefix: "/dev/video".to_string(),
            width: 640,
            height: 480,
            target_fps: 30,
        }
    }
}

impl SourceSettings {
    pub fn device_node(&self, index: u32) -> String {
        format!("{}{}", self.device_prefix, index)
    }
}

/// Opens sources and tracks which devices are held.
///
/// Clones share the held-device set, so one manager per process enforces
/// exclusivity across every session.
#[derive(Clone, Debug, Default)]
pub struct SourceManager {
    settings: SourceSettings,
    held_devices: Arc<Mutex<HashSet<u32>>>,
}

impl SourceManager {
    pub fn new(settings: SourceSettings) -> Self {
        Self {
            settings,
            held_devices: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Whether a device is currently held by some handle.
    pub fn is_device_held(&self, index: u32) -> bool {
        self.held_devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&index)
    }

    /// Open a source. Fails fast when a device is busy or a file is missing or
    /// undecodable.
    pub fn open(&self, source: &VideoSource) -> Result<SourceHandle, SourceError> {
        match source {
            VideoSource::Device(index) => self.open_device(*index, source),
            VideoSource::File(path) => self.open_file(path, source),
        }
    }

    fn open_device(&self, index: u32, source: &VideoSource) -> Result<SourceHandle, SourceError> {
        let lease = self
            .acquire(index)
            .ok_or_else(|| SourceError::unavailable(source, "device is held by another session"))?;

        let node = self.settings.device_node(index);
        let backend = if node.starts_with(STUB_PREFIX) {
            SourceBackend::Synthetic(synthetic::SyntheticDevice::new(node, &self.settings))
        } else {
            open_capture_device(&node, &self.settings)
                .map_err(|err| SourceError::unavailable(source, format!("{err:#}")))?
        };

        log::info!("source opened: {} ({})", source, backend.kind());
        Ok(SourceHandle::new(source.clone(), backend, Some(lease)))
    }

    fn open_file(&self, path: &Path, source: &VideoSource) -> Result<SourceHandle, SourceError> {
        if !path.is_file() {
            return Err(SourceError::unavailable(source, "no such file"));
        }
        let backend = if mjpeg::is_mjpeg_path(path) {
            SourceBackend::Mjpeg(
                mjpeg::MjpegFileSource::open(path)
                    .map_err(|err| SourceError::unavailable(source, format!("{err:#}")))?,
            )
        } else {
            open_container_file(path)
                .map_err(|err| SourceError::unavailable(source, format!("{err:#}")))?
        };

        log::info!("source opened: {} ({})", source, backend.kind());
        Ok(SourceHandle::new(source.clone(), backend, None))
    }

    fn acquire(&self, index: u32) -> Option<DeviceLease> {
        let mut held = self
            .held_devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !held.insert(index) {
            return None;
        }
        Some(DeviceLease {
            index,
            held: Arc::clone(&self.held_devices),
        })
    }
}

#[cfg(feature = "ingest-v4l2")]
fn open_capture_device(node: &str, settings: &SourceSettings) -> Result<SourceBackend> {
    Ok(SourceBackend::V4l2(v4l2::V4l2Device::open(node, settings)?))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_capture_device(node: &str, _settings: &SourceSettings) -> Result<SourceBackend> {
    Err(anyhow::anyhow!(
        "capture device {} requires the ingest-v4l2 feature",
        node
    ))
}

#[cfg(feature = "ingest-file-ffmpeg")]
fn open_container_file(path: &Path) -> Result<SourceBackend> {
    Ok(SourceBackend::Ffmpeg(file_ffmpeg::FfmpegFileSource::open(path)?))
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
fn open_container_file(path: &Path) -> Result<SourceBackend> {
    Err(anyhow::anyhow!(
        "{} is not an MJPEG file; other containers require the ingest-file-ffmpeg feature",
        path.display()
    ))
}

/// Exclusive hold on a device index. Released on drop.
#[derive(Debug)]
struct DeviceLease {
    index: u32,
    held: Arc<Mutex<HashSet<u32>>>,
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.index);
    }
}

enum SourceBackend {
    Synthetic(synthetic::SyntheticDevice),
    Mjpeg(mjpeg::MjpegFileSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(file_ffmpeg::FfmpegFileSource),
    #[cfg(feature = "ingest-v4l2")]
    V4l2(v4l2::V4l2Device),
}

impl SourceBackend {
    fn kind(&self) -> &'static str {
        match self {
            SourceBackend::Synthetic(_) => "synthetic",
            SourceBackend::Mjpeg(_) => "mjpeg",
            #[cfg(feature = "ingest-file-ffmpeg")]
            SourceBackend::Ffmpeg(_) => "ffmpeg",
            #[cfg(feature = "ingest-v4l2")]
            SourceBackend::V4l2(_) => "v4l2",
        }
    }

    /// `Ok(None)` is a graceful end of stream.
    fn next_frame(&mut self, sequence: u64) -> Result<Option<RawFrame>> {
        match self {
            SourceBackend::Synthetic(source) => source.next_frame(sequence),
            SourceBackend::Mjpeg(source) => source.next_frame(sequence),
            #[cfg(feature = "ingest-file-ffmpeg")]
            SourceBackend::Ffmpeg(source) => source.next_frame(sequence),
            #[cfg(feature = "ingest-v4l2")]
            SourceBackend::V4l2(source) => source.next_frame(sequence),
        }
    }
}

/// An open source. Pull frames with `next_frame`; the sequence cannot be
/// restarted.
///
/// `close` releases the underlying file or device. It is idempotent and also
/// runs on drop, so every exit path releases the source.
pub struct SourceHandle {
    source: VideoSource,
    backend: Option<SourceBackend>,
    lease: Option<DeviceLease>,
    frames_read: u64,
}

impl SourceHandle {
    fn new(source: VideoSource, backend: SourceBackend, lease: Option<DeviceLease>) -> Self {
        Self {
            source,
            backend: Some(backend),
            lease,
            frames_read: 0,
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    pub fn is_closed(&self) -> bool {
        self.backend.is_none()
    }

    /// Whether this handle holds a device lease.
    pub fn holds_device(&self) -> bool {
        self.lease.is_some()
    }

    /// Next frame, or `None` at end of stream.
    ///
    /// Read failures (a device that stops delivering, a corrupt file) also
    /// end the stream; they are logged here and not reported separately.
    pub fn next_frame(&mut self) -> Option<RawFrame> {
        let backend = self.backend.as_mut()?;
        match backend.next_frame(self.frames_read) {
            Ok(Some(frame)) => {
                self.frames_read += 1;
                Some(frame)
            }
            Ok(None) => {
                log::debug!("{}: end of stream after {} frames", self.source, self.frames_read);
                None
            }
            Err(err) => {
                log::warn!(
                    "{}: read failed after {} frames: {:#}",
                    self.source,
                    self.frames_read,
                    err
                );
                None
            }
        }
    }

    /// Release the source. Safe to call more than once.
    pub fn close(&mut self) {
        if self.backend.take().is_some() {
            log::debug!("{}: released", self.source);
        }
        self.lease = None;
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHandle")
            .field("source", &self.source)
            .field("closed", &self.is_closed())
            .field("frames_read", &self.frames_read)
            .finish()
    }
}
