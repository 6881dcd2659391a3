use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::api::{ApiConfig, DEFAULT_CLIENT_WRITE_TIMEOUT, DEFAULT_MAX_UPLOAD_BYTES};
use crate::detect::{BackendRegistry, DetectionAdapter, NullBackend};
use crate::encode::{JpegFrameEncoder, DEFAULT_JPEG_QUALITY};
use crate::ingest::{SourceManager, SourceSettings};
use crate::pipeline::PipelineContext;
use crate::stats::{CategoryFilter, SnapshotRegistry, DEFAULT_CONFIDENCE_THRESHOLD};

const DEFAULT_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_UPLOAD_DIR: &str = "static/uploads";
const DEFAULT_DETECTOR: &str = "null";
const DEFAULT_MODEL_INPUT: u32 = 640;

#[derive(Debug, Deserialize, Default)]
struct StreamerConfigFile {
    server: Option<ServerConfigFile>,
    capture: Option<CaptureConfigFile>,
    detector: Option<DetectorConfigFile>,
    encoder: Option<EncoderConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    addr: Option<String>,
    upload_dir: Option<PathBuf>,
    max_upload_bytes: Option<usize>,
    client_write_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    live_device: Option<u32>,
    device_prefix: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    confidence: Option<f32>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct EncoderConfigFile {
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub server: ApiConfig,
    pub capture: SourceSettings,
    pub detector: DetectorSettings,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Name of the registered backend to use.
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub confidence: f32,
    /// Square model input edge in pixels.
    pub input_size: u32,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self::from_file(StreamerConfigFile::default())
    }
}

impl StreamerConfig {
    /// Defaults, then the JSON file named by `VISION_CONFIG`, then `VISION_*`
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = env_value("VISION_CONFIG").map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, with the config file given explicitly.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn category_filter(&self) -> Result<CategoryFilter> {
        CategoryFilter::new(self.detector.confidence)
    }

    /// Detector backends available to this build, with the configured one as
    /// the default.
    pub fn backend_registry(&self) -> Result<BackendRegistry> {
        let mut registry = BackendRegistry::new();
        registry.register(NullBackend::new());
        register_model_backends(&mut registry, &self.detector)?;
        registry.set_default(&self.detector.backend)?;
        Ok(registry)
    }

    /// Everything a session needs, built once per process.
    pub fn pipeline_context(&self) -> Result<PipelineContext> {
        let registry = self.backend_registry()?;
        Ok(PipelineContext {
            sources: SourceManager::new(self.capture.clone()),
            detector: DetectionAdapter::new(registry.warmed_default()?, self.category_filter()?),
            encoder: Arc::new(JpegFrameEncoder::new(self.jpeg_quality)),
            snapshots: SnapshotRegistry::new(),
        })
    }

    fn from_file(file: StreamerConfigFile) -> Self {
        let server_file = file.server.unwrap_or_default();
        let capture_file = file.capture.unwrap_or_default();
        let detector_file = file.detector.unwrap_or_default();
        let capture_defaults = SourceSettings::default();

        let server = ApiConfig {
            addr: server_file
                .addr
                .unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            upload_dir: server_file
                .upload_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
            max_upload_bytes: server_file
                .max_upload_bytes
                .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            client_write_timeout: server_file
                .client_write_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CLIENT_WRITE_TIMEOUT),
            live_device: capture_file.live_device.unwrap_or(0),
        };
        let capture = SourceSettings {
            device_prefix: capture_file
                .device_prefix
                .unwrap_or(capture_defaults.device_prefix),
            width: capture_file.width.unwrap_or(capture_defaults.width),
            height: capture_file.height.unwrap_or(capture_defaults.height),
            target_fps: capture_file
                .target_fps
                .unwrap_or(capture_defaults.target_fps),
        };
        let detector = DetectorSettings {
            backend: detector_file
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
            model_path: detector_file.model_path,
            confidence: detector_file
                .confidence
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            input_size: detector_file.input_size.unwrap_or(DEFAULT_MODEL_INPUT),
        };
        Self {
            server,
            capture,
            detector,
            jpeg_quality: file
                .encoder
                .and_then(|encoder| encoder.jpeg_quality)
                .unwrap_or(DEFAULT_JPEG_QUALITY),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_value("VISION_ADDR") {
            self.server.addr = addr;
        }
        if let Some(dir) = env_value("VISION_UPLOAD_DIR") {
            self.server.upload_dir = PathBuf::from(dir);
        }
        if let Some(device) = env_value("VISION_LIVE_DEVICE") {
            self.server.live_device = device
                .parse()
                .map_err(|_| anyhow!("VISION_LIVE_DEVICE must be a device index"))?;
        }
        if let Some(prefix) = env_value("VISION_DEVICE_PREFIX") {
            self.capture.device_prefix = prefix;
        }
        if let Some(backend) = env_value("VISION_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = env_value("VISION_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(confidence) = env_value("VISION_CONFIDENCE") {
            self.detector.confidence = confidence
                .parse()
                .map_err(|_| anyhow!("VISION_CONFIDENCE must be a number"))?;
        }
        if let Some(quality) = env_value("VISION_JPEG_QUALITY") {
            self.jpeg_quality = quality
                .parse()
                .map_err(|_| anyhow!("VISION_JPEG_QUALITY must be an integer in 1..=100"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let confidence = self.detector.confidence;
        if !(confidence > 0.0 && confidence <= 1.0) {
            return Err(anyhow!("confidence must be in (0, 1], got {}", confidence));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be in 1..=100, got {}", self.jpeg_quality));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture width and height must be greater than zero"));
        }
        if self.server.max_upload_bytes == 0 {
            return Err(anyhow!("max upload size must be greater than zero"));
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector input size must be greater than zero"));
        }
        if self.detector.backend == "tract" && self.detector.model_path.is_none() {
            return Err(anyhow!("detector 'tract' requires model_path"));
        }
        Ok(())
    }
}

#[cfg(feature = "backend-tract")]
fn register_model_backends(registry: &mut BackendRegistry, settings: &DetectorSettings) -> Result<()> {
    if let Some(model_path) = &settings.model_path {
        let tract_cfg = crate::detect::TractConfig::new(model_path.clone(), settings.input_size);
        registry.register(crate::detect::TractBackend::new(&tract_cfg)?);
    }
    Ok(())
}

#[cfg(not(feature = "backend-tract"))]
fn register_model_backends(_registry: &mut BackendRegistry, settings: &DetectorSettings) -> Result<()> {
    if settings.model_path.is_some() {
        log::warn!("model_path is set but this build has no model backends (enable backend-tract)");
    }
    Ok(())
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<StreamerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() -> Result<()> {
        let cfg = StreamerConfig::default();
        cfg.validate()?;
        assert_eq!(cfg.server.addr, DEFAULT_ADDR);
        assert_eq!(cfg.detector.backend, "null");
        assert_eq!(cfg.jpeg_quality, 80);
        assert_eq!(cfg.capture.width, 640);
        Ok(())
    }

    #[test]
    fn tract_without_model_is_rejected() {
        let mut cfg = StreamerConfig::default();
        cfg.detector.backend = "tract".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("model_path"));
    }

    #[test]
    fn unknown_detector_is_rejected_when_building_context() {
        let mut cfg = StreamerConfig::default();
        cfg.detector.backend = "nonexistent".to_string();
        let err = cfg.pipeline_context().err().expect("unknown backend");
        assert!(err.to_string().contains("available: null"));
    }

    #[test]
    fn default_context_uses_null_backend() -> Result<()> {
        let cfg = StreamerConfig::default();
        let registry = cfg.backend_registry()?;
        assert_eq!(registry.list().first().map(String::as_str), Some("null"));
        cfg.pipeline_context()?;
        Ok(())
    }

    #[test]
    fn confidence_bounds() {
        let mut cfg = StreamerConfig::default();
        cfg.detector.confidence = 0.0;
        assert!(cfg.validate().is_err());
        cfg.detector.confidence = 1.0;
        assert!(cfg.validate().is_ok());
        cfg.detector.confidence = 1.5;
        assert!(cfg.validate().is_err());
    }
}
