use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use vision_counter::config::StreamerConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "VISION_CONFIG",
        "VISION_ADDR",
        "VISION_UPLOAD_DIR",
        "VISION_LIVE_DEVICE",
        "VISION_DEVICE_PREFIX",
        "VISION_DETECTOR",
        "VISION_MODEL_PATH",
        "VISION_CONFIDENCE",
        "VISION_JPEG_QUALITY",
    ] {
        std::env::remove_var(key);
    }
}

fn config_file(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(json.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = StreamerConfig::load().expect("load defaults");
    assert_eq!(cfg.server.addr, "127.0.0.1:5000");
    assert_eq!(cfg.server.upload_dir, PathBuf::from("static/uploads"));
    assert_eq!(cfg.server.live_device, 0);
    assert_eq!(cfg.server.max_upload_bytes, 512 * 1024 * 1024);
    assert_eq!(cfg.server.client_write_timeout, Duration::from_secs(30));
    assert_eq!(cfg.capture.device_prefix, "/dev/video");
    assert_eq!((cfg.capture.width, cfg.capture.height), (640, 480));
    assert_eq!(cfg.capture.target_fps, 30);
    assert_eq!(cfg.detector.backend, "null");
    assert_eq!(cfg.detector.confidence, 0.4);
    assert_eq!(cfg.detector.input_size, 640);
    assert_eq!(cfg.jpeg_quality, 80);
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        r#"{
            "server": {
                "addr": "0.0.0.0:8080",
                "upload_dir": "/srv/uploads",
                "max_upload_bytes": 1048576,
                "client_write_timeout_secs": 5
            },
            "capture": {
                "live_device": 2,
                "device_prefix": "stub://cam",
                "width": 320,
                "height": 240,
                "target_fps": 15
            },
            "detector": {
                "confidence": 0.6
            },
            "encoder": {
                "jpeg_quality": 70
            }
        }"#,
    );

    std::env::set_var("VISION_CONFIG", file.path());
    std::env::set_var("VISION_ADDR", "127.0.0.1:9000");
    std::env::set_var("VISION_LIVE_DEVICE", "1");
    std::env::set_var("VISION_JPEG_QUALITY", "95");

    let cfg = StreamerConfig::load().expect("load config");

    assert_eq!(cfg.server.addr, "127.0.0.1:9000");
    assert_eq!(cfg.server.upload_dir, PathBuf::from("/srv/uploads"));
    assert_eq!(cfg.server.max_upload_bytes, 1_048_576);
    assert_eq!(cfg.server.client_write_timeout, Duration::from_secs(5));
    assert_eq!(cfg.server.live_device, 1);
    assert_eq!(cfg.capture.device_prefix, "stub://cam");
    assert_eq!((cfg.capture.width, cfg.capture.height), (320, 240));
    assert_eq!(cfg.capture.target_fps, 15);
    assert_eq!(cfg.detector.confidence, 0.6);
    assert_eq!(cfg.jpeg_quality, 95);

    clear_env();
}

#[test]
fn load_from_ignores_vision_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("VISION_CONFIG", "/nonexistent/vision.json");

    let file = config_file(r#"{"server": {"addr": "127.0.0.1:7000"}}"#);
    let cfg = StreamerConfig::load_from(Some(file.path())).expect("explicit file");
    assert_eq!(cfg.server.addr, "127.0.0.1:7000");

    assert!(StreamerConfig::load().is_err());
    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    for (key, value) in [
        ("VISION_CONFIDENCE", "0"),
        ("VISION_CONFIDENCE", "1.5"),
        ("VISION_CONFIDENCE", "high"),
        ("VISION_JPEG_QUALITY", "0"),
        ("VISION_JPEG_QUALITY", "101"),
        ("VISION_LIVE_DEVICE", "-1"),
        ("VISION_DETECTOR", "tract"),
    ] {
        std::env::set_var(key, value);
        assert!(
            StreamerConfig::load().is_err(),
            "{key}={value} should be rejected"
        );
        std::env::remove_var(key);
    }

    let file = config_file(r#"{"capture": {"width": 0}}"#);
    std::env::set_var("VISION_CONFIG", file.path());
    assert!(StreamerConfig::load().is_err());

    let file = config_file("not json");
    std::env::set_var("VISION_CONFIG", file.path());
    let err = StreamerConfig::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}

#[test]
fn env_selects_the_detector_model() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VISION_DETECTOR", "tract");
    std::env::set_var("VISION_MODEL_PATH", "/models/yolov8n.onnx");
    std::env::set_var("VISION_DEVICE_PREFIX", "stub://video");
    std::env::set_var("VISION_UPLOAD_DIR", "/tmp/vision-uploads");

    let cfg = StreamerConfig::load().expect("tract with model path");
    assert_eq!(cfg.detector.backend, "tract");
    assert_eq!(
        cfg.detector.model_path,
        Some(PathBuf::from("/models/yolov8n.onnx"))
    );
    assert_eq!(cfg.capture.device_prefix, "stub://video");
    assert_eq!(cfg.server.upload_dir, PathBuf::from("/tmp/vision-uploads"));

    clear_env();
}
