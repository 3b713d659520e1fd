//! Configuration: a single YAML document, loaded with write-default-if-missing
//! semantics. Each section mirrors the recognized options table, one struct
//! per section with its own `Default` impl, decomposing `AppConfig` into the
//! system/camera/detection/tracking/ocr/events/database/api groups and
//! loaded directly via `serde_yaml` since the source format is a literal
//! YAML file that must be materialized on first run.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemMode {
    Demo,
    Production,
    Headless,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSection {
    pub mode: SystemMode,
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default = "default_frame_queue_size")]
    pub frame_queue_size: usize,
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_frame_queue_size() -> usize {
    2
}
fn default_event_buffer_size() -> usize {
    1000
}
fn default_true() -> bool {
    true
}

impl Default for SystemSection {
    fn default() -> Self {
        Self {
            mode: SystemMode::Demo,
            log_level: "info".into(),
            log_file: None,
            frame_queue_size: default_frame_queue_size(),
            event_buffer_size: default_event_buffer_size(),
            metrics_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: i64,
    pub name: String,
    pub source: String,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_fps() -> u32 {
    20
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}

impl CameraConfig {
    pub fn is_rtsp(&self) -> bool {
        self.source.starts_with("rtsp://") || self.source.starts_with("http://")
    }

    pub fn is_usb(&self) -> bool {
        !self.source.is_empty() && self.source.chars().all(|c| c.is_ascii_digit())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default = "default_iou")]
    pub iou_threshold: f32,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default)]
    pub fp16: bool,
    #[serde(default = "default_classes")]
    pub classes: Vec<i64>,
}

fn default_model() -> String {
    "yolov8n.onnx".into()
}
fn default_confidence() -> f32 {
    0.4
}
fn default_iou() -> f32 {
    0.5
}
fn default_device() -> String {
    "cpu".into()
}
fn default_classes() -> Vec<i64> {
    vec![2, 3, 5, 7]
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            confidence: default_confidence(),
            iou_threshold: default_iou(),
            device: default_device(),
            fp16: false,
            classes: default_classes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_max_lost_frames")]
    pub max_lost_frames: u32,
    #[serde(default = "default_min_hits")]
    pub min_hits: u32,
    #[serde(default = "default_tracking_iou")]
    pub iou_threshold: f32,
    #[serde(default = "default_max_age")]
    pub max_age: u32,
}

fn default_max_lost_frames() -> u32 {
    30
}
fn default_min_hits() -> u32 {
    3
}
fn default_tracking_iou() -> f32 {
    0.3
}
fn default_max_age() -> u32 {
    60
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_lost_frames: default_max_lost_frames(),
            min_hits: default_min_hits(),
            iou_threshold: default_tracking_iou(),
            max_age: default_max_age(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_throttle_frames")]
    pub throttle_frames: u32,
    #[serde(default = "default_min_plate_confidence")]
    pub min_plate_confidence: f32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_ocr_timeout")]
    pub timeout: f32,
    #[serde(default = "default_fusion_min_samples")]
    pub fusion_min_samples: usize,
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
}

fn default_language() -> String {
    "en".into()
}
fn default_throttle_frames() -> u32 {
    10
}
fn default_min_plate_confidence() -> f32 {
    0.6
}
fn default_max_concurrent() -> usize {
    2
}
fn default_ocr_timeout() -> f32 {
    0.5
}
fn default_fusion_min_samples() -> usize {
    3
}
fn default_max_samples() -> usize {
    5
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            language: default_language(),
            throttle_frames: default_throttle_frames(),
            min_plate_confidence: default_min_plate_confidence(),
            max_concurrent: default_max_concurrent(),
            timeout: default_ocr_timeout(),
            fusion_min_samples: default_fusion_min_samples(),
            max_samples: default_max_samples(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(default = "default_entry_y")]
    pub entry_y_threshold: f32,
    #[serde(default = "default_exit_y")]
    pub exit_y_threshold: f32,
    #[serde(default = "default_min_dwell")]
    pub min_dwell_time: f64,
    #[serde(default = "default_dedup_window")]
    pub dedup_window: i64,
    #[serde(default)]
    pub require_plate_for_entry: bool,
    #[serde(default = "default_true")]
    pub require_plate_for_exit: bool,
}

fn default_entry_y() -> f32 {
    0.6
}
fn default_exit_y() -> f32 {
    0.9
}
fn default_min_dwell() -> f64 {
    1.0
}
fn default_dedup_window() -> i64 {
    60
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            entry_y_threshold: default_entry_y(),
            exit_y_threshold: default_exit_y(),
            min_dwell_time: default_min_dwell(),
            dedup_window: default_dedup_window(),
            require_plate_for_entry: false,
            require_plate_for_exit: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_type")]
    pub r#type: String,
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_db_type() -> String {
    "sqlite".into()
}
fn default_db_path() -> String {
    "anpr.db".into()
}
fn default_pool_size() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            r#type: default_db_type(),
            path: default_db_path(),
            host: "localhost".into(),
            port: 5432,
            username: String::new(),
            password: String::new(),
            database: "anpr".into(),
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_workers")]
    pub workers: u32,
    #[serde(default)]
    pub reload: bool,
    #[serde(default = "default_cors")]
    pub cors_origins: Vec<String>,
}

fn default_api_host() -> String {
    "0.0.0.0".into()
}
fn default_api_port() -> u16 {
    8000
}
fn default_workers() -> u32 {
    1
}
fn default_cors() -> Vec<String> {
    vec!["*".into()]
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            workers: default_workers(),
            reload: false,
            cors_origins: default_cors(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub system: SystemSection,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub events: EventConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Load configuration from `path`. If the file does not exist, a demo
/// default is written there first and then loaded, matching
/// `Config.load`/`_create_default_config`/`_save_default` in the original
/// implementation.
pub fn load(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        let cfg = default_config();
        save(path, &cfg).with_context(|| format!("writing default config to {}", path.display()))?;
        return Ok(cfg);
    }

    let raw = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    let cfg: AppConfig = serde_yaml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(cfg)
}

fn save(path: &Path, cfg: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let yaml = serde_yaml::to_string(cfg)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Default configuration for demo mode: one USB camera, sqlite database.
pub fn default_config() -> AppConfig {
    AppConfig {
        system: SystemSection::default(),
        cameras: vec![CameraConfig {
            id: 1,
            name: "Demo Camera".into(),
            source: "0".into(),
            fps: 20,
            width: 1280,
            height: 720,
            enabled: true,
        }],
        detection: DetectionConfig::default(),
        tracking: TrackingConfig::default(),
        ocr: OcrConfig { enabled: true, ..OcrConfig::default() },
        events: EventConfig::default(),
        database: DatabaseConfig { r#type: "sqlite".into(), path: "anpr.db".into(), ..DatabaseConfig::default() },
        api: ApiConfig { host: "0.0.0.0".into(), port: 8000, ..ApiConfig::default() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_reloads_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let cfg = load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.cameras.len(), 1);
        assert_eq!(cfg.cameras[0].source, "0");

        let reloaded = load(&path).unwrap();
        assert_eq!(reloaded.cameras[0].id, cfg.cameras[0].id);
        assert_eq!(reloaded.database.path, cfg.database.path);
    }

    #[test]
    fn camera_source_classification() {
        let usb = CameraConfig { id: 1, name: "a".into(), source: "0".into(), fps: 20, width: 1280, height: 720, enabled: true };
        assert!(usb.is_usb());
        assert!(!usb.is_rtsp());

        let rtsp = CameraConfig { id: 2, name: "b".into(), source: "rtsp://x/y".into(), fps: 20, width: 1280, height: 720, enabled: true };
        assert!(rtsp.is_rtsp());
        assert!(!rtsp.is_usb());
    }
}
