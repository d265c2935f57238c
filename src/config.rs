use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_DB_PATH: &str = "data/history.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_OUTPUT_DIR: &str = "outputs";
const DEFAULT_MODEL_PATH: &str = "models/weapon_yolov8.onnx";
const DEFAULT_FALLBACK_MODEL_PATH: &str = "models/yolov8s.onnx";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
const DEFAULT_CONF_THRESHOLD: f32 = 0.45;
const DEFAULT_CONF_THRESHOLD_LOW: f32 = 0.30;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
const DEFAULT_MAX_VIDEO_FRAMES: usize = 60;
const DEFAULT_VIDEO_SAMPLE_FPS: f64 = 1.0;

pub const DEFAULT_TARGET_CLASSES: &[&str] = &[
    "gun", "pistol", "rifle", "knife", "handgun", "shotgun", "sword", "weapon", "firearm",
    "blade",
];

#[derive(Debug, Deserialize, Default)]
struct ServiceConfigFile {
    db_path: Option<String>,
    output_dir: Option<PathBuf>,
    api: Option<ApiConfigFile>,
    backend: Option<BackendConfigFile>,
    detection: Option<DetectionConfigFile>,
    video: Option<VideoConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    max_upload_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct BackendConfigFile {
    kind: Option<String>,
    model_path: Option<PathBuf>,
    fallback_model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    confidence_threshold: Option<f32>,
    low_confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    escalate_on_miss: Option<bool>,
    target_classes: Option<Vec<String>>,
    annotate: Option<bool>,
    font_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    max_frames: Option<usize>,
    frames_per_second: Option<f64>,
}

/// Immutable knobs of the detection pipeline. Built once and handed to
/// `DetectionPipeline::new`.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub confidence_threshold: f32,
    pub low_confidence_threshold: f32,
    pub iou_threshold: f32,
    pub escalate_on_miss: bool,
    /// Substring terms matched case-insensitively against class labels.
    pub target_classes: Vec<String>,
    /// Render annotated previews.
    pub annotate: bool,
    /// TrueType font for box labels. Boxes are drawn without labels when unset.
    pub font_path: Option<PathBuf>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONF_THRESHOLD,
            low_confidence_threshold: DEFAULT_CONF_THRESHOLD_LOW,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            escalate_on_miss: true,
            target_classes: DEFAULT_TARGET_CLASSES
                .iter()
                .map(|term| term.to_string())
                .collect(),
            annotate: true,
            font_path: None,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<()> {
        check_unit("confidence_threshold", self.confidence_threshold)?;
        check_unit("low_confidence_threshold", self.low_confidence_threshold)?;
        check_unit("iou_threshold", self.iou_threshold)?;
        if self.low_confidence_threshold > self.confidence_threshold {
            return Err(anyhow!(
                "low_confidence_threshold ({}) must not exceed confidence_threshold ({})",
                self.low_confidence_threshold,
                self.confidence_threshold
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoSamplingConfig {
    pub max_frames: usize,
    pub frames_per_second: f64,
}

impl Default for VideoSamplingConfig {
    fn default() -> Self {
        Self {
            max_frames: DEFAULT_MAX_VIDEO_FRAMES,
            frames_per_second: DEFAULT_VIDEO_SAMPLE_FPS,
        }
    }
}

impl VideoSamplingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_frames == 0 {
            return Err(anyhow!("video max_frames must be at least 1"));
        }
        if !self.frames_per_second.is_finite() || self.frames_per_second <= 0.0 {
            return Err(anyhow!("video frames_per_second must be a positive number"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Onnx,
    Stub,
}

impl BackendKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "onnx" | "tract" => Ok(BackendKind::Onnx),
            "stub" => Ok(BackendKind::Stub),
            other => Err(anyhow!("unknown backend kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub model_path: PathBuf,
    pub fallback_model_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    pub input_size: u32,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::Onnx,
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            fallback_model_path: Some(PathBuf::from(DEFAULT_FALLBACK_MODEL_PATH)),
            labels_path: None,
            input_size: DEFAULT_INPUT_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db_path: String,
    pub output_dir: PathBuf,
    pub api_addr: String,
    pub max_upload_bytes: usize,
    pub backend: BackendSettings,
    pub detector: DetectorConfig,
    pub video: VideoSamplingConfig,
}

impl ServiceConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("WEAPON_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ServiceConfigFile) -> Result<Self> {
        let defaults = DetectorConfig::default();
        let backend_defaults = BackendSettings::default();

        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let output_dir = file
            .output_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
        let api_addr = file
            .api
            .as_ref()
            .and_then(|api| api.addr.clone())
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let max_upload_bytes = file
            .api
            .as_ref()
            .and_then(|api| api.max_upload_bytes)
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);

        let backend_file = file.backend.unwrap_or_default();
        let backend = BackendSettings {
            kind: match backend_file.kind.as_deref() {
                Some(kind) => BackendKind::parse(kind)?,
                None => backend_defaults.kind,
            },
            model_path: backend_file
                .model_path
                .unwrap_or(backend_defaults.model_path),
            fallback_model_path: backend_file
                .fallback_model_path
                .or(backend_defaults.fallback_model_path),
            labels_path: backend_file.labels_path,
            input_size: backend_file
                .input_size
                .unwrap_or(backend_defaults.input_size),
        };

        let detection = file.detection.unwrap_or_default();
        let detector = DetectorConfig {
            confidence_threshold: detection
                .confidence_threshold
                .unwrap_or(defaults.confidence_threshold),
            low_confidence_threshold: detection
                .low_confidence_threshold
                .unwrap_or(defaults.low_confidence_threshold),
            iou_threshold: detection.iou_threshold.unwrap_or(defaults.iou_threshold),
            escalate_on_miss: detection
                .escalate_on_miss
                .unwrap_or(defaults.escalate_on_miss),
            target_classes: detection
                .target_classes
                .unwrap_or(defaults.target_classes),
            annotate: detection.annotate.unwrap_or(defaults.annotate),
            font_path: detection.font_path,
        };

        let video_defaults = VideoSamplingConfig::default();
        let video = VideoSamplingConfig {
            max_frames: file
                .video
                .as_ref()
                .and_then(|video| video.max_frames)
                .unwrap_or(video_defaults.max_frames),
            frames_per_second: file
                .video
                .as_ref()
                .and_then(|video| video.frames_per_second)
                .unwrap_or(video_defaults.frames_per_second),
        };

        Ok(Self {
            db_path,
            output_dir,
            api_addr,
            max_upload_bytes,
            backend,
            detector,
            video,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_value("WEAPON_DB_PATH") {
            self.db_path = path;
        }
        if let Some(addr) = env_value("WEAPON_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(dir) = env_value("WEAPON_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(bytes) = env_value("WEAPON_MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = bytes
                .parse()
                .map_err(|_| anyhow!("WEAPON_MAX_UPLOAD_BYTES must be an integer byte count"))?;
        }
        if let Some(kind) = env_value("WEAPON_BACKEND") {
            self.backend.kind = BackendKind::parse(&kind)?;
        }
        if let Some(model) = env_value("WEAPON_MODEL") {
            self.backend.model_path = PathBuf::from(model);
        }
        if let Some(model) = env_value("WEAPON_FALLBACK_MODEL") {
            self.backend.fallback_model_path = Some(PathBuf::from(model));
        }
        if let Some(labels) = env_value("WEAPON_LABELS") {
            self.backend.labels_path = Some(PathBuf::from(labels));
        }
        if let Some(value) = env_value("CONF_THRESHOLD") {
            self.detector.confidence_threshold = parse_f32("CONF_THRESHOLD", &value)?;
        }
        if let Some(value) = env_value("CONF_THRESHOLD_LOW") {
            self.detector.low_confidence_threshold = parse_f32("CONF_THRESHOLD_LOW", &value)?;
        }
        if let Some(value) = env_value("IOU_THRESHOLD") {
            self.detector.iou_threshold = parse_f32("IOU_THRESHOLD", &value)?;
        }
        if let Some(value) = env_value("IMPROVE_ON_MISS") {
            self.detector.escalate_on_miss = parse_flag(&value);
        }
        if let Some(classes) = env_value("WEAPON_TARGET_CLASSES") {
            let parsed = split_csv(&classes);
            if !parsed.is_empty() {
                self.detector.target_classes = parsed;
            }
        }
        if let Some(font) = env_value("WEAPON_FONT_PATH") {
            self.detector.font_path = Some(PathBuf::from(font));
        }
        if let Some(frames) = env_value("WEAPON_MAX_VIDEO_FRAMES") {
            self.video.max_frames = frames
                .parse()
                .map_err(|_| anyhow!("WEAPON_MAX_VIDEO_FRAMES must be an integer"))?;
        }
        if let Some(fps) = env_value("WEAPON_VIDEO_SAMPLE_FPS") {
            self.video.frames_per_second = fps
                .parse()
                .map_err(|_| anyhow!("WEAPON_VIDEO_SAMPLE_FPS must be a number"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.detector.validate()?;
        self.video.validate()?;
        if self.max_upload_bytes == 0 {
            return Err(anyhow!("max_upload_bytes must be greater than zero"));
        }
        if self.backend.input_size == 0 || self.backend.input_size % 32 != 0 {
            return Err(anyhow!(
                "backend input_size must be a positive multiple of 32, got {}",
                self.backend.input_size
            ));
        }
        self.detector.target_classes = self
            .detector
            .target_classes
            .iter()
            .map(|term| term.trim().to_lowercase())
            .filter(|term| !term.is_empty())
            .collect();
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ServiceConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_f32(key: &str, value: &str) -> Result<f32> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{} must be a number", key))
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

fn check_unit(key: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} must be within [0, 1], got {}", key, value));
    }
    Ok(())
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
