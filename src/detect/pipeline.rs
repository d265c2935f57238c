use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use ab_glyph::FontArc;
use image::RgbImage;

use crate::config::DetectorConfig;
use crate::detect::annotate::{load_font, render_annotated};
use crate::detect::backend::{DetectorBackend, ScoreParams};
use crate::detect::lifecycle::{BackendStatus, LazyBackend};
use crate::detect::result::{AnnotatedImage, Detection, DetectionResult};
use crate::detect::taxonomy::TargetClasses;
use crate::error::DetectError;
use crate::media;

/// Detections from one image before annotation.
#[derive(Clone, Debug, Default)]
pub struct FrameScore {
    pub detections: Vec<Detection>,
    pub elapsed_ms: f64,
    /// True when the low-threshold pass ran.
    pub escalated: bool,
}

/// Runs the backend against single images with confidence escalation,
/// class filtering, timing and optional annotation.
///
/// Cheap to clone; clones share the lazily loaded backend.
#[derive(Clone)]
pub struct DetectionPipeline {
    config: Arc<DetectorConfig>,
    targets: TargetClasses,
    backend: Arc<LazyBackend>,
    font: Option<FontArc>,
}

impl DetectionPipeline {
    pub fn new(config: DetectorConfig, backend: LazyBackend) -> Self {
        let font = config.font_path.as_deref().and_then(load_font);
        Self {
            targets: TargetClasses::new(&config.target_classes),
            config: Arc::new(config),
            backend: Arc::new(backend),
            font,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn backend_status(&self) -> BackendStatus {
        self.backend.status()
    }

    /// Labels the backend knows. Forces backend initialization.
    pub fn known_classes(&self) -> Result<BTreeSet<String>, DetectError> {
        let backend = self.backend.get()?;
        let guard = backend.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.taxonomy().labels())
    }

    /// Detect on a decoded image.
    pub fn detect(
        &self,
        image: &RgbImage,
        filter_to_target_classes: bool,
    ) -> Result<DetectionResult, DetectError> {
        let known_classes = self.known_classes()?;
        let scored = self.score_frame(image, filter_to_target_classes)?;
        let annotated = self.render(image, &scored.detections);
        Ok(DetectionResult::new(
            scored.detections,
            scored.elapsed_ms,
            annotated,
            known_classes,
        ))
    }

    /// Detect on encoded image bytes. Undecodable bytes yield an empty result.
    pub fn detect_bytes(
        &self,
        bytes: &[u8],
        filter_to_target_classes: bool,
    ) -> Result<DetectionResult, DetectError> {
        let known_classes = self.known_classes()?;
        match media::decode_image(bytes) {
            Ok(image) => self.detect(&image, filter_to_target_classes),
            Err(err) => {
                log::warn!("image unreadable, returning empty result: {}", err);
                Ok(DetectionResult::empty(known_classes))
            }
        }
    }

    /// Detect on an image file. An unreadable file yields an empty result.
    pub fn detect_path(
        &self,
        path: &Path,
        filter_to_target_classes: bool,
    ) -> Result<DetectionResult, DetectError> {
        let known_classes = self.known_classes()?;
        match media::load_image(path) {
            Ok(image) => self.detect(&image, filter_to_target_classes),
            Err(err) => {
                log::warn!("{} unreadable, returning empty result: {}", path.display(), err);
                Ok(DetectionResult::empty(known_classes))
            }
        }
    }

    /// Primary pass plus optional escalation, without annotation.
    ///
    /// When escalation fires the low-threshold outcome is kept even if it is
    /// still empty.
    pub fn score_frame(
        &self,
        image: &RgbImage,
        filter_to_target_classes: bool,
    ) -> Result<FrameScore, DetectError> {
        let backend = self.backend.get()?;
        let mut guard = backend.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let start = Instant::now();
        let primary = ScoreParams {
            confidence_threshold: self.config.confidence_threshold,
            iou_threshold: self.config.iou_threshold,
            augment: false,
        };
        let mut detections = self.run_pass(&mut **guard, image, primary, filter_to_target_classes);

        let escalated = detections.is_empty() && self.config.escalate_on_miss;
        if escalated {
            log::debug!(
                "no detections at {:.2}, retrying at {:.2} with augmentation",
                self.config.confidence_threshold,
                self.config.low_confidence_threshold
            );
            let fallback = ScoreParams {
                confidence_threshold: self.config.low_confidence_threshold,
                iou_threshold: self.config.iou_threshold,
                augment: true,
            };
            detections = self.run_pass(&mut **guard, image, fallback, filter_to_target_classes);
        }

        Ok(FrameScore {
            detections,
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
            escalated,
        })
    }

    /// Annotated preview, or `None` when annotation is disabled or fails.
    pub fn render(&self, image: &RgbImage, detections: &[Detection]) -> Option<AnnotatedImage> {
        if !self.config.annotate {
            return None;
        }
        match render_annotated(image, detections, self.font.as_ref()) {
            Ok(annotated) => Some(annotated),
            Err(err) => {
                log::debug!("annotation skipped: {}", err);
                None
            }
        }
    }

    fn run_pass(
        &self,
        backend: &mut dyn DetectorBackend,
        image: &RgbImage,
        params: ScoreParams,
        filter_to_target_classes: bool,
    ) -> Vec<Detection> {
        let candidates = match backend.score(image, params) {
            Ok(candidates) => candidates,
            Err(err) => {
                log::warn!("{} scoring pass failed: {}", backend.name(), err);
                return Vec::new();
            }
        };
        let (width, height) = image.dimensions();
        let taxonomy = backend.taxonomy();
        candidates
            .iter()
            .filter(|candidate| candidate.confidence >= params.confidence_threshold)
            .filter_map(|candidate| {
                let label = taxonomy.label(candidate.class_id);
                if filter_to_target_classes && !self.targets.matches(&label) {
                    return None;
                }
                Some(Detection::from_scored(label, candidate, width, height))
            })
            .collect()
    }
}
