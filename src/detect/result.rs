use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::round_to;

/// Decimal places kept for bounding box coordinates.
pub const BBOX_DECIMALS: u32 = 2;
/// Decimal places kept for confidences.
pub const CONFIDENCE_DECIMALS: u32 = 4;

/// Raw candidate produced by a backend scoring pass.
///
/// Boxes are `[x1, y1, x2, y2]` in source pixel coordinates. Backends are not
/// trusted to order or clamp them.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoredBox {
    pub class_id: u32,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

/// A single surviving detection. Immutable once produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_label: String,
    pub confidence: f64,
    /// `[x1, y1, x2, y2]` in pixels, `x1 <= x2`, `y1 <= y2`, all non-negative.
    pub bbox: [f64; 4],
    #[serde(rename = "frame_no", default, skip_serializing_if = "Option::is_none")]
    pub frame_index: Option<u64>,
    #[serde(rename = "time_sec", default, skip_serializing_if = "Option::is_none")]
    pub time_offset_sec: Option<f64>,
}

impl Detection {
    /// Build a detection from a backend candidate, clamping the box to the
    /// image and rounding for output stability.
    pub fn from_scored(label: String, candidate: &ScoredBox, width: u32, height: u32) -> Self {
        let [a, b, c, d] = candidate.bbox.map(|v| if v.is_finite() { v as f64 } else { 0.0 });
        let max_x = width as f64;
        let max_y = height as f64;
        let (x1, x2) = (a.min(c).clamp(0.0, max_x), a.max(c).clamp(0.0, max_x));
        let (y1, y2) = (b.min(d).clamp(0.0, max_y), b.max(d).clamp(0.0, max_y));
        let confidence = if candidate.confidence.is_finite() {
            (candidate.confidence as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            class_label: label,
            confidence: round_to(confidence, CONFIDENCE_DECIMALS),
            bbox: [x1, y1, x2, y2].map(|v| round_to(v, BBOX_DECIMALS)),
            frame_index: None,
            time_offset_sec: None,
        }
    }

    /// Copy of this detection tagged with its originating video frame.
    pub fn at_frame(&self, frame_index: u64, time_offset_sec: f64) -> Self {
        Self {
            frame_index: Some(frame_index),
            time_offset_sec: Some(time_offset_sec),
            ..self.clone()
        }
    }
}

/// Encoded preview image with boxes drawn on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnotatedImage {
    /// JPEG bytes.
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Outcome of one detection invocation. Never mutated after return.
#[derive(Clone, Debug, Serialize)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
    #[serde(rename = "detections_count")]
    pub count: usize,
    #[serde(rename = "processing_time_ms")]
    pub elapsed_ms: f64,
    #[serde(skip)]
    pub annotated: Option<AnnotatedImage>,
    #[serde(rename = "class_names")]
    pub known_classes: BTreeSet<String>,
}

impl DetectionResult {
    pub fn new(
        detections: Vec<Detection>,
        elapsed_ms: f64,
        annotated: Option<AnnotatedImage>,
        known_classes: BTreeSet<String>,
    ) -> Self {
        Self {
            count: detections.len(),
            detections,
            elapsed_ms: round_to(elapsed_ms.max(0.0), 2),
            annotated,
            known_classes,
        }
    }

    pub fn empty(known_classes: BTreeSet<String>) -> Self {
        Self::new(Vec::new(), 0.0, None, known_classes)
    }
}

/// Aggregate outcome of sampling and scoring a video.
#[derive(Clone, Debug, Serialize)]
pub struct VideoDetectionResult {
    #[serde(flatten)]
    pub result: DetectionResult,
    #[serde(rename = "processed_frames")]
    pub processed_frame_count: usize,
    #[serde(rename = "total_frames")]
    pub total_frame_count: u64,
    #[serde(rename = "frames_with_detections")]
    pub frames_with_any_detection: usize,
    #[serde(rename = "fps")]
    pub sampled_fps: f64,
}
