#![cfg(feature = "backend-tract")]

use std::path::Path;

use image::{imageops, Rgb, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectorBackend, ScoreParams};
use crate::detect::result::ScoredBox;
use crate::detect::taxonomy::ClassTaxonomy;
use crate::error::DetectError;

const LETTERBOX_FILL: Rgb<u8> = Rgb([114, 114, 114]);

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Expects a single output shaped `[1, 4 + classes, anchors]` (or its
/// transpose) with centre-format boxes in letterboxed input pixels.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    taxonomy: ClassTaxonomy,
    has_labels: bool,
}

/// Letterbox geometry used to map boxes back to the source image.
#[derive(Clone, Copy, Debug)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn load(
        model_path: &Path,
        labels_path: Option<&Path>,
        input_size: u32,
    ) -> Result<Self, DetectError> {
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .and_then(|model| {
                model.with_input_fact(
                    0,
                    InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
                )
            })
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|e| {
                DetectError::Initialization(format!(
                    "failed to load ONNX model from {}: {}",
                    model_path.display(),
                    e
                ))
            })?;

        let (taxonomy, has_labels) = match labels_path {
            Some(path) => (ClassTaxonomy::from_labels_file(path)?, true),
            None => (ClassTaxonomy::default(), false),
        };

        Ok(Self {
            model,
            input_size,
            taxonomy,
            has_labels,
        })
    }

    fn letterbox(&self, image: &RgbImage) -> (Tensor, Letterbox) {
        let size = self.input_size;
        let (width, height) = image.dimensions();
        let scale = (size as f32 / width.max(1) as f32).min(size as f32 / height.max(1) as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
        let resized = imageops::resize(image, new_w, new_h, imageops::FilterType::Triangle);

        let pad_x = (size - new_w) / 2;
        let pad_y = (size - new_h) / 2;
        let mut canvas = RgbImage::from_pixel(size, size, LETTERBOX_FILL);
        imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

        let side = size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            canvas.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });

        (
            input.into_tensor(),
            Letterbox {
                scale,
                pad_x: pad_x as f32,
                pad_y: pad_y as f32,
            },
        )
    }

    fn infer(&self, image: &RgbImage, confidence_threshold: f32) -> Result<(Vec<ScoredBox>, usize), DetectError> {
        let (input, geometry) = self.letterbox(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| DetectError::Backend(format!("ONNX inference failed: {e}")))?;
        let output = outputs
            .first()
            .ok_or_else(|| DetectError::Backend("model produced no outputs".into()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| DetectError::Backend(format!("model output tensor was not f32: {e}")))?;

        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(DetectError::Backend(format!(
                "unexpected output shape {:?}",
                shape
            )));
        }
        let view = view
            .into_dimensionality::<tract_ndarray::Ix3>()
            .map_err(|e| DetectError::Backend(format!("unexpected output layout: {e}")))?;
        // [1, 4 + classes, anchors] is the usual export; some exports transpose.
        let transposed = shape[1] > shape[2];
        let (rows, anchors) = if transposed {
            (shape[2], shape[1])
        } else {
            (shape[1], shape[2])
        };
        if rows <= 4 {
            return Err(DetectError::Backend(format!(
                "output has no class scores: {:?}",
                shape
            )));
        }
        let class_count = rows - 4;
        let at = |row: usize, anchor: usize| -> f32 {
            if transposed {
                view[[0, anchor, row]]
            } else {
                view[[0, row, anchor]]
            }
        };

        let (width, height) = image.dimensions();
        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let (class_id, confidence) = (0..class_count)
                .map(|class| (class, at(4 + class, anchor)))
                .fold((0, f32::NEG_INFINITY), |best, next| if next.1 > best.1 { next } else { best });
            if !confidence.is_finite() || confidence < confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (at(0, anchor), at(1, anchor), at(2, anchor), at(3, anchor));
            let unmap_x = |v: f32| ((v - geometry.pad_x) / geometry.scale).clamp(0.0, width as f32);
            let unmap_y = |v: f32| ((v - geometry.pad_y) / geometry.scale).clamp(0.0, height as f32);
            candidates.push(ScoredBox {
                class_id: class_id as u32,
                confidence,
                bbox: [
                    unmap_x(cx - w / 2.0),
                    unmap_y(cy - h / 2.0),
                    unmap_x(cx + w / 2.0),
                    unmap_y(cy + h / 2.0),
                ],
            });
        }
        Ok((candidates, class_count))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn taxonomy(&self) -> &ClassTaxonomy {
        &self.taxonomy
    }

    fn score(
        &mut self,
        image: &RgbImage,
        params: ScoreParams,
    ) -> Result<Vec<ScoredBox>, DetectError> {
        let (mut candidates, _) = self.infer(image, params.confidence_threshold)?;
        if params.augment {
            let flipped = imageops::flip_horizontal(image);
            let width = image.width() as f32;
            let (mirrored, _) = self.infer(&flipped, params.confidence_threshold)?;
            candidates.extend(mirrored.into_iter().map(|mut candidate| {
                let [x1, y1, x2, y2] = candidate.bbox;
                candidate.bbox = [width - x2, y1, width - x1, y2];
                candidate
            }));
        }
        Ok(non_max_suppression(candidates, params.iou_threshold))
    }

    fn warm_up(&mut self) -> Result<(), DetectError> {
        let blank = RgbImage::from_pixel(self.input_size, self.input_size, LETTERBOX_FILL);
        let (_, class_count) = self
            .infer(&blank, 1.0)
            .map_err(|e| DetectError::Initialization(e.to_string()))?;
        if !self.has_labels {
            self.taxonomy = ClassTaxonomy::numbered(class_count as u32);
        }
        Ok(())
    }
}

/// Greedy per-class NMS, highest confidence first.
pub(crate) fn non_max_suppression(mut candidates: Vec<ScoredBox>, iou_threshold: f32) -> Vec<ScoredBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<ScoredBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let suppressed = kept.iter().any(|existing| {
            existing.class_id == candidate.class_id && iou(&existing.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let intersection = ix * iy;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}
