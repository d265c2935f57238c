use std::sync::{Arc, Mutex};

use image::RgbImage;

use crate::detect::backend::{DetectorBackend, ScoreParams};
use crate::detect::result::ScoredBox;
use crate::detect::taxonomy::ClassTaxonomy;
use crate::error::DetectError;

/// Shared record of the scoring passes a [`StubBackend`] served.
#[derive(Clone, Debug, Default)]
pub struct StubCallLog {
    passes: Arc<Mutex<Vec<ScoreParams>>>,
}

impl StubCallLog {
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn passes(&self) -> Vec<ScoreParams> {
        self.lock().clone()
    }

    fn record(&self, params: ScoreParams) {
        self.lock().push(params);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ScoreParams>> {
        self.passes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Scripted backend for tests and dry runs.
///
/// Returns its configured candidates whose confidence reaches the requested
/// threshold, regardless of image content. Augmentation-only candidates are
/// added when a pass asks for augmentation.
pub struct StubBackend {
    taxonomy: ClassTaxonomy,
    candidates: Vec<ScoredBox>,
    augmented: Vec<ScoredBox>,
    fail_scoring: bool,
    calls: StubCallLog,
}

impl StubBackend {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_taxonomy(ClassTaxonomy::from_labels(labels))
    }

    pub fn with_taxonomy(taxonomy: ClassTaxonomy) -> Self {
        Self {
            taxonomy,
            candidates: Vec::new(),
            augmented: Vec::new(),
            fail_scoring: false,
            calls: StubCallLog::default(),
        }
    }

    pub fn with_candidate(mut self, class_id: u32, confidence: f32, bbox: [f32; 4]) -> Self {
        self.candidates.push(ScoredBox {
            class_id,
            confidence,
            bbox,
        });
        self
    }

    /// Candidate only visible to augmented passes.
    pub fn with_augmented_candidate(mut self, class_id: u32, confidence: f32, bbox: [f32; 4]) -> Self {
        self.augmented.push(ScoredBox {
            class_id,
            confidence,
            bbox,
        });
        self
    }

    /// Every scoring pass errors.
    pub fn failing(mut self) -> Self {
        self.fail_scoring = true;
        self
    }

    pub fn call_log(&self) -> StubCallLog {
        self.calls.clone()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn taxonomy(&self) -> &ClassTaxonomy {
        &self.taxonomy
    }

    fn score(
        &mut self,
        _image: &RgbImage,
        params: ScoreParams,
    ) -> Result<Vec<ScoredBox>, DetectError> {
        self.calls.record(params);
        if self.fail_scoring {
            return Err(DetectError::Backend("stub backend configured to fail".into()));
        }

        let extra: &[ScoredBox] = if params.augment { &self.augmented } else { &[] };
        Ok(self
            .candidates
            .iter()
            .chain(extra)
            .filter(|candidate| candidate.confidence >= params.confidence_threshold)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(confidence_threshold: f32, augment: bool) -> ScoreParams {
        ScoreParams {
            confidence_threshold,
            iou_threshold: 0.45,
            augment,
        }
    }

    #[test]
    fn stub_backend_applies_threshold_and_augmentation() {
        let mut backend = StubBackend::new(["pistol", "knife"])
            .with_candidate(0, 0.9, [0.0, 0.0, 10.0, 10.0])
            .with_candidate(1, 0.35, [5.0, 5.0, 20.0, 20.0])
            .with_augmented_candidate(1, 0.32, [1.0, 1.0, 2.0, 2.0]);
        let log = backend.call_log();
        let image = RgbImage::new(32, 32);

        let high = backend.score(&image, params(0.45, false)).unwrap();
        assert_eq!(high.len(), 1);

        let low = backend.score(&image, params(0.30, false)).unwrap();
        assert_eq!(low.len(), 2);

        let augmented = backend.score(&image, params(0.30, true)).unwrap();
        assert_eq!(augmented.len(), 3);

        assert_eq!(log.count(), 3);
        assert!(log.passes()[2].augment);
    }

    #[test]
    fn failing_stub_still_records_the_call() {
        let mut backend = StubBackend::new(["gun"]).failing();
        let log = backend.call_log();
        assert!(backend.score(&RgbImage::new(4, 4), params(0.5, false)).is_err());
        assert_eq!(log.count(), 1);
    }
}
