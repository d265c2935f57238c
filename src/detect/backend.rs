use image::RgbImage;

use crate::detect::result::ScoredBox;
use crate::detect::taxonomy::ClassTaxonomy;
use crate::error::DetectError;

/// Thresholds for a single scoring pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Backend-specific test-time augmentation.
    pub augment: bool,
}

/// Detection backend trait.
///
/// A backend is an opaque scoring oracle: image in, candidate boxes out. It
/// is loaded once per process and then shared behind a mutex, which is why
/// `score` may take `&mut self`.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Class id -> label mapping loaded with the model.
    fn taxonomy(&self) -> &ClassTaxonomy;

    /// Score an RGB image. Returned candidates already respect
    /// `params.confidence_threshold` and have been through NMS.
    fn score(&mut self, image: &RgbImage, params: ScoreParams)
        -> Result<Vec<ScoredBox>, DetectError>;

    /// Optional warm-up hook, run once right after loading.
    fn warm_up(&mut self) -> Result<(), DetectError> {
        Ok(())
    }
}
