mod annotate;
mod backend;
pub mod backends;
mod lifecycle;
mod pipeline;
mod result;
mod taxonomy;

pub use annotate::{load_font, render_annotated};
pub use backend::{DetectorBackend, ScoreParams};
pub use backends::{load_backend, StubBackend, StubCallLog};
pub use lifecycle::{BackendStatus, LazyBackend, SharedBackend};
pub use pipeline::{DetectionPipeline, FrameScore};
pub use result::{
    AnnotatedImage, Detection, DetectionResult, ScoredBox, VideoDetectionResult, BBOX_DECIMALS,
    CONFIDENCE_DECIMALS,
};
pub use taxonomy::{ClassTaxonomy, TargetClasses};
