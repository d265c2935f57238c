use thiserror::Error;

/// Failure taxonomy of the detection core.
///
/// Only `Initialization` is allowed to abort a detection call. Every other
/// variant is absorbed by the pipeline or orchestrator and degrades the
/// result instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectError {
    /// Backend asset missing or corrupt. Terminal for the process lifetime.
    #[error("detection backend initialization failed: {0}")]
    Initialization(String),

    /// Unreadable image or video container.
    #[error("media read error: {0}")]
    MediaRead(String),

    /// A single frame inside a readable video could not be decoded.
    #[error("frame {index} could not be decoded: {reason}")]
    FrameDecode { index: u64, reason: String },

    /// Drawing or encoding the annotated preview failed.
    #[error("annotation render error: {0}")]
    AnnotationRender(String),

    /// A scoring pass failed after the backend was loaded.
    #[error("backend scoring error: {0}")]
    Backend(String),
}

impl DetectError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DetectError::Initialization(_))
    }
}

impl From<image::ImageError> for DetectError {
    fn from(error: image::ImageError) -> Self {
        DetectError::MediaRead(error.to_string())
    }
}
