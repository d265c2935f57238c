use std::path::PathBuf;

use crate::config::{BackendKind, BackendSettings, DEFAULT_TARGET_CLASSES};
use crate::detect::backend::DetectorBackend;
use crate::detect::taxonomy::ClassTaxonomy;
use crate::error::DetectError;

pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{StubBackend, StubCallLog};

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;

/// Construct the configured backend. Any failure is an initialization error.
pub fn load_backend(settings: &BackendSettings) -> Result<Box<dyn DetectorBackend>, DetectError> {
    match settings.kind {
        BackendKind::Stub => {
            let taxonomy = match &settings.labels_path {
                Some(path) => ClassTaxonomy::from_labels_file(path)?,
                None => ClassTaxonomy::from_labels(DEFAULT_TARGET_CLASSES.iter().copied()),
            };
            Ok(Box::new(StubBackend::with_taxonomy(taxonomy)))
        }
        BackendKind::Onnx => {
            let model_path = resolve_model_path(settings)?;
            #[cfg(feature = "backend-tract")]
            {
                log::info!("loading ONNX model {}", model_path.display());
                let backend = TractBackend::load(
                    &model_path,
                    settings.labels_path.as_deref(),
                    settings.input_size,
                )?;
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "backend-tract"))]
            {
                Err(DetectError::Initialization(format!(
                    "ONNX backend for {} requires the backend-tract feature",
                    model_path.display()
                )))
            }
        }
    }
}

/// Pick the configured model, or the fallback model when the configured one
/// is absent.
pub fn resolve_model_path(settings: &BackendSettings) -> Result<PathBuf, DetectError> {
    if settings.model_path.is_file() {
        return Ok(settings.model_path.clone());
    }
    if let Some(fallback) = settings.fallback_model_path.as_ref().filter(|p| p.is_file()) {
        log::warn!(
            "model {} not found, falling back to {}",
            settings.model_path.display(),
            fallback.display()
        );
        return Ok(fallback.clone());
    }
    Err(DetectError::Initialization(format!(
        "model file {} not found",
        settings.model_path.display()
    )))
}
