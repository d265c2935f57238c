//! Weapon Detection Service
//!
//! This crate wraps a black-box object detector in a sampling and refinement
//! pipeline for still images and videos, records each query in a local
//! history store, and renders reports from that history.
//!
//! # Architecture
//!
//! The detection core is deliberately small:
//!
//! 1. **Lazy backend**: the detector is loaded once per process; a failed load
//!    is cached and every later call fails the same way.
//! 2. **Escalation**: an empty primary pass is retried once at a lower
//!    confidence threshold with test-time augmentation.
//! 3. **Graceful degradation**: unreadable media, failed frames and failed
//!    annotation shrink the result instead of failing the call.
//!
//! # Module Structure
//!
//! - `detect`: data model, backends, lifecycle, `DetectionPipeline`
//! - `media`: image decoding and video frame extraction
//! - `video`: `VideoOrchestrator` (sampling, aggregation, best frame)
//! - `history`: query history stores and JSON export
//! - `report`: text and CSV renderers over history
//! - `api`: blocking HTTP service

use anyhow::Result;
use rusqlite::{Connection, OpenFlags};

pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod history;
pub mod media;
pub mod report;
pub mod video;

pub use config::{
    BackendKind, BackendSettings, DetectorConfig, ServiceConfig, VideoSamplingConfig,
};
pub use detect::{
    BackendStatus, ClassTaxonomy, Detection, DetectionPipeline, DetectionResult, DetectorBackend,
    LazyBackend, ScoreParams, ScoredBox, StubBackend, TargetClasses, VideoDetectionResult,
};
pub use error::DetectError;
pub use history::{
    HistoryStats, HistoryStore, InMemoryHistoryStore, QueryRecord, SourceKind,
    SqliteHistoryStore,
};
pub use media::{FrameExtractor, FrameSequence, SyntheticVideo, VideoInfo};
pub use video::{sample_indices, VideoOrchestrator};

/// URI for a private shared-cache in-memory database.
pub fn shared_memory_uri() -> String {
    format!(
        "file:weapon_history_{}?mode=memory&cache=shared",
        uuid::Uuid::new_v4().simple()
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(Connection::open(db_path)?)
}

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}
