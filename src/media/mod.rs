//! Media input for the detection core.
//!
//! Images are decoded in memory. Videos are read through the
//! [`FrameExtractor`] seam so the orchestrator never touches containers or
//! codecs directly:
//! - `FrameSequence`: in-memory frames (tests, pre-decoded input)
//! - `SyntheticVideo`: generated gradient frames for `stub://` paths
//! - `FfmpegFrameExtractor`: local files (feature: ingest-file-ffmpeg)
//!
//! Uploaded bytes that a decoder can only read from disk are staged in a
//! temporary file that is removed on drop.

mod decode;
mod extract;
#[cfg(feature = "ingest-file-ffmpeg")]
mod ffmpeg;
mod staging;

pub use decode::{decode_image, load_image};
pub use extract::{
    open_video_file, FrameExtractor, FrameSequence, SyntheticVideo, VideoInfo,
    DEFAULT_SOURCE_FPS,
};
#[cfg(feature = "ingest-file-ffmpeg")]
pub use ffmpeg::FfmpegFrameExtractor;
pub use staging::{extension_of, StagedMedia, IMAGE_EXTENSIONS, VIDEO_EXTENSIONS};
