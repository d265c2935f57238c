use std::path::Path;

use image::{Rgb, RgbImage};

use crate::error::DetectError;

/// Frame rate assumed when the container does not report one.
pub const DEFAULT_SOURCE_FPS: f64 = 30.0;

/// Container metadata reported by [`FrameExtractor::open`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VideoInfo {
    /// Source frame rate, if the container reports a usable one.
    pub fps: Option<f64>,
    /// Total frame count; 0 when unknown.
    pub total_frames: u64,
}

/// Random access to the frames of one video.
///
/// `open` fails with `MediaRead` when the container is unreadable.
/// `read_frame` fails with `FrameDecode` for a single bad or missing frame.
pub trait FrameExtractor {
    fn open(&mut self) -> Result<VideoInfo, DetectError>;
    fn read_frame(&mut self, index: u64) -> Result<RgbImage, DetectError>;
}

/// In-memory video. A `None` slot is a frame that fails to decode.
#[derive(Clone, Debug, Default)]
pub struct FrameSequence {
    frames: Vec<Option<RgbImage>>,
    fps: Option<f64>,
    reported_total: Option<u64>,
    unreadable: bool,
}

impl FrameSequence {
    pub fn new(frames: Vec<Option<RgbImage>>, fps: Option<f64>) -> Self {
        Self {
            frames,
            fps,
            reported_total: None,
            unreadable: false,
        }
    }

    /// Override the frame count reported by `open`, as a container with
    /// missing or wrong metadata would.
    pub fn with_reported_total(mut self, total: u64) -> Self {
        self.reported_total = Some(total);
        self
    }

    /// A sequence whose container cannot be opened at all.
    pub fn unreadable() -> Self {
        Self {
            unreadable: true,
            ..Self::default()
        }
    }
}

impl FrameExtractor for FrameSequence {
    fn open(&mut self) -> Result<VideoInfo, DetectError> {
        if self.unreadable {
            return Err(DetectError::MediaRead("container unreadable".into()));
        }
        Ok(VideoInfo {
            fps: self.fps,
            total_frames: self.reported_total.unwrap_or(self.frames.len() as u64),
        })
    }

    fn read_frame(&mut self, index: u64) -> Result<RgbImage, DetectError> {
        match self.frames.get(index as usize) {
            Some(Some(frame)) => Ok(frame.clone()),
            Some(None) => Err(DetectError::FrameDecode {
                index,
                reason: "corrupt frame".into(),
            }),
            None => Err(DetectError::FrameDecode {
                index,
                reason: "past end of stream".into(),
            }),
        }
    }
}

/// Generated video for `stub://` paths.
///
/// Accepts `stub://<name>?frames=<n>&fps=<f>`; defaults are 90 frames at 30
/// fps. Each frame is a gradient shifted by its index.
#[derive(Clone, Debug)]
pub struct SyntheticVideo {
    total_frames: u64,
    fps: f64,
    width: u32,
    height: u32,
}

impl SyntheticVideo {
    pub fn new(total_frames: u64, fps: f64) -> Self {
        Self {
            total_frames,
            fps,
            width: 320,
            height: 240,
        }
    }

    pub fn from_uri(uri: &str) -> Self {
        let mut video = Self::new(90, DEFAULT_SOURCE_FPS);
        let query = uri.split_once('?').map(|(_, q)| q).unwrap_or("");
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("frames", value)) => {
                    if let Ok(frames) = value.parse() {
                        video.total_frames = frames;
                    }
                }
                Some(("fps", value)) => {
                    if let Ok(fps) = value.parse::<f64>() {
                        if fps > 0.0 {
                            video.fps = fps;
                        }
                    }
                }
                _ => {}
            }
        }
        video
    }
}

impl FrameExtractor for SyntheticVideo {
    fn open(&mut self) -> Result<VideoInfo, DetectError> {
        log::info!(
            "synthetic video opened ({} frames @ {} fps)",
            self.total_frames,
            self.fps
        );
        Ok(VideoInfo {
            fps: Some(self.fps),
            total_frames: self.total_frames,
        })
    }

    fn read_frame(&mut self, index: u64) -> Result<RgbImage, DetectError> {
        if index >= self.total_frames.max(1) {
            return Err(DetectError::FrameDecode {
                index,
                reason: "past end of stream".into(),
            });
        }
        let shift = (index % 256) as u32;
        Ok(RgbImage::from_fn(self.width, self.height, |x, y| {
            Rgb([
                ((x + shift) % 256) as u8,
                ((y + shift) % 256) as u8,
                (shift % 256) as u8,
            ])
        }))
    }
}

/// Extractor used when no decoder for real files is compiled in.
#[cfg(not(feature = "ingest-file-ffmpeg"))]
struct UnsupportedVideo {
    path: String,
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
impl FrameExtractor for UnsupportedVideo {
    fn open(&mut self) -> Result<VideoInfo, DetectError> {
        Err(DetectError::MediaRead(format!(
            "cannot decode {}: video decoding requires the ingest-file-ffmpeg feature",
            self.path
        )))
    }

    fn read_frame(&mut self, index: u64) -> Result<RgbImage, DetectError> {
        Err(DetectError::FrameDecode {
            index,
            reason: "no video decoder".into(),
        })
    }
}

/// Pick an extractor for a local path. `stub://` paths are synthetic.
pub fn open_video_file(path: &Path) -> Box<dyn FrameExtractor> {
    let display = path.to_string_lossy();
    if display.starts_with("stub://") {
        return Box::new(SyntheticVideo::from_uri(&display));
    }
    #[cfg(feature = "ingest-file-ffmpeg")]
    {
        Box::new(super::ffmpeg::FfmpegFrameExtractor::new(path))
    }
    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    {
        Box::new(UnsupportedVideo {
            path: display.into_owned(),
        })
    }
}
