//! Local video frame extraction using FFmpeg.
//!
//! Frames are decoded sequentially in memory. Requests for an index behind
//! the decode cursor reopen the input, so forward sampling (the only pattern
//! the orchestrator uses) decodes each frame at most once.

use std::path::{Path, PathBuf};

use ffmpeg_next as ffmpeg;
use image::RgbImage;

use super::extract::{FrameExtractor, VideoInfo};
use crate::error::DetectError;

pub struct FfmpegFrameExtractor {
    path: PathBuf,
    stream: Option<DecodeStream>,
}

struct DecodeStream {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    current: ffmpeg::frame::Video,
    /// Number of frames decoded so far.
    cursor: u64,
    eof: bool,
}

impl FfmpegFrameExtractor {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            stream: None,
        }
    }

    fn media_err(&self, what: &str, err: impl std::fmt::Display) -> DetectError {
        DetectError::MediaRead(format!("{} '{}': {}", what, self.path.display(), err))
    }

    fn open_stream(&self) -> Result<(DecodeStream, VideoInfo), DetectError> {
        ffmpeg::init().map_err(|e| self.media_err("initialize ffmpeg for", e))?;
        let input = ffmpeg::format::input(&self.path)
            .map_err(|e| self.media_err("failed to open video", e))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| self.media_err("no video track in", "missing stream"))?;
        let stream_index = input_stream.index();

        let rate = rational_to_f64(input_stream.avg_frame_rate())
            .or_else(|| rational_to_f64(input_stream.rate()));
        let total_frames = if input_stream.frames() > 0 {
            input_stream.frames() as u64
        } else {
            let seconds = rational_to_f64(input_stream.time_base())
                .map(|base| input_stream.duration().max(0) as f64 * base)
                .unwrap_or(0.0);
            rate.map(|fps| (seconds * fps).floor() as u64).unwrap_or(0)
        };

        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .map_err(|e| self.media_err("load decoder parameters for", e))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| self.media_err("open video decoder for", e))?;
        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .map_err(|e| self.media_err("create scaler for", e))?;

        Ok((
            DecodeStream {
                input,
                stream_index,
                decoder,
                scaler,
                current: ffmpeg::frame::Video::empty(),
                cursor: 0,
                eof: false,
            },
            VideoInfo {
                fps: rate,
                total_frames,
            },
        ))
    }
}

impl FrameExtractor for FfmpegFrameExtractor {
    fn open(&mut self) -> Result<VideoInfo, DetectError> {
        let (stream, info) = self.open_stream()?;
        log::info!(
            "opened {} ({} frames, fps {:?})",
            self.path.display(),
            info.total_frames,
            info.fps
        );
        self.stream = Some(stream);
        Ok(info)
    }

    fn read_frame(&mut self, index: u64) -> Result<RgbImage, DetectError> {
        let rewind = self
            .stream
            .as_ref()
            .map_or(true, |stream| stream.cursor > index);
        if rewind {
            let (stream, _) = self
                .open_stream()
                .map_err(|e| DetectError::FrameDecode {
                    index,
                    reason: e.to_string(),
                })?;
            self.stream = Some(stream);
        }
        let stream = self.stream.as_mut().ok_or_else(|| DetectError::FrameDecode {
            index,
            reason: "decoder not open".into(),
        })?;

        while stream.advance(index)? {
            if stream.cursor - 1 == index {
                return stream.current_image(index);
            }
        }
        Err(DetectError::FrameDecode {
            index,
            reason: "past end of stream".into(),
        })
    }
}

impl DecodeStream {
    /// Decode the next frame into `current`. Returns false once drained.
    fn advance(&mut self, target: u64) -> Result<bool, DetectError> {
        loop {
            if self.decoder.receive_frame(&mut self.current).is_ok() {
                self.cursor += 1;
                return Ok(true);
            }
            if self.eof {
                return Ok(false);
            }
            let next = self.input.packets().next();
            match next {
                Some((stream, packet)) => {
                    if stream.index() != self.stream_index {
                        continue;
                    }
                    if let Err(err) = self.decoder.send_packet(&packet) {
                        log::debug!("skipping undecodable packet: {}", err);
                    }
                }
                None => {
                    self.eof = true;
                    self.decoder
                        .send_eof()
                        .map_err(|e| DetectError::FrameDecode {
                            index: target,
                            reason: format!("flush decoder: {e}"),
                        })?;
                }
            }
        }
    }

    fn current_image(&mut self, index: u64) -> Result<RgbImage, DetectError> {
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&self.current, &mut rgb_frame)
            .map_err(|e| DetectError::FrameDecode {
                index,
                reason: format!("scale frame to RGB: {e}"),
            })?;
        frame_to_image(&rgb_frame).map_err(|reason| DetectError::FrameDecode { index, reason })
    }
}

fn rational_to_f64(value: ffmpeg::Rational) -> Option<f64> {
    if value.numerator() <= 0 || value.denominator() <= 0 {
        return None;
    }
    Some(f64::from(value))
}

fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage, String> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .ok_or("ffmpeg frame is truncated")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(
                data.get(start..start + row_bytes)
                    .ok_or("ffmpeg frame row is out of bounds")?,
            );
        }
        pixels
    };

    RgbImage::from_raw(width, height, pixels).ok_or_else(|| "pixel buffer size mismatch".to_string())
}
