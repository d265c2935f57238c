//! Video detection: frame sampling, per-frame scoring, aggregation and
//! representative frame selection.

use std::time::Instant;

use image::RgbImage;

use crate::detect::{Detection, DetectionPipeline, DetectionResult, VideoDetectionResult};
use crate::error::DetectError;
use crate::media::{FrameExtractor, VideoInfo, DEFAULT_SOURCE_FPS};
use crate::round_to;

/// Frame indices to score: every `floor(source_fps / target_fps)`-th frame
/// below `total_frames`, at most `max_frames` of them. An unknown or zero
/// frame count falls back to `[0]`. A zero cap yields no samples.
pub fn sample_indices(
    total_frames: u64,
    source_fps: f64,
    target_fps: f64,
    max_frames: usize,
) -> Vec<u64> {
    let ratio = source_fps / target_fps;
    let stride = if ratio.is_finite() && ratio >= 1.0 {
        ratio.floor() as u64
    } else {
        1
    };
    let mut indices: Vec<u64> = (0..total_frames)
        .step_by(stride as usize)
        .take(max_frames)
        .collect();
    if indices.is_empty() && max_frames > 0 {
        indices.push(0);
    }
    indices
}

/// Sampled frame with the most detections so far.
struct BestFrame {
    index: u64,
    count: usize,
    image: RgbImage,
    detections: Vec<Detection>,
}

/// Drives a [`DetectionPipeline`] across the sampled frames of a video.
#[derive(Clone)]
pub struct VideoOrchestrator {
    pipeline: DetectionPipeline,
}

impl VideoOrchestrator {
    pub fn new(pipeline: DetectionPipeline) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &DetectionPipeline {
        &self.pipeline
    }

    /// Sample, score and aggregate one video.
    ///
    /// Unreadable frames are skipped and an unreadable container yields an
    /// empty result. Only a backend initialization failure is returned as an
    /// error. Frames are scored sequentially in index order.
    pub fn detect_video(
        &self,
        video: &mut dyn FrameExtractor,
        filter_to_target_classes: bool,
        max_frames: usize,
        frames_per_second: f64,
    ) -> Result<VideoDetectionResult, DetectError> {
        let known_classes = self.pipeline.known_classes()?;
        let start = Instant::now();

        let (info, readable) = match video.open() {
            Ok(info) => (info, true),
            Err(err) => {
                log::warn!("video unreadable, returning empty result: {}", err);
                (
                    VideoInfo {
                        fps: None,
                        total_frames: 0,
                    },
                    false,
                )
            }
        };
        let source_fps = info
            .fps
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .unwrap_or(DEFAULT_SOURCE_FPS);
        let indices = sample_indices(info.total_frames, source_fps, frames_per_second, max_frames);
        log::debug!(
            "sampling {} of {} frames (source {:.2} fps, target {:.2} fps)",
            indices.len(),
            info.total_frames,
            source_fps,
            frames_per_second
        );

        let mut detections = Vec::new();
        let mut frames_with_any_detection = 0;
        let mut best: Option<BestFrame> = None;

        for &index in indices.iter().filter(|_| readable) {
            let frame = match video.read_frame(index) {
                Ok(frame) => frame,
                Err(err) => {
                    log::warn!("frame {} skipped: {}", index, err);
                    continue;
                }
            };
            let scored = self.pipeline.score_frame(&frame, filter_to_target_classes)?;
            if scored.detections.is_empty() {
                continue;
            }

            frames_with_any_detection += 1;
            let time_offset_sec = round_to(index as f64 / source_fps, 1);
            detections.extend(
                scored
                    .detections
                    .iter()
                    .map(|detection| detection.at_frame(index, time_offset_sec)),
            );

            let count = scored.detections.len();
            if best.as_ref().map_or(true, |current| count > current.count) {
                best = Some(BestFrame {
                    index,
                    count,
                    image: frame,
                    detections: scored.detections,
                });
            }
        }

        let annotated = match best {
            Some(best) => {
                log::debug!("best frame {} with {} detections", best.index, best.count);
                self.pipeline.render(&best.image, &best.detections)
            }
            None if readable => match indices.first().map(|&index| video.read_frame(index)) {
                Some(Ok(frame)) => self.pipeline.render(&frame, &[]),
                Some(Err(err)) => {
                    log::warn!("no preview frame available: {}", err);
                    None
                }
                None => None,
            },
            None => None,
        };

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        Ok(VideoDetectionResult {
            result: DetectionResult::new(detections, elapsed_ms, annotated, known_classes),
            processed_frame_count: indices.len(),
            total_frame_count: info.total_frames,
            frames_with_any_detection,
            sampled_fps: round_to(source_fps, 1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use crate::detect::{ClassTaxonomy, DetectorBackend, LazyBackend, ScoreParams, ScoredBox};
    use crate::media::FrameSequence;
    use image::Rgb;

    /// Emits as many detections as the red channel of pixel (0, 0).
    struct PixelCountBackend {
        taxonomy: ClassTaxonomy,
    }

    impl DetectorBackend for PixelCountBackend {
        fn name(&self) -> &'static str {
            "pixel-count"
        }

        fn taxonomy(&self) -> &ClassTaxonomy {
            &self.taxonomy
        }

        fn score(
            &mut self,
            image: &RgbImage,
            _params: ScoreParams,
        ) -> Result<Vec<ScoredBox>, DetectError> {
            let count = image.get_pixel(0, 0)[0];
            Ok((0..count)
                .map(|i| ScoredBox {
                    class_id: 0,
                    confidence: 0.9,
                    bbox: [i as f32, 0.0, i as f32 + 2.0, 2.0],
                })
                .collect())
        }
    }

    fn orchestrator() -> VideoOrchestrator {
        let backend = PixelCountBackend {
            taxonomy: ClassTaxonomy::from_labels(["pistol"]),
        };
        VideoOrchestrator::new(DetectionPipeline::new(
            DetectorConfig::default(),
            LazyBackend::with_backend(backend),
        ))
    }

    fn frame(detections: u8) -> Option<RgbImage> {
        Some(RgbImage::from_pixel(8, 8, Rgb([detections, 0, 0])))
    }

    #[test]
    fn stride_follows_source_and_target_rate() {
        assert_eq!(sample_indices(120, 30.0, 1.0, 60), vec![0, 30, 60, 90]);
        assert_eq!(sample_indices(10, 30.0, 60.0, 60), (0..10).collect::<Vec<_>>());
        assert_eq!(sample_indices(1000, 10.0, 1.0, 3), vec![0, 10, 20]);
        assert_eq!(sample_indices(0, 30.0, 1.0, 60), vec![0]);
    }

    #[test]
    fn zero_cap_samples_nothing() {
        assert!(sample_indices(120, 30.0, 1.0, 0).is_empty());
        assert!(sample_indices(0, 30.0, 1.0, 0).is_empty());

        let mut video = FrameSequence::new(vec![frame(1); 120], Some(30.0));
        let result = orchestrator().detect_video(&mut video, true, 0, 1.0).unwrap();
        assert_eq!(result.processed_frame_count, 0);
        assert_eq!(result.total_frame_count, 120);
        assert_eq!(result.result.count, 0);
        assert!(result.result.annotated.is_none());
    }

    #[test]
    fn detections_are_tagged_with_frame_and_time() {
        let mut frames = vec![frame(0); 90];
        frames[30] = frame(2);
        let mut video = FrameSequence::new(frames, Some(30.0));

        let result = orchestrator().detect_video(&mut video, true, 60, 1.0).unwrap();
        assert_eq!(result.processed_frame_count, 3);
        assert_eq!(result.total_frame_count, 90);
        assert_eq!(result.frames_with_any_detection, 1);
        assert_eq!(result.result.count, 2);
        assert!(result
            .result
            .detections
            .iter()
            .all(|d| d.frame_index == Some(30) && d.time_offset_sec == Some(1.0)));
        assert_eq!(result.sampled_fps, 30.0);
    }

    #[test]
    fn best_frame_prefers_earliest_on_ties() {
        // Sampled frames 0, 10, 20 carry 2, 2 and 1 detections. Frame 10 is
        // green so the preview shows which one won.
        let mut frames = vec![frame(0); 30];
        frames[0] = frame(2);
        frames[10] = Some(RgbImage::from_pixel(8, 8, Rgb([2, 220, 0])));
        frames[20] = frame(1);
        let mut video = FrameSequence::new(frames, Some(10.0));

        let result = orchestrator().detect_video(&mut video, true, 60, 1.0).unwrap();
        assert_eq!(result.frames_with_any_detection, 3);
        assert_eq!(result.result.count, 5);
        let frame_order: Vec<_> = result.result.detections.iter().map(|d| d.frame_index).collect();
        assert!(frame_order.windows(2).all(|pair| pair[0] <= pair[1]));

        let preview = result.result.annotated.expect("preview");
        let decoded = image::load_from_memory(&preview.jpeg).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (8, 8));
        assert!(decoded.get_pixel(6, 6)[1] < 100, "preview came from frame 10");
    }

    #[test]
    fn unknown_frame_count_samples_first_frame() {
        let mut video = FrameSequence::new(vec![frame(1)], None).with_reported_total(0);
        let result = orchestrator().detect_video(&mut video, true, 60, 1.0).unwrap();
        assert_eq!(result.processed_frame_count, 1);
        assert_eq!(result.total_frame_count, 0);
        assert_eq!(result.result.count, 1);
        assert_eq!(result.sampled_fps, 30.0);
    }

    #[test]
    fn unreadable_frames_are_skipped() {
        let mut frames = vec![frame(0); 4];
        frames[0] = None;
        frames[2] = frame(1);
        frames[3] = None;
        let mut video = FrameSequence::new(frames, Some(1.0));

        let result = orchestrator().detect_video(&mut video, true, 60, 1.0).unwrap();
        assert_eq!(result.processed_frame_count, 4);
        assert_eq!(result.frames_with_any_detection, 1);
        assert_eq!(result.result.detections[0].frame_index, Some(2));
    }

    #[test]
    fn no_detections_still_yields_plain_preview() {
        let mut video = FrameSequence::new(vec![frame(0); 60], Some(30.0));
        let result = orchestrator().detect_video(&mut video, true, 60, 1.0).unwrap();
        assert_eq!(result.result.count, 0);
        assert!(result.result.annotated.is_some());
    }

    #[test]
    fn undecodable_video_is_empty_without_preview() {
        let mut video = FrameSequence::new(vec![None, None, None], Some(1.0));
        let result = orchestrator().detect_video(&mut video, true, 60, 1.0).unwrap();
        assert_eq!(result.result.count, 0);
        assert!(result.result.annotated.is_none());

        let mut broken = FrameSequence::unreadable();
        let result = orchestrator().detect_video(&mut broken, true, 60, 1.0).unwrap();
        assert_eq!(result.result.count, 0);
        assert_eq!(result.processed_frame_count, 1);
        assert!(result.result.annotated.is_none());
    }

    #[test]
    fn backend_initialization_failure_is_fatal() {
        let orchestrator = VideoOrchestrator::new(DetectionPipeline::new(
            DetectorConfig::default(),
            LazyBackend::new(|| Err(DetectError::Initialization("no model".into()))),
        ));
        let mut video = FrameSequence::new(vec![frame(1)], Some(1.0));
        let err = orchestrator.detect_video(&mut video, true, 60, 1.0).unwrap_err();
        assert!(err.is_fatal());
    }
}
