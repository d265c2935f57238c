//! detect_media - run weapon detection on a local image or video

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use weapon_detect::history::{HistoryStore, SourceKind, SqliteHistoryStore};
use weapon_detect::media::{extension_of, open_video_file, VIDEO_EXTENSIONS};
use weapon_detect::{DetectionPipeline, LazyBackend, ServiceConfig, VideoOrchestrator};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Image or video file. `stub://name?frames=N&fps=F` generates a test video.
    input: PathBuf,
    /// Treat the input as a video regardless of its extension.
    #[arg(long)]
    video: bool,
    /// Keep every class the backend reports instead of only weapon classes.
    #[arg(long)]
    all_classes: bool,
    /// Maximum sampled video frames (overrides configuration).
    #[arg(long)]
    max_frames: Option<usize>,
    /// Video sampling rate in frames per second (overrides configuration).
    #[arg(long)]
    fps: Option<f64>,
    /// Write the annotated preview JPEG here.
    #[arg(long, value_name = "PATH")]
    annotated_out: Option<PathBuf>,
    /// Record the query in the history database.
    #[arg(long)]
    record: bool,
    /// UI mode for stderr progress
    #[arg(long, value_enum, default_value = "auto", value_name = "MODE")]
    ui: ui::UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let ui = ui::Ui::new(args.ui);

    let config = ServiceConfig::load()?;
    let pipeline = DetectionPipeline::new(
        config.detector.clone(),
        LazyBackend::from_settings(config.backend.clone()),
    );
    {
        let stage = ui.stage("Load detection backend");
        let classes = pipeline.known_classes()?;
        stage.detail(&format!("{} classes", classes.len()));
        stage.done();
    }

    let input_name = args.input.to_string_lossy().into_owned();
    let is_video = args.video
        || input_name.starts_with("stub://")
        || extension_of(&input_name).map_or(false, |ext| VIDEO_EXTENSIONS.contains(&ext.as_str()));
    let filter = !args.all_classes;

    let (json, result, source) = if is_video {
        let max_frames = args.max_frames.unwrap_or(config.video.max_frames);
        let fps = args.fps.unwrap_or(config.video.frames_per_second);
        if max_frames == 0 || !(fps > 0.0) {
            return Err(anyhow!("--max-frames and --fps must be positive"));
        }
        let stage = ui.stage("Detect video");
        let mut extractor = open_video_file(&args.input);
        let video = VideoOrchestrator::new(pipeline)
            .detect_video(extractor.as_mut(), filter, max_frames, fps)?;
        stage.detail(&format!(
            "{} of {} frames sampled, {} with detections",
            video.processed_frame_count, video.total_frame_count, video.frames_with_any_detection
        ));
        stage.done();
        (serde_json::to_string_pretty(&video)?, video.result, SourceKind::Video)
    } else {
        let stage = ui.stage("Detect image");
        let result = pipeline.detect_path(&args.input, filter)?;
        stage.done();
        (serde_json::to_string_pretty(&result)?, result, SourceKind::Upload)
    };

    if let Some(path) = &args.annotated_out {
        match &result.annotated {
            Some(preview) => {
                let stage = ui.stage("Write annotated preview");
                std::fs::write(path, &preview.jpeg)
                    .with_context(|| format!("write {}", path.display()))?;
                stage.done();
            }
            None => log::warn!("no annotated preview available for {}", input_name),
        }
    }

    if args.record {
        let stage = ui.stage("Record query");
        let mut store = SqliteHistoryStore::open(&config.db_path)?;
        let filename = args
            .input
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        let id = store.save(source, filename.as_deref(), &result.detections, result.elapsed_ms)?;
        stage.detail(&id);
        stage.done();
    }

    println!("{}", json);
    Ok(())
}
