//! Blocking HTTP service over the detection core and query history.
//!
//! One request is handled at a time on a dedicated thread. Uploads are sent
//! as raw request bodies with the original filename in `?filename=`.

mod http;

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::{ServiceConfig, VideoSamplingConfig};
use crate::detect::{AnnotatedImage, Detection, DetectionPipeline, DetectionResult};
use crate::error::DetectError;
use crate::history::{export_json, HistoryStore, SourceKind};
use crate::media::{self, extension_of, StagedMedia, IMAGE_EXTENSIONS, VIDEO_EXTENSIONS};
use crate::report::{history_csv, render_text_report, workbook_zip, ReportData};
use crate::video::VideoOrchestrator;
use http::{read_request, write_response, HttpRequest, HttpResponse, ReadOutcome};

const DEFAULT_HISTORY_LIMIT: usize = 100;
const REPORT_HISTORY_LIMIT: usize = 500;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub max_upload_bytes: usize,
    pub video: VideoSamplingConfig,
    /// Directory for exported files.
    pub output_dir: PathBuf,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
            max_upload_bytes: 50 * 1024 * 1024,
            video: VideoSamplingConfig::default(),
            output_dir: PathBuf::from("outputs"),
        }
    }
}

impl ApiConfig {
    pub fn from_service(cfg: &ServiceConfig) -> Self {
        Self {
            addr: cfg.api_addr.clone(),
            max_upload_bytes: cfg.max_upload_bytes,
            video: cfg.video,
            output_dir: cfg.output_dir.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    pipeline: DetectionPipeline,
    store: Box<dyn HistoryStore + Send>,
}

impl ApiServer {
    pub fn new(
        cfg: ApiConfig,
        pipeline: DetectionPipeline,
        store: Box<dyn HistoryStore + Send>,
    ) -> Self {
        Self {
            cfg,
            pipeline,
            store,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let mut service = Service {
            orchestrator: VideoOrchestrator::new(self.pipeline),
            store: self.store,
            cfg: self.cfg,
        };
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, &mut service, shutdown_thread) {
                log::error!("detection api stopped: {}", err);
            }
        });

        log::info!("detection api listening on {}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, service: &mut Service, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, service) {
                    log::warn!("detection api request failed: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, service: &mut Service) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        let response = HttpResponse::error(403, "forbidden", "non-loopback peer");
        return write_response(&mut stream, &response);
    }

    let request = match read_request(&mut stream, service.cfg.max_upload_bytes)? {
        ReadOutcome::Request(request) => request,
        ReadOutcome::TooLarge { declared } => {
            log::warn!("rejected {} byte upload", declared);
            let response = HttpResponse::error(
                413,
                "payload_too_large",
                format!(
                    "upload exceeds {} MB",
                    service.cfg.max_upload_bytes / (1024 * 1024)
                ),
            );
            return write_response(&mut stream, &response);
        }
    };

    let response = match service.route(&request) {
        Ok(response) => response,
        Err(err) => {
            log::error!("{} {} failed: {:#}", request.method, request.path, err);
            HttpResponse::error(500, "internal_error", format!("{:#}", err))
        }
    };
    log::debug!("{} {} -> {}", request.method, request.path, response.status);
    write_response(&mut stream, &response)
}

/// JSON body of the processing endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub detections: Vec<Detection>,
    pub detections_count: usize,
    pub processing_time_ms: f64,
    pub annotated_image_b64: Option<String>,
    pub query_id: String,
    pub processed_frames: Option<usize>,
    pub total_frames: Option<u64>,
    pub frames_with_detections: Option<usize>,
    pub fps: Option<f64>,
}

impl ProcessResponse {
    fn from_result(result: DetectionResult, query_id: String) -> Self {
        Self {
            annotated_image_b64: result.annotated.as_ref().map(encode_preview),
            detections_count: result.count,
            processing_time_ms: result.elapsed_ms,
            detections: result.detections,
            query_id,
            processed_frames: None,
            total_frames: None,
            frames_with_detections: None,
            fps: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CameraFrame {
    frame_b64: String,
}

#[derive(Serialize)]
struct HistoryPage<'a> {
    history: &'a [crate::history::QueryRecord],
}

struct Service {
    orchestrator: VideoOrchestrator,
    store: Box<dyn HistoryStore + Send>,
    cfg: ApiConfig,
}

impl Service {
    fn pipeline(&self) -> &DetectionPipeline {
        self.orchestrator.pipeline()
    }

    fn route(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        let method = request.method.as_str();
        let expected = match request.path.as_str() {
            "/health" | "/api/history" | "/api/stats" | "/api/export/json"
            | "/api/export/report" | "/api/export/csv" | "/api/export/workbook" => "GET",
            "/api/process/image" | "/api/process/frame" | "/api/process/video" => "POST",
            _ => return Ok(HttpResponse::error(404, "not_found", request.path.clone())),
        };
        if method != expected {
            return Ok(HttpResponse::error(
                405,
                "method_not_allowed",
                format!("use {}", expected),
            ));
        }

        match request.path.as_str() {
            "/health" => HttpResponse::json(
                200,
                &serde_json::json!({
                    "status": "ok",
                    "backend": format!("{:?}", self.pipeline().backend_status()),
                }),
            ),
            "/api/process/image" => self.process_image(request),
            "/api/process/frame" => self.process_frame(request),
            "/api/process/video" => self.process_video(request),
            "/api/history" => {
                let limit = match request.query_usize("limit", DEFAULT_HISTORY_LIMIT) {
                    Ok(limit) => limit,
                    Err(err) => return Ok(HttpResponse::error(400, "bad_request", err.to_string())),
                };
                let offset = match request.query_usize("offset", 0) {
                    Ok(offset) => offset,
                    Err(err) => return Ok(HttpResponse::error(400, "bad_request", err.to_string())),
                };
                let history = self.store.list(limit, offset)?;
                HttpResponse::json(200, &HistoryPage { history: &history })
            }
            "/api/stats" => HttpResponse::json(200, &self.store.stats()?),
            "/api/export/json" => {
                let path = self.cfg.output_dir.join("history_export.json");
                export_json(&*self.store, &path)?;
                let body = std::fs::read(&path)
                    .with_context(|| format!("read {}", path.display()))?;
                Ok(HttpResponse::attachment(
                    "application/json",
                    body,
                    "history_export.json".to_string(),
                ))
            }
            "/api/export/report" => {
                let data = ReportData::collect(&*self.store, REPORT_HISTORY_LIMIT)?;
                let report = render_text_report(&data);
                let name = format!("report_{}.txt", data.generated_at.format("%Y%m%d_%H%M%S"));
                std::fs::create_dir_all(&self.cfg.output_dir)?;
                std::fs::write(self.cfg.output_dir.join(&name), &report)?;
                Ok(HttpResponse::attachment(
                    "text/plain; charset=utf-8",
                    report.into_bytes(),
                    name,
                ))
            }
            "/api/export/workbook" => {
                let data = ReportData::collect(&*self.store, REPORT_HISTORY_LIMIT)?;
                let name = format!("report_{}.zip", data.generated_at.format("%Y%m%d_%H%M%S"));
                Ok(HttpResponse::attachment(
                    "application/zip",
                    workbook_zip(&data)?,
                    name,
                ))
            }
            _ => {
                let records = self.store.list(REPORT_HISTORY_LIMIT, 0)?;
                Ok(HttpResponse::attachment(
                    "text/csv; charset=utf-8",
                    history_csv(&records)?,
                    "history.csv".to_string(),
                ))
            }
        }
    }

    fn process_image(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        let filename = request.query_param("filename").unwrap_or("image");
        if !has_extension(filename, IMAGE_EXTENSIONS) {
            return Ok(HttpResponse::error(
                400,
                "unsupported_media",
                format!("supported images: {}", IMAGE_EXTENSIONS.join(", ")),
            ));
        }
        if request.body.is_empty() {
            return Ok(HttpResponse::error(400, "empty_upload", "request body is empty"));
        }
        let result = match self.pipeline().detect_bytes(&request.body, false) {
            Ok(result) => result,
            Err(err) => return Ok(backend_unavailable(err)),
        };
        self.respond(SourceKind::Upload, Some(filename), result)
    }

    fn process_frame(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        let frame: CameraFrame = match serde_json::from_slice(&request.body) {
            Ok(frame) => frame,
            Err(err) => return Ok(HttpResponse::error(400, "invalid_json", err.to_string())),
        };
        let encoded = strip_data_url(frame.frame_b64.trim());
        let bytes = match BASE64.decode(encoded) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(HttpResponse::error(400, "invalid_base64", "invalid base64 frame")),
        };
        let result = match self.pipeline().detect_bytes(&bytes, false) {
            Ok(result) => result,
            Err(err) => return Ok(backend_unavailable(err)),
        };
        self.respond(SourceKind::Camera, None, result)
    }

    fn process_video(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        let filename = request.query_param("filename").unwrap_or("video");
        let extension = match extension_of(filename) {
            Some(ext) if VIDEO_EXTENSIONS.contains(&ext.as_str()) => ext,
            _ => {
                return Ok(HttpResponse::error(
                    400,
                    "unsupported_media",
                    format!("supported videos: {}", VIDEO_EXTENSIONS.join(", ")),
                ))
            }
        };
        let staged = StagedMedia::write(&request.body, &extension)?;
        let mut extractor = media::open_video_file(staged.path());
        let video = self.cfg.video;
        let result = match self.orchestrator.detect_video(
            extractor.as_mut(),
            false,
            video.max_frames,
            video.frames_per_second,
        ) {
            Ok(result) => result,
            Err(err) => return Ok(backend_unavailable(err)),
        };
        drop(extractor);
        drop(staged);

        let query_id = self.store.save(
            SourceKind::Video,
            Some(filename),
            &result.result.detections,
            result.result.elapsed_ms,
        )?;
        let mut body = ProcessResponse::from_result(result.result, query_id);
        body.processed_frames = Some(result.processed_frame_count);
        body.total_frames = Some(result.total_frame_count);
        body.frames_with_detections = Some(result.frames_with_any_detection);
        body.fps = Some(result.sampled_fps);
        HttpResponse::json(200, &body)
    }

    fn respond(
        &mut self,
        source: SourceKind,
        filename: Option<&str>,
        result: DetectionResult,
    ) -> Result<HttpResponse> {
        let query_id = self
            .store
            .save(source, filename, &result.detections, result.elapsed_ms)?;
        HttpResponse::json(200, &ProcessResponse::from_result(result, query_id))
    }
}

fn has_extension(filename: &str, allowed: &[&str]) -> bool {
    extension_of(filename).map_or(false, |ext| allowed.contains(&ext.as_str()))
}

fn strip_data_url(encoded: &str) -> &str {
    match encoded.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    }
}

fn encode_preview(preview: &AnnotatedImage) -> String {
    BASE64.encode(&preview.jpeg)
}

fn backend_unavailable(err: DetectError) -> HttpResponse {
    log::error!("{}", err);
    HttpResponse::error(503, "backend_unavailable", err.to_string())
}
