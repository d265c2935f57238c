use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use std::io::{Cursor, Read, Write};
use std::net::TcpStream;
use tempfile::tempdir;
use weapon_detect::api::{ApiConfig, ApiHandle, ApiServer, ProcessResponse};
use weapon_detect::report::WORKBOOK_SHEETS;
use weapon_detect::{
    DetectionPipeline, DetectorConfig, LazyBackend, SqliteHistoryStore, StubBackend,
    VideoSamplingConfig,
};

fn png_bytes() -> Vec<u8> {
    let image = RgbImage::from_pixel(32, 24, Rgb([90, 120, 150]));
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png).expect("encode png");
    bytes.into_inner()
}

fn stub_backend() -> StubBackend {
    StubBackend::new(["pistol", "person"])
        .with_candidate(0, 0.91, [2.0, 2.0, 12.0, 10.0])
        .with_candidate(1, 0.88, [14.0, 4.0, 30.0, 22.0])
}

fn send(api: &TestApi, method: &str, path: &str, body: &[u8]) -> Result<(String, String)> {
    let (headers, body) = send_raw(api, method, path, body)?;
    Ok((headers, String::from_utf8_lossy(&body).into_owned()))
}

fn send_raw(api: &TestApi, method: &str, path: &str, body: &[u8]) -> Result<(String, Vec<u8>)> {
    let mut stream = TcpStream::connect(api.handle().addr)?;
    let head = format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
        method,
        path,
        body.len()
    );
    stream.write_all(head.as_bytes())?;
    stream.write_all(body)?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(response.len());
    let headers = String::from_utf8_lossy(&response[..split]).into_owned();
    let body = response.get(split + 4..).unwrap_or_default().to_vec();
    Ok((headers, body))
}

struct TestApi {
    dir: tempfile::TempDir,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(backend: LazyBackend, max_upload_bytes: usize) -> Result<Self> {
        let dir = tempdir()?;
        let db_path = dir.path().join("history.db");
        let store = SqliteHistoryStore::open(&db_path.to_string_lossy())?;
        let pipeline = DetectionPipeline::new(DetectorConfig::default(), backend);

        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            max_upload_bytes,
            video: VideoSamplingConfig::default(),
            output_dir: dir.path().join("outputs"),
        };
        let api_handle = ApiServer::new(api_config, pipeline, Box::new(store)).spawn()?;

        Ok(Self {
            dir,
            api_handle: Some(api_handle),
        })
    }

    fn with_stub() -> Result<Self> {
        Self::new(LazyBackend::with_backend(stub_backend()), 1024 * 1024)
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

#[test]
fn health_reports_ok() -> Result<()> {
    let api = TestApi::with_stub()?;
    let (headers, body) = send(&api, "GET", "/health", b"")?;
    assert!(headers.contains("200 OK"));
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["status"], "ok");
    Ok(())
}

#[test]
fn image_upload_is_detected_and_recorded() -> Result<()> {
    let api = TestApi::with_stub()?;
    let (headers, body) = send(
        &api,
        "POST",
        "/api/process/image?filename=Front%20Door.PNG",
        &png_bytes(),
    )?;
    assert!(headers.contains("200 OK"), "{}", headers);

    let response: ProcessResponse = serde_json::from_str(&body)?;
    assert_eq!(response.detections_count, 2);
    assert_eq!(response.detections.len(), 2);
    assert!(response.processed_frames.is_none());
    let preview = BASE64.decode(response.annotated_image_b64.expect("preview"))?;
    let decoded = image::load_from_memory(&preview)?;
    assert_eq!((decoded.width(), decoded.height()), (32, 24));

    let (_, body) = send(&api, "GET", "/api/history", b"")?;
    let history: Value = serde_json::from_str(&body)?;
    let records = history["history"].as_array().expect("history array");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["id"], response.query_id.as_str());
    assert_eq!(records[0]["source"], "upload");
    assert_eq!(records[0]["filename"], "Front Door.PNG");
    assert_eq!(records[0]["has_detection"], true);
    Ok(())
}

#[test]
fn image_upload_rejects_unsupported_or_empty_input() -> Result<()> {
    let api = TestApi::with_stub()?;
    let (headers, body) = send(&api, "POST", "/api/process/image?filename=notes.txt", b"abc")?;
    assert!(headers.contains("400 Bad Request"));
    assert!(body.contains("unsupported_media"));

    let (headers, _) = send(&api, "POST", "/api/process/image?filename=a.jpg", b"")?;
    assert!(headers.contains("400 Bad Request"));

    let (_, body) = send(&api, "GET", "/api/stats", b"")?;
    let stats: Value = serde_json::from_str(&body)?;
    assert_eq!(stats["total_queries"], 0);
    Ok(())
}

#[test]
fn undecodable_image_yields_empty_result() -> Result<()> {
    let api = TestApi::with_stub()?;
    let (headers, body) = send(
        &api,
        "POST",
        "/api/process/image?filename=broken.jpg",
        b"definitely not a jpeg",
    )?;
    assert!(headers.contains("200 OK"));
    let response: ProcessResponse = serde_json::from_str(&body)?;
    assert_eq!(response.detections_count, 0);
    assert!(response.annotated_image_b64.is_none());
    Ok(())
}

#[test]
fn camera_frame_accepts_data_url() -> Result<()> {
    let api = TestApi::with_stub()?;
    let payload = serde_json::json!({
        "frame_b64": format!("data:image/png;base64,{}", BASE64.encode(png_bytes())),
    });
    let (headers, body) = send(&api, "POST", "/api/process/frame", payload.to_string().as_bytes())?;
    assert!(headers.contains("200 OK"), "{}", headers);
    let response: ProcessResponse = serde_json::from_str(&body)?;
    assert_eq!(response.detections_count, 2);

    let (_, body) = send(&api, "GET", "/api/stats", b"")?;
    let stats: Value = serde_json::from_str(&body)?;
    assert_eq!(stats["total_queries"], 1);
    assert_eq!(stats["by_source"]["camera"], 1);
    Ok(())
}

#[test]
fn camera_frame_rejects_bad_payloads() -> Result<()> {
    let api = TestApi::with_stub()?;
    let (headers, body) = send(&api, "POST", "/api/process/frame", br#"{"frame_b64":"@@@"}"#)?;
    assert!(headers.contains("400 Bad Request"));
    assert!(body.contains("invalid_base64"));

    let (headers, body) = send(&api, "POST", "/api/process/frame", b"{not json")?;
    assert!(headers.contains("400 Bad Request"));
    assert!(body.contains("invalid_json"));
    Ok(())
}

#[test]
fn unreadable_video_reports_single_sample() -> Result<()> {
    let api = TestApi::with_stub()?;
    let (headers, body) = send(
        &api,
        "POST",
        "/api/process/video?filename=clip.mp4",
        b"not a real container",
    )?;
    assert!(headers.contains("200 OK"), "{}", headers);
    let response: ProcessResponse = serde_json::from_str(&body)?;
    assert_eq!(response.detections_count, 0);
    assert_eq!(response.processed_frames, Some(1));
    assert_eq!(response.total_frames, Some(0));
    assert_eq!(response.frames_with_detections, Some(0));
    assert_eq!(response.fps, Some(30.0));

    let (headers, _) = send(&api, "POST", "/api/process/video?filename=clip.gif", b"x")?;
    assert!(headers.contains("400 Bad Request"));
    Ok(())
}

#[test]
fn oversized_upload_is_rejected() -> Result<()> {
    let api = TestApi::new(LazyBackend::with_backend(stub_backend()), 1024)?;
    let (headers, body) = send(
        &api,
        "POST",
        "/api/process/image?filename=big.png",
        &vec![0u8; 4096],
    )?;
    assert!(headers.contains("413 Payload Too Large"));
    assert!(body.contains("payload_too_large"));
    Ok(())
}

#[test]
fn unknown_paths_and_methods_are_rejected() -> Result<()> {
    let api = TestApi::with_stub()?;
    let (headers, _) = send(&api, "GET", "/api/nothing", b"")?;
    assert!(headers.contains("404 Not Found"));

    let (headers, _) = send(&api, "GET", "/api/process/image", b"")?;
    assert!(headers.contains("405 Method Not Allowed"));

    let (headers, _) = send(&api, "POST", "/api/history", b"")?;
    assert!(headers.contains("405 Method Not Allowed"));
    Ok(())
}

#[test]
fn history_rejects_bad_paging() -> Result<()> {
    let api = TestApi::with_stub()?;
    let (headers, _) = send(&api, "GET", "/api/history?limit=-3", b"")?;
    assert!(headers.contains("400 Bad Request"));
    Ok(())
}

#[test]
fn backend_failure_returns_service_unavailable() -> Result<()> {
    let backend = LazyBackend::new(|| {
        Err(weapon_detect::DetectError::Initialization(
            "model missing".into(),
        ))
    });
    let api = TestApi::new(backend, 1024 * 1024)?;
    let (headers, body) = send(&api, "POST", "/api/process/image?filename=a.png", &png_bytes())?;
    assert!(headers.contains("503 Service Unavailable"));
    assert!(body.contains("model missing"));

    let (_, body) = send(&api, "GET", "/health", b"")?;
    assert!(body.contains("Failed"));
    Ok(())
}

#[test]
fn exports_are_sent_as_attachments() -> Result<()> {
    let api = TestApi::with_stub()?;
    send(&api, "POST", "/api/process/image?filename=a.png", &png_bytes())?;

    let (headers, body) = send(&api, "GET", "/api/export/csv", b"")?;
    assert!(headers.contains("filename=\"history.csv\""));
    assert_eq!(body.lines().count(), 2);

    let (headers, body) = send(&api, "GET", "/api/export/json", b"")?;
    assert!(headers.contains("filename=\"history_export.json\""));
    let records: Value = serde_json::from_str(&body)?;
    assert_eq!(records.as_array().map(Vec::len), Some(1));
    assert!(api.dir.path().join("outputs/history_export.json").is_file());

    let (headers, body) = send(&api, "GET", "/api/export/report", b"")?;
    assert!(headers.contains("text/plain"));
    assert!(headers.contains("filename=\"report_"));
    assert!(body.contains("pistol"));
    Ok(())
}

#[test]
fn workbook_export_bundles_every_sheet() -> Result<()> {
    let api = TestApi::with_stub()?;
    send(&api, "POST", "/api/process/image?filename=a.png", &png_bytes())?;

    let (headers, body) = send_raw(&api, "GET", "/api/export/workbook", b"")?;
    assert!(headers.contains("200 OK"), "{}", headers);
    assert!(headers.contains("application/zip"));
    assert!(headers.contains("filename=\"report_"));

    let mut archive = zip::ZipArchive::new(Cursor::new(body))?;
    for sheet in WORKBOOK_SHEETS {
        let mut contents = String::new();
        archive.by_name(sheet)?.read_to_string(&mut contents)?;
        assert!(contents.lines().count() >= 2, "{} is empty", sheet);
    }

    let mut detections = String::new();
    archive
        .by_name("detections.csv")?
        .read_to_string(&mut detections)?;
    assert!(detections.contains(",upload,pistol,91.0,"));
    assert!(detections.contains(",upload,person,88.0,"));
    Ok(())
}
