use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::Value;
use tempfile::tempdir;

use traffic_monitor::api::{ApiConfig, ApiHandle, ApiServer};
use traffic_monitor::{Detection, StubBackend, TrafficAnalyzer, UploadSlot};

const BOUNDARY: &str = "trafficmonitorboundary";

fn detection(class_id: u32) -> Detection {
    Detection {
        x: 0.1,
        y: 0.1,
        w: 0.2,
        h: 0.2,
        confidence: 0.9,
        class_id,
    }
}

fn png_bytes() -> Vec<u8> {
    let image = image::RgbImage::from_pixel(8, 8, image::Rgb([90, 90, 90]));
    let mut bytes = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, image::ImageFormat::Png)
        .expect("encode test png");
    bytes.into_inner()
}

struct TestApi {
    _dir: tempfile::TempDir,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(backend: StubBackend) -> Result<Self> {
        Self::with_config(backend, ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ApiConfig::default()
        })
    }

    fn with_config(backend: StubBackend, mut cfg: ApiConfig) -> Result<Self> {
        let dir = tempdir()?;
        cfg.addr = "127.0.0.1:0".to_string();
        let slot = UploadSlot::open(dir.path().join("uploads"))?;
        let analyzer = TrafficAnalyzer::new(Arc::new(Mutex::new(backend)));
        let api_handle = ApiServer::new(cfg, analyzer, slot).spawn()?;
        Ok(Self {
            _dir: dir,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn send(&self, request: &[u8]) -> Result<(String, Vec<u8>)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        stream.write_all(request)?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response)?;
        let split = response
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .unwrap_or(response.len());
        let headers = String::from_utf8_lossy(&response[..split]).to_string();
        let body = response.get(split + 4..).unwrap_or_default().to_vec();
        Ok((headers, body))
    }

    fn get(&self, path: &str) -> Result<(String, Vec<u8>)> {
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        self.send(request.as_bytes())
    }

    fn upload(&self, filename: &str, payload: &[u8]) -> Result<(String, Vec<u8>)> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"image\"; filename=\"{filename}\"\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(payload);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        let mut request = format!(
            "POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Type: multipart/form-data; boundary={BOUNDARY}\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(&body);
        self.send(&request)
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
fn upload_returns_analysis_and_serves_the_image() -> Result<()> {
    let backend = StubBackend::with_detections(vec![
        detection(2),
        detection(2),
        detection(3),
        detection(7),
    ]);
    let api = TestApi::new(backend)?;

    let payload = png_bytes();
    let (headers, body) = api.upload("cam.png", &payload)?;
    assert!(headers.contains("200 OK"), "headers: {headers}");

    let value: Value = serde_json::from_slice(&body)?;
    assert_eq!(value["total_vehicles"], 4);
    assert_eq!(value["vehicle_counts"]["car"], 2);
    assert_eq!(value["vehicle_counts"]["motorcycle"], 1);
    assert_eq!(value["vehicle_counts"]["bus"], 0);
    assert_eq!(value["vehicle_counts"]["truck"], 1);
    assert_eq!(value["density"], "Low");
    assert_eq!(value["density_color"], "#4CAF50");
    assert_eq!(value["green_duration"], 30);
    assert_eq!(value["image_url"], "/uploads/latest_upload.png");

    let (headers, served) = api.get("/uploads/latest_upload.png")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("image/png"));
    assert_eq!(served, payload);
    Ok(())
}

#[test]
fn new_upload_destroys_the_previous_image() -> Result<()> {
    let api = TestApi::new(StubBackend::with_detections(Vec::new()))?;
    let payload = png_bytes();

    let (headers, _) = api.upload("first.png", &payload)?;
    assert!(headers.contains("200 OK"));

    // The decoder sniffs content, so png bytes under a .jpg name are
    // accepted and land in the jpg slot.
    let (headers, _) = api.upload("second.jpg", &payload)?;
    assert!(headers.contains("200 OK"));

    let (headers, _) = api.get("/uploads/latest_upload.png")?;
    assert!(headers.contains("404 Not Found"));
    let (headers, _) = api.get("/uploads/latest_upload.jpg")?;
    assert!(headers.contains("200 OK"));
    Ok(())
}

#[test]
fn upload_without_image_part_is_rejected() -> Result<()> {
    let api = TestApi::new(StubBackend::new())?;

    let request = b"POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n";
    let (headers, body) = api.send(request)?;
    assert!(headers.contains("400 Bad Request"));
    let value: Value = serde_json::from_slice(&body)?;
    assert_eq!(value["error"], "No image uploaded");
    Ok(())
}

#[test]
fn upload_with_bad_extension_is_rejected() -> Result<()> {
    let api = TestApi::new(StubBackend::new())?;

    let (headers, body) = api.upload("clip.gif", &png_bytes())?;
    assert!(headers.contains("400 Bad Request"));
    let value: Value = serde_json::from_slice(&body)?;
    assert_eq!(value["error"], "Invalid file type. Use JPG or PNG");
    Ok(())
}

#[test]
fn undecodable_upload_is_rejected() -> Result<()> {
    let api = TestApi::new(StubBackend::new())?;

    let (headers, body) = api.upload("cam.png", b"not really a png")?;
    assert!(headers.contains("400 Bad Request"));
    let value: Value = serde_json::from_slice(&body)?;
    let message = value["error"].as_str().unwrap_or_default();
    assert!(message.starts_with("Processing failed"), "got: {message}");
    Ok(())
}

#[test]
fn oversized_upload_is_rejected() -> Result<()> {
    let api = TestApi::with_config(
        StubBackend::new(),
        ApiConfig {
            addr: String::new(),
            max_upload_bytes: 1024,
        },
    )?;

    let (headers, _) = api.upload("cam.png", &vec![0u8; 2048])?;
    assert!(headers.contains("413 Payload Too Large"), "headers: {headers}");
    Ok(())
}

#[test]
fn dashboard_pages_and_health_are_served() -> Result<()> {
    let api = TestApi::new(StubBackend::new())?;

    let (headers, body) = api.get("/")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("text/html"));
    assert!(String::from_utf8_lossy(&body).contains("<html"));

    let (headers, body) = api.get("/map")?;
    assert!(headers.contains("200 OK"));
    assert!(String::from_utf8_lossy(&body).contains("Density legend"));

    let (headers, body) = api.get("/health")?;
    assert!(headers.contains("200 OK"));
    let value: Value = serde_json::from_slice(&body)?;
    assert_eq!(value["status"], "ok");
    Ok(())
}

#[test]
fn unknown_paths_and_methods_are_rejected() -> Result<()> {
    let api = TestApi::new(StubBackend::new())?;

    let (headers, _) = api.get("/nope")?;
    assert!(headers.contains("404 Not Found"));

    let (headers, _) = api.get("/upload")?;
    assert!(headers.contains("405 Method Not Allowed"));

    let (headers, _) = api.get("/uploads/latest_upload.png")?;
    assert!(headers.contains("404 Not Found"));
    Ok(())
}
