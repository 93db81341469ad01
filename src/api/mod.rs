//! HTTP surface for the traffic dashboard.
//!
//! A small synchronous server over the standard library, one request at
//! a time: each upload is analyzed start-to-finish on the accept thread
//! before the next connection is taken, matching the single-request
//! model of the analysis core. Routes mirror the dashboard contract:
//! `/` and `/map` serve HTML, `POST /upload` runs an analysis, and
//! `/uploads/<name>` serves the single stored image.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::store::{validate_upload_filename, UploadSlot};
use crate::{AnalysisError, TrafficAnalyzer};

const MAX_HEADER_BYTES: usize = 8192;

const INDEX_HTML: &str = include_str!("../../templates/index.html");
const MAP_HTML: &str = include_str!("../../templates/map.html");

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Upper bound on upload payloads; requests above it are refused
    /// before the body is buffered.
    pub max_upload_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            max_upload_bytes: 16 * 1024 * 1024,
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
    analyzer: TrafficAnalyzer,
    slot: UploadSlot,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, analyzer: TrafficAnalyzer, slot: UploadSlot) -> Self {
        Self {
            cfg,
            analyzer,
            slot,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let listener = TcpListener::bind(&self.cfg.addr)
            .with_context(|| format!("bind api listener on {}", self.cfg.addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let analyzer = self.analyzer;
        let slot = self.slot;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, analyzer, slot, shutdown_thread) {
                log::error!("traffic api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    analyzer: TrafficAnalyzer,
    slot: UploadSlot,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &analyzer, &slot, &cfg) {
                    log::warn!("request failed: {}", err);
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

fn handle_connection(
    mut stream: TcpStream,
    analyzer: &TrafficAnalyzer,
    slot: &UploadSlot,
    cfg: &ApiConfig,
) -> Result<()> {
    let request = match read_request(&mut stream, cfg.max_upload_bytes) {
        Ok(request) => request,
        Err(RequestError::TooLarge) => {
            write_json_response(&mut stream, 413, r#"{"error":"payload too large"}"#)?;
            return Ok(());
        }
        Err(RequestError::Malformed(err)) => {
            write_json_response(&mut stream, 400, r#"{"error":"malformed request"}"#)?;
            return Err(err);
        }
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") => write_response(&mut stream, 200, "text/html; charset=utf-8", INDEX_HTML.as_bytes()),
        ("GET", "/map") => write_response(&mut stream, 200, "text/html; charset=utf-8", MAP_HTML.as_bytes()),
        ("GET", "/health") => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("POST", "/upload") => handle_upload(&mut stream, &request, analyzer, slot),
        ("GET", path) if path.starts_with("/uploads/") => {
            handle_uploaded_file(&mut stream, path, slot)
        }
        (_, "/" | "/map" | "/health" | "/upload") => {
            write_json_response(&mut stream, 405, r#"{"error":"method not allowed"}"#)
        }
        (_, path) if path.starts_with("/uploads/") => {
            write_json_response(&mut stream, 405, r#"{"error":"method not allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not found"}"#),
    }
}

fn handle_upload(
    stream: &mut TcpStream,
    request: &HttpRequest,
    analyzer: &TrafficAnalyzer,
    slot: &UploadSlot,
) -> Result<()> {
    let part = match extract_image_part(request) {
        Ok(part) => part,
        Err(message) => {
            return write_json_response(stream, 400, &error_body(message));
        }
    };

    let kind = match validate_upload_filename(&part.filename) {
        Ok(kind) => kind,
        Err(_) => {
            return write_json_response(stream, 400, &error_body("Invalid file type. Use JPG or PNG"));
        }
    };

    // Overwrite the slot first so the served image always matches the
    // analysis the client receives, even if inference then fails.
    let filename = match slot.store(kind, &part.data) {
        Ok(filename) => filename,
        Err(err) => {
            write_json_response(stream, 500, &error_body("Processing failed: storage error"))?;
            return Err(err);
        }
    };

    match analyzer.analyze_bytes(&part.data) {
        Ok(result) => {
            let mut body =
                serde_json::to_value(&result).context("serialize analysis result")?;
            body["image_url"] = serde_json::Value::String(format!("/uploads/{}", filename));
            write_json_response(stream, 200, &body.to_string())
        }
        Err(err @ AnalysisError::InvalidInput(_)) => {
            write_json_response(stream, 400, &error_body(&format!("Processing failed: {}", err)))
        }
        Err(err @ AnalysisError::DetectionFailure(_)) => {
            write_json_response(stream, 500, &error_body(&format!("Processing failed: {}", err)))
        }
    }
}

fn handle_uploaded_file(stream: &mut TcpStream, path: &str, slot: &UploadSlot) -> Result<()> {
    let filename = path.trim_start_matches("/uploads/");
    match slot.read(filename)? {
        Some((bytes, content_type)) => write_response(stream, 200, content_type, &bytes),
        None => write_json_response(stream, 404, r#"{"error":"not found"}"#),
    }
}

fn error_body(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

// -------------------- Request Parsing --------------------

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

enum RequestError {
    /// Declared body exceeds the configured cap.
    TooLarge,
    Malformed(anyhow::Error),
}

fn read_request(stream: &mut TcpStream, max_body_bytes: usize) -> Result<HttpRequest, RequestError> {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .map_err(|e| RequestError::Malformed(e.into()))?;

    let mut buf = [0u8; 8192];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = find_bytes(&data, b"\r\n\r\n", 0) {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(RequestError::Malformed(anyhow!("request header too large")));
        }
        let n = stream
            .read(&mut buf)
            .map_err(|e| RequestError::Malformed(e.into()))?;
        if n == 0 {
            return Err(RequestError::Malformed(anyhow!(
                "connection closed before headers"
            )));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let header_text = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = header_text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("empty request")))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("missing method")))?
        .to_string();
    let raw_path = parts
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("missing path")))?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let content_length = headers
        .get("content-length")
        .map(|value| value.parse::<usize>())
        .transpose()
        .map_err(|_| RequestError::Malformed(anyhow!("invalid content-length")))?
        .unwrap_or(0);
    if content_length > max_body_bytes {
        return Err(RequestError::TooLarge);
    }

    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream
            .read(&mut buf)
            .map_err(|e| RequestError::Malformed(e.into()))?;
        if n == 0 {
            return Err(RequestError::Malformed(anyhow!(
                "connection closed mid-body"
            )));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method,
        path,
        headers,
        body,
    })
}

// -------------------- Multipart --------------------

struct UploadPart {
    filename: String,
    data: Vec<u8>,
}

struct MultipartPart {
    name: Option<String>,
    filename: Option<String>,
    data: Vec<u8>,
}

fn extract_image_part(request: &HttpRequest) -> Result<UploadPart, &'static str> {
    let content_type = request
        .headers
        .get("content-type")
        .cloned()
        .unwrap_or_default();
    if !content_type
        .to_lowercase()
        .starts_with("multipart/form-data")
    {
        return Err("No image uploaded");
    }
    let boundary = boundary_from_content_type(&content_type).ok_or("No image uploaded")?;
    let parts = parse_multipart(&request.body, &boundary).map_err(|_| "No image uploaded")?;

    let image = parts
        .into_iter()
        .find(|part| part.name.as_deref() == Some("image"))
        .ok_or("No image uploaded")?;
    let filename = image.filename.unwrap_or_default();
    if filename.is_empty() {
        return Err("No file selected");
    }
    Ok(UploadPart {
        filename,
        data: image.data,
    })
}

fn boundary_from_content_type(value: &str) -> Option<String> {
    value
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("boundary="))
        .map(|boundary| boundary.trim_matches('"').to_string())
        .filter(|boundary| !boundary.is_empty())
}

fn parse_multipart(body: &[u8], boundary: &str) -> Result<Vec<MultipartPart>> {
    let opening = format!("--{}", boundary);
    let delimiter = format!("\r\n--{}", boundary);

    let mut parts = Vec::new();
    let mut cursor = find_bytes(body, opening.as_bytes(), 0)
        .ok_or_else(|| anyhow!("multipart boundary not found"))?
        + opening.len();

    loop {
        let rest = body.get(cursor..).unwrap_or_default();
        if rest.starts_with(b"--") {
            break;
        }
        if !rest.starts_with(b"\r\n") {
            return Err(anyhow!("malformed multipart boundary"));
        }
        cursor += 2;

        let header_end = find_bytes(body, b"\r\n\r\n", cursor)
            .ok_or_else(|| anyhow!("multipart part missing header terminator"))?;
        let headers = String::from_utf8_lossy(&body[cursor..header_end]);
        let (name, filename) = parse_part_disposition(&headers);

        let data_start = header_end + 4;
        let data_end = find_bytes(body, delimiter.as_bytes(), data_start)
            .ok_or_else(|| anyhow!("multipart part not terminated"))?;
        parts.push(MultipartPart {
            name,
            filename,
            data: body[data_start..data_end].to_vec(),
        });
        cursor = data_end + delimiter.len();
    }
    Ok(parts)
}

fn parse_part_disposition(headers: &str) -> (Option<String>, Option<String>) {
    for line in headers.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("content-disposition") {
            continue;
        }
        let mut name = None;
        let mut filename = None;
        for param in value.split(';').map(str::trim) {
            if let Some(v) = param.strip_prefix("name=") {
                name = Some(v.trim_matches('"').to_string());
            } else if let Some(v) = param.strip_prefix("filename=") {
                filename = Some(v.trim_matches('"').to_string());
            }
        }
        return (name, filename);
    }
    (None, None)
}

fn find_bytes(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

// -------------------- Responses --------------------

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}
