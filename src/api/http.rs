use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{anyhow, Result};

const MAX_HEADER_BYTES: usize = 16 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Oversized bodies are drained up to this many bytes before closing.
const MAX_DRAIN_BYTES: usize = 1024 * 1024;

#[derive(Debug)]
pub(crate) struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn query_usize(&self, key: &str, default: usize) -> Result<usize> {
        match self.query_param(key) {
            None => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|_| anyhow!("query parameter '{}' must be a non-negative integer", key)),
        }
    }
}

/// Outcome of reading one request.
pub(crate) enum ReadOutcome {
    Request(HttpRequest),
    /// Declared body larger than the configured limit.
    TooLarge { declared: usize },
}

pub(crate) fn read_request(stream: &mut TcpStream, max_body_bytes: usize) -> Result<ReadOutcome> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut buf = [0u8; 8192];
    let mut data: Vec<u8> = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before headers completed"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let (method, raw_path, headers) = parse_head(&data[..header_end])?;

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    let mut body = data.split_off(header_end + 4);
    if content_length > max_body_bytes {
        drain(stream, content_length.saturating_sub(body.len()));
        return Ok(ReadOutcome::TooLarge {
            declared: content_length,
        });
    }
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before body completed"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query(query)),
        None => (raw_path.clone(), HashMap::new()),
    };
    Ok(ReadOutcome::Request(HttpRequest {
        method,
        path,
        query,
        body,
    }))
}

fn parse_head(head: &[u8]) -> Result<(String, String, HashMap<String, String>)> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    Ok((method.to_string(), raw_path.to_string(), headers))
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

fn drain(stream: &mut TcpStream, remaining: usize) {
    let mut remaining = remaining.min(MAX_DRAIN_BYTES);
    let mut buf = [0u8; 8192];
    let _ = stream.set_read_timeout(Some(Duration::from_millis(200)));
    while remaining > 0 {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => remaining = remaining.saturating_sub(n),
        }
    }
}

#[derive(Debug)]
pub(crate) struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    /// Sent as an attachment with this filename.
    pub attachment: Option<String>,
}

impl HttpResponse {
    pub fn json<T: serde::Serialize>(status: u16, value: &T) -> Result<Self> {
        Ok(Self {
            status,
            content_type: "application/json",
            body: serde_json::to_vec(value)?,
            attachment: None,
        })
    }

    pub fn error(status: u16, code: &str, detail: impl Into<String>) -> Self {
        let body = serde_json::json!({ "error": code, "detail": detail.into() });
        Self {
            status,
            content_type: "application/json",
            body: body.to_string().into_bytes(),
            attachment: None,
        }
    }

    pub fn attachment(content_type: &'static str, body: Vec<u8>, filename: String) -> Self {
        Self {
            status: 200,
            content_type,
            body,
            attachment: Some(filename),
        }
    }
}

pub(crate) fn write_response(stream: &mut TcpStream, response: &HttpResponse) -> Result<()> {
    let status_line = match response.status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let disposition = response
        .attachment
        .as_ref()
        .map(|name| format!("Content-Disposition: attachment; filename=\"{}\"\r\n", name))
        .unwrap_or_default();
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\n{disposition}Cache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = response.content_type,
        len = response.body.len(),
        disposition = disposition,
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_lowercases_header_names() {
        let (method, path, headers) =
            parse_head(b"POST /api/process/image?filename=a.png HTTP/1.1\r\nContent-Length: 12\r\nHost: x")
                .unwrap();
        assert_eq!(method, "POST");
        assert_eq!(path, "/api/process/image?filename=a.png");
        assert_eq!(headers.get("content-length").map(String::as_str), Some("12"));
        assert!(parse_head(b"").is_err());
    }

    #[test]
    fn query_values_are_percent_decoded() {
        let query = parse_query("filename=Front%20Door.jpg&limit=5&flag");
        assert_eq!(query.get("filename").map(String::as_str), Some("Front Door.jpg"));
        assert_eq!(query.get("limit").map(String::as_str), Some("5"));
        assert_eq!(query.get("flag").map(String::as_str), Some(""));
    }

    #[test]
    fn bad_paging_values_are_errors() {
        let request = HttpRequest {
            method: "GET".into(),
            path: "/api/history".into(),
            query: parse_query("limit=abc"),
            body: Vec::new(),
        };
        assert!(request.query_usize("limit", 100).is_err());
        assert_eq!(request.query_usize("offset", 7).unwrap(), 7);
    }
}
