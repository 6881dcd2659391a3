//! Minimal HTTP/1.1 request parsing and response writing.
//!
//! One request per connection; every response closes the connection.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::Duration;

const MAX_HEAD_BYTES: usize = 8192;
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub(crate) struct HttpRequest {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) query: HashMap<String, String>,
    pub(crate) headers: HashMap<String, String>,
    /// Body bytes that arrived together with the head.
    pub(crate) body_prefix: Vec<u8>,
}

impl HttpRequest {
    pub(crate) fn content_length(&self) -> Option<usize> {
        self.headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
    }

    pub(crate) fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }
}

pub(crate) fn head_read_timeout() -> Option<Duration> {
    Some(HEAD_READ_TIMEOUT)
}

pub(crate) fn read_request<R: Read>(stream: &mut R) -> Result<HttpRequest> {
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let head_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEAD_BYTES {
            return Err(anyhow!("request head too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request head"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let body_prefix = data[head_end + 4..].to_vec();
    let text = String::from_utf8_lossy(&data[..head_end]);
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

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw_path, HashMap::new()),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path: decode_path(path),
        query,
        headers,
        body_prefix,
    })
}

/// Read the rest of the body announced by `Content-Length`.
pub(crate) fn read_body<R: Read>(stream: &mut R, request: &HttpRequest, limit: usize) -> Result<Vec<u8>> {
    let length = request
        .content_length()
        .ok_or_else(|| anyhow!("missing content-length"))?;
    if length > limit {
        return Err(anyhow!("body of {} bytes exceeds limit of {}", length, limit));
    }
    let mut body = request.body_prefix.clone();
    body.truncate(length);
    let mut remaining = length - body.len();
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len());
        let n = stream.read(&mut buf[..want])?;
        if n == 0 {
            return Err(anyhow!("connection closed with {} body bytes missing", remaining));
        }
        body.extend_from_slice(&buf[..n]);
        remaining -= n;
    }
    Ok(body)
}

/// Read and drop what is left of a declared body, at most `cap` bytes. Stops
/// early at EOF or on a read error. Returns the number of bytes dropped.
pub(crate) fn discard_body<R: Read>(stream: &mut R, request: &HttpRequest, cap: usize) -> usize {
    let declared = request.content_length().unwrap_or(0);
    let mut remaining = declared.saturating_sub(request.body_prefix.len()).min(cap);
    let mut discarded = 0;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(buf.len());
        match stream.read(&mut buf[..want]) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                remaining -= n;
                discarded += n;
            }
        }
    }
    discarded
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode_query_component(k), decode_query_component(v)),
            None => (decode_query_component(pair), String::new()),
        })
        .collect()
}

/// Percent-decode a path; `+` is a literal plus here.
fn decode_path(raw: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(raw.as_bytes())).into_owned()
}

/// Form-style query decoding: `+` is a space.
fn decode_query_component(raw: &str) -> String {
    decode_path(&raw.replace('+', " "))
}

pub(crate) fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        201 => "HTTP/1.1 201 Created",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        411 => "HTTP/1.1 411 Length Required",
        413 => "HTTP/1.1 413 Payload Too Large",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

pub(crate) fn write_json_response<W: Write>(stream: &mut W, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

pub(crate) fn write_response<W: Write>(
    stream: &mut W,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line(status),
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}
