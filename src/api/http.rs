use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub(crate) struct HttpRequest {
    pub method: String,
    pub path: String,
    pub raw_path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Why a request could not be read; each maps to a response.
#[derive(Debug)]
pub(crate) enum ReadError {
    Malformed(anyhow::Error),
    LengthRequired,
    TooLarge(usize),
    Io(std::io::Error),
}

impl From<std::io::Error> for ReadError {
    fn from(err: std::io::Error) -> Self {
        ReadError::Io(err)
    }
}

pub(crate) fn read_request(
    stream: &mut TcpStream,
    max_body_bytes: usize,
) -> std::result::Result<HttpRequest, ReadError> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = find_subslice(&data, b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(ReadError::Malformed(anyhow!("request headers too large")));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(ReadError::Malformed(anyhow!("connection closed mid-headers")));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut request = parse_head(&head).map_err(ReadError::Malformed)?;

    let content_length = match request.headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| ReadError::Malformed(anyhow!("invalid content-length")))?,
        None if request.method == "POST" => return Err(ReadError::LengthRequired),
        None => 0,
    };
    if content_length > max_body_bytes {
        return Err(ReadError::TooLarge(content_length));
    }

    let mut body = data.split_off(header_end + 4);
    if body.len() > content_length {
        body.truncate(content_length);
    }
    body.reserve(content_length - body.len());
    while body.len() < content_length {
        let want = (content_length - body.len()).min(buf.len());
        let n = stream.read(&mut buf[..want])?;
        if n == 0 {
            return Err(ReadError::Malformed(anyhow!(
                "connection closed after {} of {} body bytes",
                body.len(),
                content_length
            )));
        }
        body.extend_from_slice(&buf[..n]);
    }
    request.body = body;
    Ok(request)
}

fn parse_head(head: &str) -> Result<HttpRequest> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        raw_path: raw_path.to_string(),
        headers,
        body: Vec::new(),
    })
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        let query = self.raw_path.split_once('?')?.1;
        query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (k == key).then_some(v)
        })
    }

    pub fn has_query_token(&self) -> bool {
        self.query_param("token").is_some()
    }
}

pub(crate) fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

pub(crate) fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let header = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status = status,
        reason = reason_phrase(status),
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
